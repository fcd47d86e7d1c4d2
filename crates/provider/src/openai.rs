use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use types::{
    Context, Decision, FunctionDecl, Message, MessageRole, Provider, ProviderError, ProviderId,
    ToolCall,
};

use crate::{CHAT_COMPLETIONS_PATH, DEFAULT_REQUEST_TIMEOUT, extract_http_error_message};

/// Non-streaming chat completions against any OpenAI-compatible endpoint
/// (OpenAI, OpenRouter, Ollama).
#[derive(Debug, Clone)]
pub struct OpenAICompatibleProvider {
    client: Client,
    provider_id: ProviderId,
    base_url: String,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl OpenAICompatibleProvider {
    pub fn new(
        provider_id: ProviderId,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|error| ProviderError::RequestFailed {
                provider: provider_id.clone(),
                message: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self {
            client,
            provider_id,
            base_url: base_url.into().trim().trim_end_matches('/').to_owned(),
            api_key,
            max_tokens: None,
            temperature: None,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH)
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.chat_completions_url());
        match &self.api_key {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    async fn decide(&self, context: &Context) -> Result<Decision, ProviderError> {
        tracing::debug!(
            provider = %self.provider_id,
            model = %context.model,
            messages = context.messages.len(),
            "sending chat completion request"
        );

        let mut request = OpenAIChatCompletionRequest::from_context(context)?;
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;

        let http_response = self
            .request_builder()
            .json(&request)
            .send()
            .await
            .map_err(|error| ProviderError::Transport {
                provider: self.provider_id.clone(),
                message: error.to_string(),
            })?;

        if !http_response.status().is_success() {
            let status = http_response.status().as_u16();
            let body = match http_response.text().await {
                Ok(text) => text,
                Err(error) => format!("unable to read error body: {error}"),
            };
            return Err(ProviderError::HttpStatus {
                provider: self.provider_id.clone(),
                status,
                message: extract_http_error_message(&body),
            });
        }

        let response: OpenAIChatCompletionResponse =
            http_response
                .json()
                .await
                .map_err(|error| ProviderError::ResponseParse {
                    provider: self.provider_id.clone(),
                    message: error.to_string(),
                })?;
        normalize_openai_response(response, &self.provider_id)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAIChatCompletionRequest {
    pub(crate) model: String,
    pub(crate) messages: Vec<OpenAIChatMessageRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) tools: Vec<OpenAIRequestToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) temperature: Option<f32>,
    stream: bool,
}

impl OpenAIChatCompletionRequest {
    pub(crate) fn from_context(context: &Context) -> Result<Self, ProviderError> {
        let messages = context
            .messages
            .iter()
            .map(OpenAIChatMessageRequest::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let tools = context
            .tools
            .iter()
            .map(OpenAIRequestToolDefinition::from)
            .collect::<Vec<_>>();
        let tool_choice = (!tools.is_empty()).then_some("auto".to_owned());
        Ok(Self {
            model: context.model.0.clone(),
            messages,
            tools,
            tool_choice,
            max_tokens: None,
            temperature: None,
            stream: false,
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAIChatMessageRequest {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAIRequestToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl TryFrom<&Message> for OpenAIChatMessageRequest {
    type Error = ProviderError;

    fn try_from(value: &Message) -> Result<Self, Self::Error> {
        let tool_calls = value
            .tool_calls
            .iter()
            .map(OpenAIRequestToolCall::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            role: message_role_to_openai_role(&value.role).to_owned(),
            content: value.content.clone(),
            tool_calls,
            tool_call_id: value.tool_call_id.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequestToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAIRequestFunction,
}

impl TryFrom<&ToolCall> for OpenAIRequestToolCall {
    type Error = ProviderError;

    fn try_from(value: &ToolCall) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.clone(),
            kind: "function".to_owned(),
            function: OpenAIRequestFunction {
                name: value.name.clone(),
                arguments: serde_json::to_string(&value.arguments)?,
            },
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAIRequestToolDefinition {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAIRequestFunctionDecl,
}

impl From<&FunctionDecl> for OpenAIRequestToolDefinition {
    fn from(value: &FunctionDecl) -> Self {
        Self {
            kind: "function".to_owned(),
            function: OpenAIRequestFunctionDecl {
                name: value.name.clone(),
                description: value.description.clone(),
                parameters: value.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequestFunctionDecl {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct OpenAIRequestFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIChatCompletionResponse {
    pub(crate) choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIChoice {
    pub(crate) message: OpenAIChatMessageResponse,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIChatMessageResponse {
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) tool_calls: Option<Vec<OpenAIResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIResponseToolCall {
    pub(crate) id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub(crate) kind: String,
    pub(crate) function: OpenAIResponseFunction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIResponseFunction {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIErrorEnvelope {
    pub(crate) error: OpenAIErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAIErrorBody {
    pub(crate) message: String,
}

fn function_kind() -> String {
    "function".to_owned()
}

fn message_role_to_openai_role(role: &MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

pub(crate) fn normalize_openai_response(
    response: OpenAIChatCompletionResponse,
    provider: &ProviderId,
) -> Result<Decision, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ResponseParse {
            provider: provider.clone(),
            message: "response did not contain any choices".to_owned(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tool_call| {
            if tool_call.kind != "function" {
                return Err(ProviderError::ResponseParse {
                    provider: provider.clone(),
                    message: format!("unsupported tool call type `{}`", tool_call.kind),
                });
            }
            Ok(ToolCall::new(
                tool_call.id,
                tool_call.function.name,
                parse_tool_arguments(&tool_call.function.arguments),
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Decision {
        content: choice.message.content.filter(|content| !content.is_empty()),
        tool_calls,
        finish_reason: choice.finish_reason,
    })
}

/// Arguments arrive as a JSON string. Unparseable text is kept as a string
/// so the tool can reject it with a useful message.
fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
