use std::{env, sync::Arc, time::Duration};

use types::{Provider, ProviderConfig, ProviderError, ProviderId, ReliabilityConfig};

mod openai;
mod retry;

pub use openai::OpenAICompatibleProvider;
pub use retry::{ReliableProvider, RetryPolicy};

#[cfg(test)]
use openai::{
    OpenAIChatCompletionRequest, OpenAIChatCompletionResponse, OpenAIChatMessageResponse,
    OpenAIChoice, OpenAIResponseFunction, OpenAIResponseToolCall, normalize_openai_response,
};

pub(crate) const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Resolve the API key for a provider configuration.
///
/// Resolution order:
/// 1. Explicit `api_key`
/// 2. Custom env var named by `api_key_env`
/// 3. The provider kind's default env var (`OPENAI_API_KEY`, `OPENROUTER_API_KEY`)
/// 4. Generic `API_KEY` fallback
pub fn resolve_api_key(config: &ProviderConfig) -> Option<String> {
    let custom_env = config
        .api_key_env
        .as_ref()
        .and_then(|var| env::var(var).ok());
    let kind_env = config
        .kind
        .default_api_key_env()
        .and_then(|var| env::var(var).ok());
    resolve_api_key_from_sources(
        config.api_key.clone(),
        custom_env.or(kind_env),
        env::var("API_KEY").ok(),
    )
}

/// Builds the provider for `config`, wrapped in the retry policy from
/// `reliability`. Kinds that need a key fail here when none resolves.
pub fn build_provider(
    config: &ProviderConfig,
    reliability: &ReliabilityConfig,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider_id = ProviderId::from(config.kind.as_label());
    let api_key = resolve_api_key(config);
    if api_key.is_none() && config.kind.default_api_key_env().is_some() {
        return Err(ProviderError::MissingApiKey {
            provider: provider_id,
        });
    }

    let inner = OpenAICompatibleProvider::new(
        provider_id,
        config.resolved_base_url(),
        api_key,
    )?
    .with_max_tokens(config.max_tokens)
    .with_temperature(config.temperature);

    Ok(Arc::new(ReliableProvider::from_arc(
        Arc::new(inner),
        RetryPolicy::from(reliability),
    )))
}

fn resolve_api_key_from_sources(
    explicit_api_key: Option<String>,
    provider_specific_env_key: Option<String>,
    fallback_env_key: Option<String>,
) -> Option<String> {
    explicit_api_key
        .and_then(non_empty)
        .or_else(|| provider_specific_env_key.and_then(non_empty))
        .or_else(|| fallback_env_key.and_then(non_empty))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn extract_http_error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<openai::OpenAIErrorEnvelope>(body)
        && let Some(message) = non_empty(parsed.error.message)
    {
        return truncate_message(&message);
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty error response from provider".to_owned()
    } else {
        truncate_message(trimmed)
    }
}

fn truncate_message(message: &str) -> String {
    const MAX_LEN: usize = 512;
    if message.chars().count() <= MAX_LEN {
        return message.to_owned();
    }
    let prefix = message.chars().take(MAX_LEN).collect::<String>();
    format!("{prefix}...")
}
