use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ModelId;

pub const BASH_TOOL_NAME: &str = "bash";
pub const EDIT_TOOL_NAME: &str = "str_replace_based_edit_tool";
pub const SEQUENTIAL_THINKING_TOOL_NAME: &str = "sequential_thinking";
pub const TASK_DONE_TOOL_NAME: &str = "task_done";
pub const BUILTIN_TOOL_NAMES: &[&str] = &[
    BASH_TOOL_NAME,
    EDIT_TOOL_NAME,
    SEQUENTIAL_THINKING_TOOL_NAME,
    TASK_DONE_TOOL_NAME,
];

pub const DEFAULT_CONTAINER_WORKSPACE: &str = "/workspace";
pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const OLLAMA_DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub trajectory: TrajectoryConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_steps == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "agent.max_steps",
                value: 0,
            });
        }

        self.tools.validate()?;

        if let Some(sandbox) = &self.sandbox {
            sandbox.spec()?;
            if !sandbox.container_workspace.starts_with('/') {
                return Err(ConfigError::RelativeContainerWorkspace {
                    path: sandbox.container_workspace.clone(),
                });
            }
        }

        if self.provider.model.0.trim().is_empty() {
            return Err(ConfigError::EmptyModel {
                provider: self.provider.kind.as_label(),
            });
        }

        if self.reliability.max_attempts == 0 {
            return Err(ConfigError::InvalidReliabilityAttempts { attempts: 0 });
        }

        if self.reliability.backoff_base_ms == 0
            || self.reliability.backoff_max_ms == 0
            || self.reliability.backoff_base_ms > self.reliability.backoff_max_ms
        {
            return Err(ConfigError::InvalidReliabilityBackoff {
                base_ms: self.reliability.backoff_base_ms,
                max_ms: self.reliability.backoff_max_ms,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub allow_idle_completion: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            system_prompt: None,
            allow_idle_completion: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_enabled_tools")]
    pub enabled: Vec<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_tools(),
            command_timeout_secs: default_command_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            shell: default_shell(),
        }
    }
}

impl ToolsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "tools.command_timeout_secs",
                value: 0,
            });
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "tools.max_output_bytes",
                value: 0,
            });
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::EmptyShell);
        }
        if let Some(unknown) = self
            .enabled
            .iter()
            .find(|name| !BUILTIN_TOOL_NAMES.contains(&name.as_str()))
        {
            return Err(ConfigError::UnknownTool {
                name: unknown.clone(),
            });
        }
        if !self.enabled.iter().any(|name| name == TASK_DONE_TOOL_NAME) {
            return Err(ConfigError::TerminalToolDisabled);
        }
        Ok(())
    }
}

/// Where a sandboxed run's container comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxSpec {
    Image(String),
    Container(String),
    Dockerfile { dockerfile: PathBuf, context: PathBuf },
    Archive(PathBuf),
}

impl SandboxSpec {
    pub fn label(&self) -> String {
        match self {
            Self::Image(image) => format!("image `{image}`"),
            Self::Container(id) => format!("container `{id}`"),
            Self::Dockerfile { dockerfile, .. } => {
                format!("dockerfile `{}`", dockerfile.display())
            }
            Self::Archive(path) => format!("image archive `{}`", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_context: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    #[serde(default = "default_container_workspace")]
    pub container_workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_binary: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            container: None,
            dockerfile: None,
            build_context: None,
            archive: None,
            container_workspace: default_container_workspace(),
            tool_binary: None,
        }
    }
}

impl SandboxConfig {
    /// Resolves the configured source, requiring exactly one.
    pub fn spec(&self) -> Result<SandboxSpec, ConfigError> {
        let mut sources = Vec::with_capacity(1);
        if let Some(image) = non_empty(self.image.as_deref()) {
            sources.push(SandboxSpec::Image(image.to_owned()));
        }
        if let Some(container) = non_empty(self.container.as_deref()) {
            sources.push(SandboxSpec::Container(container.to_owned()));
        }
        if let Some(dockerfile) = &self.dockerfile {
            let context = self.build_context.clone().unwrap_or_else(|| {
                dockerfile
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."))
            });
            sources.push(SandboxSpec::Dockerfile {
                dockerfile: dockerfile.clone(),
                context,
            });
        }
        if let Some(archive) = &self.archive {
            sources.push(SandboxSpec::Archive(archive.clone()));
        }

        match sources.len() {
            1 => Ok(sources.remove(0)),
            count => Err(ConfigError::AmbiguousSandboxSource { count }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "ollama")]
    Ollama,
}

impl ProviderKind {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_DEFAULT_BASE_URL,
            Self::OpenRouter => OPENROUTER_DEFAULT_BASE_URL,
            Self::Ollama => OLLAMA_DEFAULT_BASE_URL,
        }
    }

    /// Environment variable consulted for the API key when none is configured.
    pub fn default_api_key_env(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Ollama => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default = "default_model_id")]
    pub model: ModelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: default_model_id(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

impl ProviderConfig {
    pub fn resolved_base_url(&self) -> String {
        non_empty(self.base_url.as_deref())
            .unwrap_or(self.kind.default_base_url())
            .trim_end_matches('/')
            .to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_reliability_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reliability_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_reliability_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reliability_max_attempts(),
            backoff_base_ms: default_reliability_backoff_base_ms(),
            backoff_max_ms: default_reliability_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrajectoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("limit `{field}` must be greater than zero; got {value}")]
    InvalidLimit { field: &'static str, value: u64 },
    #[error("tools.shell must not be empty")]
    EmptyShell,
    #[error("unknown tool `{name}` in tools.enabled")]
    UnknownTool { name: String },
    #[error("tools.enabled must include `task_done`")]
    TerminalToolDisabled,
    #[error("sandbox needs exactly one of image, container, dockerfile or archive; got {count}")]
    AmbiguousSandboxSource { count: usize },
    #[error("sandbox.container_workspace `{path}` must be absolute")]
    RelativeContainerWorkspace { path: String },
    #[error("model is empty for provider `{provider}`")]
    EmptyModel { provider: &'static str },
    #[error("reliability max_attempts must be greater than zero; got {attempts}")]
    InvalidReliabilityAttempts { attempts: u32 },
    #[error(
        "invalid reliability backoff bounds base={base_ms}ms max={max_ms}ms (both must be >0 and base<=max)"
    )]
    InvalidReliabilityBackoff { base_ms: u64, max_ms: u64 },
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn default_max_steps() -> usize {
    50
}

fn default_enabled_tools() -> Vec<String> {
    BUILTIN_TOOL_NAMES
        .iter()
        .map(|name| (*name).to_owned())
        .collect()
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    16 * 1024
}

fn default_shell() -> String {
    "bash".to_owned()
}

fn default_container_workspace() -> String {
    DEFAULT_CONTAINER_WORKSPACE.to_owned()
}

fn default_model_id() -> ModelId {
    ModelId::from("gpt-4o-mini")
}

fn default_reliability_max_attempts() -> u32 {
    3
}

fn default_reliability_backoff_base_ms() -> u64 {
    250
}

fn default_reliability_backoff_max_ms() -> u64 {
    2_000
}
