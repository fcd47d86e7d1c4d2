use std::time::Duration;

use thiserror::Error;

use crate::ProviderId;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing API key for provider `{provider}`")]
    MissingApiKey { provider: ProviderId },
    #[error("provider transport failed for `{provider}`: {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    #[error("provider `{provider}` returned HTTP {status}: {message}")]
    HttpStatus {
        provider: ProviderId,
        status: u16,
        message: String,
    },
    #[error("provider response parsing failed for `{provider}`: {message}")]
    ResponseParse {
        provider: ProviderId,
        message: String,
    },
    #[error("provider request failed for {provider}: {message}")]
    RequestFailed {
        provider: ProviderId,
        message: String,
    },
    #[error("provider serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("shell session is closed")]
    Closed,
    #[error("shell session is unusable: {message}")]
    Unusable { message: String },
    #[error("failed to start shell command: {message}")]
    Spawn { message: String },
    #[error("shell backend unavailable: {message}")]
    Unavailable { message: String },
}

impl ShellError {
    /// Whether the session can no longer run commands at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Unusable { .. } | Self::Unavailable { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for tool {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("path `{path}` for tool {tool} is outside the workspace")]
    PathOutsideWorkspace { tool: String, path: String },
    #[error("tool {tool} timed out running `{command}`")]
    Timeout { tool: String, command: String },
    #[error("tool execution failed for {tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("tool serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolError {
    /// Bad input from the model rather than a fault while running.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArguments { .. } | Self::PathOutsideWorkspace { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to acquire sandbox from {source_label}: {message}")]
    Acquisition {
        source_label: String,
        message: String,
    },
    #[error("sandbox became unusable: {message}")]
    Fatal { message: String },
    #[error("sandbox cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("failed to release sandbox: {message}")]
    Release { message: String },
}

#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("failed to open trajectory file `{path}`: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write trajectory record: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to serialize trajectory record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("run cancelled")]
    Cancelled,
}
