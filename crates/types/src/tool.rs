use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ShellError, ToolError};

/// A tool parameter schema expressed as a raw JSON Schema value.
pub type ToolParameterSchema = Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: ToolParameterSchema,
}

impl FunctionDecl {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        parameters: ToolParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            parameters,
        }
    }
}

/// What a tool touches when it runs, which decides how a sandboxed
/// executor relays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFootprint {
    /// No filesystem or process access; runs wherever the engine runs.
    Pure,
    /// Runs commands through the run's shell session.
    Shell,
    /// Reads or writes files named by the listed argument fields.
    Filesystem { path_fields: &'static [&'static str] },
}

/// What a tool produced. A populated `error` marks the call as failed while
/// still returning whatever output was captured.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolExecResult {
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ToolExecResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
            exit_code: None,
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: Some(error.into()),
            exit_code: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A serialized command channel whose shell state survives between calls.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command`, using the runner's default timeout when `timeout` is `None`.
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ShellError>;

    /// Drops accumulated shell state (cwd, exports) and starts over.
    async fn reset(&self) -> Result<(), ShellError>;
}

/// Per-call environment handed to a tool by its executor.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub shell: Option<Arc<dyn CommandRunner>>,
}

impl ToolContext {
    pub fn with_shell(shell: Arc<dyn CommandRunner>) -> Self {
        Self { shell: Some(shell) }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Schema computed once at construction.
    fn schema(&self) -> &FunctionDecl;

    fn footprint(&self) -> ToolFootprint;

    async fn execute(
        &self,
        arguments: &Value,
        context: &ToolContext,
    ) -> Result<ToolExecResult, ToolError>;

    /// Deadline for one call. For shell tools this is the per-command
    /// timeout, which excludes time queued behind other commands.
    fn timeout(&self) -> Duration;

    fn name(&self) -> &str {
        &self.schema().name
    }
}
