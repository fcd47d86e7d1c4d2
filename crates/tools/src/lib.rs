use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use types::{
    BASH_TOOL_NAME, EDIT_TOOL_NAME, FunctionDecl, SEQUENTIAL_THINKING_TOOL_NAME,
    TASK_DONE_TOOL_NAME, Tool, ToolContext, ToolError, ToolExecResult, ToolFootprint,
    truncate_output,
};

mod bash;
mod container;
mod edit;
mod executor;
mod registry;
mod task_done;
mod thinking;

pub use bash::BashTool;
pub use container::{ContainerToolError, run_container_tool};
pub use edit::EditTool;
pub use executor::{LocalExecutor, SandboxedExecutor, ToolExecutor};
pub use registry::{RegistryError, ToolRegistry, ToolRegistryBuilder, known_tool_names};
pub use task_done::TaskDoneTool;
pub use thinking::SequentialThinkingTool;

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

fn parse_args<T>(tool: &str, arguments: &Value) -> Result<T, ToolError>
where
    T: DeserializeOwned,
{
    serde_json::from_value(arguments.clone()).map_err(|error| invalid_args(tool, error.to_string()))
}

fn invalid_args(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        tool: tool.to_owned(),
        message: message.into(),
    }
}

fn execution_failed(tool: &str, message: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        tool: tool.to_owned(),
        message: message.into(),
    }
}

fn combine_command_output(stdout: &str, stderr: &str) -> String {
    let stdout_text = stdout.trim_end();
    let stderr_text = stderr.trim_end();

    match (stdout_text.is_empty(), stderr_text.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout_text.to_owned(),
        (true, false) => stderr_text.to_owned(),
        (false, false) => format!("{stdout_text}\n{stderr_text}"),
    }
}

/// Builds an `object` schema from `(name, schema)` pairs.
fn object_schema(properties: Vec<(&str, Value)>, required: &[&str]) -> Value {
    let properties: BTreeMap<String, Value> = properties
        .into_iter()
        .map(|(name, schema)| (name.to_owned(), schema))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
