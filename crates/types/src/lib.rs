mod config;
mod error;
mod model;
mod output;
mod provider;
mod tool;
mod tracing;
mod trajectory;

pub use config::{
    AgentSettings, BASH_TOOL_NAME, BUILTIN_TOOL_NAMES, ConfigError, DEFAULT_CONTAINER_WORKSPACE,
    EDIT_TOOL_NAME, EngineConfig, OLLAMA_DEFAULT_BASE_URL, OPENAI_DEFAULT_BASE_URL,
    OPENROUTER_DEFAULT_BASE_URL, ProviderConfig, ProviderKind, ReliabilityConfig,
    SEQUENTIAL_THINKING_TOOL_NAME, SandboxConfig, SandboxSpec, TASK_DONE_TOOL_NAME, ToolsConfig,
    TrajectoryConfig,
};
pub use error::{
    ProviderError, RuntimeError, SandboxError, ShellError, ToolError, TrajectoryError,
};
pub use model::{
    Context, Decision, Message, MessageRole, ModelId, ProviderId, Task, ToolCall, ToolResult,
};
pub use output::{mark_truncated, truncate_output, truncation_marker};
pub use provider::Provider;
pub use tool::{
    CommandOutput, CommandRunner, FunctionDecl, Tool, ToolContext, ToolExecResult, ToolFootprint,
    ToolParameterSchema,
};
pub use tracing::init_tracing;
pub use trajectory::{AgentState, AgentStep, NullTrajectory, RunOutcome, TrajectorySink};
