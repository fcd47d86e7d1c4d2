use sandbox::{SandboxHandle, Translation};
use tracing::{debug, warn};
use types::{SandboxError, ShellError, ToolCall, ToolResult};

use super::*;
use crate::container::{encode_arguments, relay_capture_limit};

/// Resolves a tool call and runs it somewhere.
///
/// Tool faults come back as failed [`ToolResult`]s. `Err` is reserved for
/// faults that leave the execution environment unusable.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn registry(&self) -> &ToolRegistry;

    async fn execute_call(&self, call: &ToolCall) -> Result<ToolResult, SandboxError>;
}

fn unknown_tool(call: &ToolCall) -> ToolResult {
    ToolResult::failure(
        call.id.clone(),
        String::new(),
        format!("unknown tool `{}`", call.name),
    )
}

fn into_tool_result(call: &ToolCall, outcome: Result<ToolExecResult, ToolError>) -> ToolResult {
    match outcome {
        Ok(ToolExecResult {
            output,
            error: None,
            ..
        }) => ToolResult::success(call.id.clone(), output),
        Ok(ToolExecResult {
            output,
            error: Some(error),
            ..
        }) => {
            debug!(tool = %call.name, call_id = %call.id, %error, "tool reported failure");
            ToolResult::failure(call.id.clone(), output, error)
        }
        Err(error) => {
            warn!(tool = %call.name, call_id = %call.id, %error, "tool call failed");
            ToolResult::failure(call.id.clone(), String::new(), error.to_string())
        }
    }
}

/// Runs tools on the host.
pub struct LocalExecutor {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
}

impl LocalExecutor {
    pub fn new(registry: Arc<ToolRegistry>, context: ToolContext) -> Self {
        Self { registry, context }
    }
}

#[async_trait]
impl ToolExecutor for LocalExecutor {
    fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    async fn execute_call(&self, call: &ToolCall) -> Result<ToolResult, SandboxError> {
        if !self.registry.contains(&call.name) {
            return Ok(unknown_tool(call));
        }
        let outcome = self
            .registry
            .execute(&call.name, &call.arguments, &self.context)
            .await;
        Ok(into_tool_result(call, outcome))
    }
}

/// Runs tools against a container sandbox.
///
/// Pure tools run in-process. Shell tools run in the sandbox session with
/// workspace paths rewritten both ways. Filesystem tools are relayed to the
/// in-container tool executable after their path arguments are translated.
pub struct SandboxedExecutor {
    registry: Arc<ToolRegistry>,
    sandbox: SandboxHandle,
    shell_context: ToolContext,
}

impl SandboxedExecutor {
    pub fn new(registry: Arc<ToolRegistry>, sandbox: SandboxHandle) -> Self {
        let shell_context = ToolContext::with_shell(sandbox.session.clone());
        Self {
            registry,
            sandbox,
            shell_context,
        }
    }

    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    async fn run_shell_tool(&self, call: &ToolCall) -> Result<ToolResult, SandboxError> {
        let translator = &self.sandbox.translator;
        let arguments = map_strings(&call.arguments, &|text: &str| {
            translator.rewrite_to_container(text)
        });
        let outcome = self
            .registry
            .execute(&call.name, &arguments, &self.shell_context)
            .await;
        check_fatal(&outcome)?;
        let mut result = into_tool_result(call, outcome);
        self.rewrite_result_to_host(&mut result);
        Ok(result)
    }

    async fn relay_filesystem_tool(
        &self,
        call: &ToolCall,
        tool: &Arc<dyn Tool>,
        path_fields: &[&str],
    ) -> Result<ToolResult, SandboxError> {
        let mut arguments = call.arguments.clone();
        if let Value::Object(fields) = &mut arguments {
            for field in path_fields {
                let Some(Value::String(path)) = fields.get(*field) else {
                    continue;
                };
                // Relative paths reach the tool untouched so it can reject them.
                if !std::path::Path::new(path).is_absolute() {
                    continue;
                }
                match self.sandbox.translator.to_container(path) {
                    Translation::Mapped(mapped) => {
                        let mapped = mapped.to_string_lossy().into_owned();
                        fields.insert((*field).to_owned(), Value::String(mapped));
                    }
                    Translation::NotMapped(original) => {
                        let error = ToolError::PathOutsideWorkspace {
                            tool: call.name.clone(),
                            path: original,
                        };
                        return Ok(into_tool_result(call, Err(error)));
                    }
                }
            }
        }

        let Some(binary) = &self.sandbox.tool_binary else {
            let error = execution_failed(
                &call.name,
                "no tool executable is provisioned in the sandbox",
            );
            return Ok(into_tool_result(call, Err(error)));
        };
        let encoded = match encode_arguments(&arguments) {
            Ok(encoded) => encoded,
            Err(error) => return Ok(into_tool_result(call, Err(error.into()))),
        };
        let max_output_bytes = self.registry.max_output_bytes();
        let command = format!(
            "{} exec {} --args-b64 {encoded} --max-output-bytes {max_output_bytes}",
            shell_quote(binary),
            shell_quote(&call.name)
        );

        debug!(tool = %call.name, call_id = %call.id, "relaying tool into sandbox");
        let outcome = match self
            .sandbox
            .session
            .run_with_limit(
                &command,
                tool.timeout(),
                relay_capture_limit(max_output_bytes),
            )
            .await
        {
            Ok(output) => parse_relay_output(
                &call.name,
                &output.stdout,
                &output.stderr,
                output.exit_code,
            ),
            Err(ShellError::Timeout { .. }) => Err(ToolError::Timeout {
                tool: call.name.clone(),
                command: format!("{} {}", call.name, call.arguments),
            }),
            Err(error) => Err(ToolError::Shell(error)),
        };
        check_fatal(&outcome)?;

        let mut result = into_tool_result(call, outcome);
        result.output = truncate_output(result.output, self.registry.max_output_bytes());
        self.rewrite_result_to_host(&mut result);
        Ok(result)
    }

    fn rewrite_result_to_host(&self, result: &mut ToolResult) {
        let translator = &self.sandbox.translator;
        result.output = translator.rewrite_to_host(&result.output);
        if let Some(error) = &result.error {
            result.error = Some(translator.rewrite_to_host(error));
        }
    }
}

#[async_trait]
impl ToolExecutor for SandboxedExecutor {
    fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    async fn execute_call(&self, call: &ToolCall) -> Result<ToolResult, SandboxError> {
        let Some(tool) = self.registry.get(&call.name) else {
            return Ok(unknown_tool(call));
        };

        match tool.footprint() {
            ToolFootprint::Pure => {
                let outcome = self
                    .registry
                    .execute(&call.name, &call.arguments, &ToolContext::default())
                    .await;
                Ok(into_tool_result(call, outcome))
            }
            ToolFootprint::Shell => self.run_shell_tool(call).await,
            ToolFootprint::Filesystem { path_fields } => {
                self.relay_filesystem_tool(call, tool, path_fields).await
            }
        }
    }
}

/// Promotes a dead sandbox session to a run-level fault.
fn check_fatal(outcome: &Result<ToolExecResult, ToolError>) -> Result<(), SandboxError> {
    match outcome {
        Err(ToolError::Shell(error)) if error.is_fatal() => Err(SandboxError::Fatal {
            message: error.to_string(),
        }),
        _ => Ok(()),
    }
}

fn parse_relay_output(
    tool: &str,
    stdout: &str,
    stderr: &str,
    exit_code: i32,
) -> Result<ToolExecResult, ToolError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    serde_json::from_str(line).map_err(|_| {
        let detail = combine_command_output(stdout, stderr);
        execution_failed(
            tool,
            format!("tool executable exited with status {exit_code} without a result: {detail}"),
        )
    })
}

fn map_strings(value: &Value, rewrite: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(text) => Value::String(rewrite(text)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| map_strings(item, rewrite))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), map_strings(item, rewrite)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
