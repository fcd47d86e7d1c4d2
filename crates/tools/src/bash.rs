use serde::Deserialize;
use types::ShellError;

use super::*;

/// Runs commands in the run's shell session.
pub struct BashTool {
    schema: FunctionDecl,
    command_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct BashArgs {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    restart: bool,
}

impl BashTool {
    pub fn new(command_timeout: Duration) -> Self {
        let parameters = object_schema(
            vec![
                (
                    "command",
                    json!({
                        "type": "string",
                        "description": "The bash command to run. Required unless `restart` is true."
                    }),
                ),
                (
                    "restart",
                    json!({
                        "type": "boolean",
                        "description": "Set to true to restart the shell, dropping its working directory and exported variables."
                    }),
                ),
            ],
            &[],
        );
        let description = "Run commands in a bash shell.\n\
            * State is persistent across calls: the working directory and exported variables carry over.\n\
            * Long outputs are truncated; prefer commands that print only what you need.\n\
            * Commands that run longer than the configured timeout are killed."
            .to_owned();

        Self {
            schema: FunctionDecl::new(BASH_TOOL_NAME, Some(description), parameters),
            command_timeout,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl Tool for BashTool {
    fn schema(&self) -> &FunctionDecl {
        &self.schema
    }

    fn footprint(&self) -> ToolFootprint {
        ToolFootprint::Shell
    }

    async fn execute(
        &self,
        arguments: &Value,
        context: &ToolContext,
    ) -> Result<ToolExecResult, ToolError> {
        let request: BashArgs = parse_args(BASH_TOOL_NAME, arguments)?;
        let shell = context
            .shell
            .as_ref()
            .ok_or_else(|| execution_failed(BASH_TOOL_NAME, "no shell session is available"))?;

        if request.restart {
            shell.reset().await?;
            return Ok(ToolExecResult::ok("tool has been restarted."));
        }

        let command = request
            .command
            .filter(|command| !command.trim().is_empty())
            .ok_or_else(|| invalid_args(BASH_TOOL_NAME, "`command` is required"))?;

        let output = match shell.run(&command, Some(self.command_timeout)).await {
            Ok(output) => output,
            Err(ShellError::Timeout { command, .. }) => {
                return Err(ToolError::Timeout {
                    tool: BASH_TOOL_NAME.to_owned(),
                    command,
                });
            }
            Err(error) => return Err(error.into()),
        };

        let combined = combine_command_output(&output.stdout, &output.stderr);
        if output.exit_code == 0 {
            let text = if combined.is_empty() {
                "command completed with no output".to_owned()
            } else {
                combined
            };
            return Ok(ToolExecResult {
                output: text,
                error: None,
                exit_code: Some(0),
            });
        }

        Ok(ToolExecResult {
            output: combined,
            error: Some(format!("command exited with status {}", output.exit_code)),
            exit_code: Some(output.exit_code),
        })
    }

    fn timeout(&self) -> Duration {
        self.command_timeout
    }
}
