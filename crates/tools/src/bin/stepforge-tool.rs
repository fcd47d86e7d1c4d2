use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tools::{DEFAULT_MAX_OUTPUT_BYTES, known_tool_names, run_container_tool};

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
enum ToolCommand {
    /// Run one filesystem tool and print its result as JSON
    Exec {
        tool: String,
        /// Base64-encoded JSON arguments
        #[arg(long = "args-b64")]
        args_b64: String,
        /// Bound on the tool output carried in the result
        #[arg(long = "max-output-bytes", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
        max_output_bytes: usize,
    },
    /// List the built-in tool names
    List,
}

#[derive(Debug, Clone, Parser, PartialEq, Eq)]
#[command(name = "stepforge-tool", about = "In-sandbox tool executable for stepforge")]
struct ToolArgs {
    #[command(subcommand)]
    command: ToolCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match ToolArgs::parse().command {
        ToolCommand::Exec {
            tool,
            args_b64,
            max_output_bytes,
        } => {
            let result = run_container_tool(&tool, &args_b64, max_output_bytes).await;
            match serde_json::to_string(&result) {
                Ok(line) => {
                    println!("{line}");
                    if result.is_success() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(error) => {
                    eprintln!("failed to encode tool result: {error}");
                    ExitCode::from(2)
                }
            }
        }
        ToolCommand::List => {
            for name in known_tool_names() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
    }
}
