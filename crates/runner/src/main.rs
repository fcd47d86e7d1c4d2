use std::{fs, io, path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use runner::{
    AgentOverrides, BootstrapError, CliOverrides, EXIT_ERROR, Runner, RunnerError, SandboxSource,
    TrajectoryOverrides, load_config, resolve_workspace,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use types::init_tracing;

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
enum CliCommand {
    /// Run one task to completion
    Run(RunArgs),
    /// List the enabled tools and their descriptions
    Tools(ConfigArgs),
}

#[derive(Debug, Clone, Args, PartialEq, Eq)]
struct ConfigArgs {
    /// Directory the run may operate within (defaults to the current directory)
    #[arg(short = 'w', long = "workspace")]
    workspace: Option<PathBuf>,
    /// Extra configuration file merged after the discovered ones
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Args, PartialEq, Eq)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Task instruction
    #[arg(short = 't', long = "task", conflicts_with = "task_file")]
    task: Option<String>,
    /// Read the task instruction from a file
    #[arg(long = "task-file")]
    task_file: Option<PathBuf>,
    #[arg(long = "max-steps")]
    max_steps: Option<usize>,
    /// Run tools in a container created from this image
    #[arg(long = "image", group = "sandbox")]
    image: Option<String>,
    /// Run tools in this existing container
    #[arg(long = "container", group = "sandbox")]
    container: Option<String>,
    /// Build the sandbox image from this Dockerfile
    #[arg(long = "dockerfile", group = "sandbox")]
    dockerfile: Option<PathBuf>,
    #[arg(long = "build-context", requires = "dockerfile")]
    build_context: Option<PathBuf>,
    /// Load the sandbox image from this archive
    #[arg(long = "image-archive", group = "sandbox")]
    image_archive: Option<PathBuf>,
    /// Append step records to this JSON-lines file
    #[arg(long = "trajectory")]
    trajectory: Option<PathBuf>,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            agent: self.max_steps.map(|max_steps| AgentOverrides {
                max_steps: Some(max_steps),
            }),
            trajectory: self.trajectory.clone().map(|path| TrajectoryOverrides {
                path: Some(path),
            }),
            sandbox_source: self.sandbox_source(),
        }
    }

    fn sandbox_source(&self) -> Option<SandboxSource> {
        if let Some(image) = &self.image {
            return Some(SandboxSource::Image(image.clone()));
        }
        if let Some(container) = &self.container {
            return Some(SandboxSource::Container(container.clone()));
        }
        if let Some(dockerfile) = &self.dockerfile {
            return Some(SandboxSource::Dockerfile {
                dockerfile: dockerfile.clone(),
                context: self.build_context.clone(),
            });
        }
        self.image_archive.clone().map(SandboxSource::Archive)
    }

    fn instruction(&self) -> Result<String, CliError> {
        let instruction = match (&self.task, &self.task_file) {
            (Some(task), _) => task.clone(),
            (None, Some(path)) => {
                fs::read_to_string(path).map_err(|source| CliError::TaskFile {
                    path: path.clone(),
                    source,
                })?
            }
            (None, None) => {
                return Err(CliError::Arguments(
                    "one of --task or --task-file is required".to_owned(),
                ));
            }
        };
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(CliError::Arguments("task instruction is empty".to_owned()));
        }
        Ok(instruction.to_owned())
    }
}

#[derive(Debug, Clone, Parser, PartialEq, Eq)]
#[command(name = "stepforge", about = "Autonomous task runner driven by a language model")]
struct CliArgs {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Arguments(String),
    #[error("failed to read task file `{}`: {source}", path.display())]
    TaskFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start async runtime: {0}")]
    AsyncRuntimeInit(#[source] io::Error),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

fn main() -> ExitCode {
    init_tracing();
    let args = CliArgs::parse();
    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("stepforge error: {error}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(args: CliArgs) -> Result<u8, CliError> {
    match args.command {
        CliCommand::Tools(config) => {
            let runner = build_runner(&config, CliOverrides::default())?;
            for spec in runner.tool_specs() {
                let summary = spec
                    .description
                    .as_deref()
                    .and_then(|description| description.lines().next())
                    .unwrap_or_default();
                println!("tool={} description={summary}", spec.name);
            }
            Ok(0)
        }
        CliCommand::Run(run_args) => {
            let instruction = run_args.instruction()?;
            let runner = build_runner(&run_args.config, run_args.overrides())?;
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(CliError::AsyncRuntimeInit)?;

            let summary = rt.block_on(async {
                let cancellation = CancellationToken::new();
                let on_signal = cancellation.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received; cancelling run");
                        on_signal.cancel();
                    }
                });
                runner.run(instruction, &cancellation).await
            })?;

            for line in summary.lines() {
                println!("{line}");
            }
            Ok(summary.exit_code())
        }
    }
}

fn build_runner(config: &ConfigArgs, overrides: CliOverrides) -> Result<Runner, CliError> {
    let workspace = resolve_workspace(config.workspace.as_deref())?;
    let engine_config = load_config(&workspace, config.config.as_deref(), overrides)?;
    Ok(Runner::new(engine_config, workspace)?)
}
