use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use provider::build_provider;
use runtime::{ExecutionMode, JsonlTrajectory, TaskRunner};
use sandbox::{ContainerSandbox, DockerEngine, EngineError, SandboxSettings};
use shell::ShellSessionConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tools::{RegistryError, ToolRegistry};
use tracing::{info, warn};
use types::{
    AgentState, ConfigError, EngineConfig, FunctionDecl, NullTrajectory, ProviderError,
    RunOutcome, SandboxConfig, Task, TrajectoryError, TrajectorySink,
};

pub mod bootstrap;

pub use bootstrap::{
    AgentOverrides, BootstrapError, CliOverrides, ConfigSearchPaths, SandboxSource,
    TrajectoryOverrides, load_config, load_config_with_paths,
};


pub const TOOL_BINARY_NAME: &str = "stepforge-tool";

pub const EXIT_DONE: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_MAX_STEPS: u8 = 2;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("workspace `{}` is not usable: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What a finished run reports back to the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub mode: &'static str,
    pub workspace: PathBuf,
    pub trajectory: Option<PathBuf>,
}

impl RunSummary {
    pub fn exit_code(&self) -> u8 {
        exit_code_for(self.outcome.state)
    }

    /// `key=value` lines for stdout.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("state={}", self.outcome.state),
            format!("steps={}", self.outcome.steps),
            format!("mode={}", self.mode),
            format!("workspace={}", self.workspace.display()),
        ];
        if let Some(path) = &self.trajectory {
            lines.push(format!("trajectory={}", path.display()));
        }
        if let Some(message) = &self.outcome.final_message {
            lines.push(format!("final_message={}", single_line(message)));
        }
        if let Some(error) = &self.outcome.error {
            lines.push(format!("error={}", single_line(error)));
        }
        lines
    }
}

pub fn exit_code_for(state: AgentState) -> u8 {
    match state {
        AgentState::Done => EXIT_DONE,
        AgentState::MaxSteps => EXIT_MAX_STEPS,
        _ => EXIT_ERROR,
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves a workspace argument to an absolute, existing directory.
pub fn resolve_workspace(workspace: Option<&Path>) -> Result<PathBuf, RunnerError> {
    let path = match workspace {
        Some(path) => path.to_path_buf(),
        None => env::current_dir().map_err(|source| RunnerError::Workspace {
            path: PathBuf::from("."),
            source,
        })?,
    };
    let canonical = path
        .canonicalize()
        .map_err(|source| RunnerError::Workspace {
            path: path.clone(),
            source,
        })?;
    if !canonical.is_dir() {
        return Err(RunnerError::Workspace {
            path,
            source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
        });
    }
    Ok(canonical)
}

/// Wires a validated configuration into a task run.
pub struct Runner {
    config: EngineConfig,
    workspace: PathBuf,
    registry: Arc<ToolRegistry>,
}

impl Runner {
    pub fn new(config: EngineConfig, workspace: PathBuf) -> Result<Self, RunnerError> {
        config.validate()?;
        let registry = Arc::new(ToolRegistry::from_config(&config.tools)?);
        Ok(Self {
            config,
            workspace,
            registry,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tool_specs(&self) -> &[FunctionDecl] {
        self.registry.schemas()
    }

    pub async fn run(
        &self,
        instruction: impl Into<String>,
        cancellation: &CancellationToken,
    ) -> Result<RunSummary, RunnerError> {
        let provider = build_provider(&self.config.provider, &self.config.reliability)?;
        let sink: Arc<dyn TrajectorySink> = match &self.config.trajectory.path {
            Some(path) => Arc::new(JsonlTrajectory::create(path)?),
            None => Arc::new(NullTrajectory),
        };
        let session = self.session_config();
        let runner = TaskRunner::new(
            provider,
            Arc::clone(&self.registry),
            self.config.provider.model.clone(),
        )
        .with_settings(self.config.agent.clone())
        .with_session_config(session.clone())
        .with_sink(sink);

        let (mode, label) = match &self.config.sandbox {
            Some(sandbox) => (self.sandboxed_mode(sandbox, session)?, "sandboxed"),
            None => (
                ExecutionMode::Local {
                    shell: self.config.tools.shell.clone(),
                },
                "local",
            ),
        };

        info!(
            mode = label,
            workspace = %self.workspace.display(),
            model = %self.config.provider.model,
            provider = self.config.provider.kind.as_label(),
            "starting task"
        );
        let task = Task::new(instruction, self.workspace.clone());
        let outcome = runner.run(&task, mode, cancellation).await;

        Ok(RunSummary {
            outcome,
            mode: label,
            workspace: self.workspace.clone(),
            trajectory: self.config.trajectory.path.clone(),
        })
    }

    fn session_config(&self) -> ShellSessionConfig {
        ShellSessionConfig {
            initial_cwd: None,
            default_timeout: Duration::from_secs(self.config.tools.command_timeout_secs),
            max_output_bytes: self.config.tools.max_output_bytes,
        }
    }

    fn sandboxed_mode(
        &self,
        sandbox: &SandboxConfig,
        session: ShellSessionConfig,
    ) -> Result<ExecutionMode, RunnerError> {
        let spec = sandbox.spec()?;
        let engine = DockerEngine::connect_local()?;
        let mut settings =
            SandboxSettings::new(&self.workspace, sandbox.container_workspace.clone())
                .with_session(session);
        match resolve_tool_binary(sandbox.tool_binary.as_deref()) {
            Some(binary) => settings = settings.with_tool_binary(binary),
            None => warn!(
                "no `{TOOL_BINARY_NAME}` executable found; file tools will fail inside the sandbox"
            ),
        }
        Ok(ExecutionMode::Sandboxed {
            sandbox: Arc::new(ContainerSandbox::new(Arc::new(engine), settings)),
            spec,
        })
    }
}

/// The configured tool executable, or a `stepforge-tool` next to the
/// running binary.
pub fn resolve_tool_binary(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return Some(path.to_path_buf());
    }
    let sibling = env::current_exe()
        .ok()?
        .parent()?
        .join(TOOL_BINARY_NAME);
    sibling.is_file().then_some(sibling)
}
