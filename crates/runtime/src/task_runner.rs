use std::sync::Arc;

use sandbox::ContainerSandbox;
use shell::{ShellSession, ShellSessionConfig};
use tokio_util::sync::CancellationToken;
use tools::{LocalExecutor, SandboxedExecutor, ToolExecutor, ToolRegistry};
use types::{
    AgentSettings, ModelId, NullTrajectory, Provider, RunOutcome, RuntimeError, SandboxSpec, Task,
    ToolContext, TrajectorySink,
};

use crate::AgentLoop;

/// Where the tools of one run execute.
pub enum ExecutionMode {
    /// On the host, through a local shell session rooted at the task
    /// workspace.
    Local { shell: String },
    /// Inside `sandbox`, acquired from `spec` for the duration of the run.
    Sandboxed {
        sandbox: Arc<ContainerSandbox>,
        spec: SandboxSpec,
    },
}

/// Sets up the execution environment for one task, runs the agent loop and
/// tears everything down again on every exit path.
pub struct TaskRunner {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    model: ModelId,
    settings: AgentSettings,
    session: ShellSessionConfig,
    sink: Arc<dyn TrajectorySink>,
}

impl TaskRunner {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        model: impl Into<ModelId>,
    ) -> Self {
        Self {
            provider,
            registry,
            model: model.into(),
            settings: AgentSettings::default(),
            session: ShellSessionConfig::default(),
            sink: Arc::new(NullTrajectory),
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_session_config(mut self, session: ShellSessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TrajectorySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn run(
        &self,
        task: &Task,
        mode: ExecutionMode,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let outcome = match mode {
            ExecutionMode::Local { shell } => self.run_local(task, shell, cancellation).await,
            ExecutionMode::Sandboxed { sandbox, spec } => {
                self.run_sandboxed(task, &sandbox, &spec, cancellation)
                    .await
            }
        };

        if let Err(error) = self.sink.finalize(&outcome).await {
            tracing::warn!(%error, "failed to finalize trajectory");
        }
        outcome
    }

    async fn run_local(
        &self,
        task: &Task,
        shell: String,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let mut config = self.session.clone();
        config.initial_cwd = Some(task.workspace.display().to_string());
        let session = Arc::new(ShellSession::local(shell, config));
        tracing::info!(session = %session.describe(), "running task locally");

        let executor = LocalExecutor::new(
            Arc::clone(&self.registry),
            ToolContext::with_shell(session.clone()),
        );
        let outcome = self.agent_loop(Arc::new(executor)).run(task, cancellation).await;
        session.close().await;
        outcome
    }

    async fn run_sandboxed(
        &self,
        task: &Task,
        sandbox: &ContainerSandbox,
        spec: &SandboxSpec,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let acquired = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(RuntimeError::Cancelled),
            acquired = sandbox.acquire(spec) => acquired.map_err(RuntimeError::from),
        };

        let outcome = match acquired {
            Ok(handle) => {
                tracing::info!(
                    sandbox = %handle.sandbox_id,
                    container = %handle.container_id,
                    "running task in sandbox"
                );
                let executor = SandboxedExecutor::new(Arc::clone(&self.registry), handle);
                self.agent_loop(Arc::new(executor)).run(task, cancellation).await
            }
            Err(error) => {
                tracing::warn!(sandbox = %sandbox.id(), %error, "sandbox unavailable; no tools will run");
                RunOutcome::failed(0, error)
            }
        };

        if let Err(error) = sandbox.release().await {
            tracing::warn!(sandbox = %sandbox.id(), %error, "sandbox release failed");
        }
        outcome
    }

    fn agent_loop(&self, executor: Arc<dyn ToolExecutor>) -> AgentLoop {
        AgentLoop::new(Arc::clone(&self.provider), executor, self.model.clone())
            .with_settings(self.settings.clone())
            .with_sink(Arc::clone(&self.sink))
    }
}
