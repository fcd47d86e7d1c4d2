use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use shell::{ShellSession, ShellSessionConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use types::{SandboxError, SandboxSpec, ShellError};

mod docker;
mod engine;
mod path;
mod transport;

pub use docker::DockerEngine;
use engine::CONTROL_OUTPUT_BYTES;

pub use engine::{
    ContainerEngine, ContainerInfo, ContainerRequest, EngineError, ExecOutput, MountInfo,
};
pub use path::{MappingError, PathTranslator, Translation, WorkspaceMapping, normalize};
pub use transport::ContainerShellTransport;

pub const CONTAINER_TOOL_DIR: &str = "/opt/stepforge/bin";
pub const CONTAINER_TOOL_BINARY: &str = "/opt/stepforge/bin/stepforge-tool";
const READINESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub host_workspace: PathBuf,
    pub container_workspace: String,
    /// Host build of the in-container tool executable; bind-mounted or
    /// copied to [`CONTAINER_TOOL_BINARY`].
    pub tool_binary: Option<PathBuf>,
    pub session: ShellSessionConfig,
    pub name_prefix: String,
}

impl SandboxSettings {
    pub fn new(host_workspace: impl Into<PathBuf>, container_workspace: impl Into<String>) -> Self {
        Self {
            host_workspace: host_workspace.into(),
            container_workspace: container_workspace.into(),
            tool_binary: None,
            session: ShellSessionConfig::default(),
            name_prefix: "stepforge".to_owned(),
        }
    }

    pub fn with_tool_binary(mut self, tool_binary: impl Into<PathBuf>) -> Self {
        self.tool_binary = Some(tool_binary.into());
        self
    }

    pub fn with_session(mut self, session: ShellSessionConfig) -> Self {
        self.session = session;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Unallocated,
    Acquiring,
    Ready,
    Releasing,
    Released,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unallocated => "unallocated",
            Self::Acquiring => "acquiring",
            Self::Ready => "ready",
            Self::Releasing => "releasing",
            Self::Released => "released",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub container_id: Option<String>,
    pub release_calls: usize,
}

/// What a ready sandbox hands to executors.
#[derive(Clone)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub container_id: String,
    pub session: Arc<ShellSession>,
    pub translator: PathTranslator,
    /// In-container path of the tool executable, when one was provisioned.
    pub tool_binary: Option<String>,
}

#[derive(Debug, Error)]
enum ProvisionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("tool executable `{path}` is not runnable inside the container")]
    ToolBinary { path: String },
    #[error("container `{container}` does not mount `{host}` at `{destination}`")]
    WorkspaceNotMounted {
        container: String,
        host: String,
        destination: String,
    },
}

#[derive(Debug, Clone)]
struct ContainerRef {
    id: String,
    /// Created by this sandbox and therefore removed on release.
    owned: bool,
}

struct Lifecycle {
    state: SandboxState,
    container: Option<ContainerRef>,
    session: Option<Arc<ShellSession>>,
}

/// Owns one container from acquisition to teardown.
///
/// Acquire and release are serialized on one lock. Release is idempotent
/// and also cleans up after a failed or interrupted acquire.
pub struct ContainerSandbox {
    id: String,
    engine: Arc<dyn ContainerEngine>,
    settings: SandboxSettings,
    lifecycle: Mutex<Lifecycle>,
    release_calls: AtomicUsize,
}

impl ContainerSandbox {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: SandboxSettings) -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(12);
        Self {
            id,
            engine,
            settings,
            lifecycle: Mutex::new(Lifecycle {
                state: SandboxState::Unallocated,
                container: None,
                session: None,
            }),
            release_calls: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> SandboxStatus {
        let lifecycle = self.lifecycle.lock().await;
        SandboxStatus {
            state: lifecycle.state,
            container_id: lifecycle
                .container
                .as_ref()
                .map(|container| container.id.clone()),
            release_calls: self.release_calls.load(Ordering::SeqCst),
        }
    }

    pub async fn acquire(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != SandboxState::Unallocated {
            return Err(SandboxError::InvalidState {
                operation: "acquire",
                state: lifecycle.state.to_string(),
            });
        }
        lifecycle.state = SandboxState::Acquiring;
        info!(sandbox = %self.id, source = %spec.label(), "acquiring sandbox");

        match self.provision(spec, &mut lifecycle).await {
            Ok(handle) => {
                lifecycle.state = SandboxState::Ready;
                info!(sandbox = %self.id, container = %handle.container_id, "sandbox ready");
                Ok(handle)
            }
            Err(error) => {
                warn!(sandbox = %self.id, %error, "sandbox acquisition failed");
                if let Err(cleanup) = self.teardown(&mut lifecycle).await {
                    warn!(sandbox = %self.id, %cleanup, "cleanup after failed acquisition failed");
                }
                lifecycle.state = SandboxState::Released;
                Err(SandboxError::Acquisition {
                    source_label: spec.label(),
                    message: error.to_string(),
                })
            }
        }
    }

    pub async fn release(&self) -> Result<(), SandboxError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == SandboxState::Released {
            debug!(sandbox = %self.id, "sandbox already released");
            return Ok(());
        }

        lifecycle.state = SandboxState::Releasing;
        let result = self.teardown(&mut lifecycle).await;
        lifecycle.state = SandboxState::Released;
        info!(sandbox = %self.id, "sandbox released");
        result.map_err(|error| SandboxError::Release {
            message: error.to_string(),
        })
    }

    async fn provision(
        &self,
        spec: &SandboxSpec,
        lifecycle: &mut Lifecycle,
    ) -> Result<SandboxHandle, ProvisionError> {
        let mapping = WorkspaceMapping::new(
            &self.settings.host_workspace,
            &self.settings.container_workspace,
        )?;

        let container_id = match spec {
            SandboxSpec::Image(image) => {
                self.engine.ensure_image(image).await?;
                self.launch(image.clone(), lifecycle).await?
            }
            SandboxSpec::Dockerfile {
                dockerfile,
                context,
            } => {
                let tag = format!("{}-sandbox:{}", self.settings.name_prefix, self.id);
                self.engine.build_image(dockerfile, context, &tag).await?;
                self.launch(tag, lifecycle).await?
            }
            SandboxSpec::Archive(archive) => {
                let image = self.engine.load_image(archive).await?;
                self.launch(image, lifecycle).await?
            }
            SandboxSpec::Container(id) => self.attach(id, lifecycle).await?,
        };

        let tool_binary = match &self.settings.tool_binary {
            Some(_) => {
                self.verify_tool_binary(&container_id).await?;
                Some(CONTAINER_TOOL_BINARY.to_owned())
            }
            None => None,
        };

        let transport = ContainerShellTransport::new(self.engine.clone(), container_id.clone());
        let session = Arc::new(ShellSession::new(
            Arc::new(transport),
            ShellSessionConfig {
                initial_cwd: Some(self.settings.container_workspace.clone()),
                ..self.settings.session.clone()
            },
        ));
        session.run("true", READINESS_TIMEOUT).await?;
        lifecycle.session = Some(session.clone());

        Ok(SandboxHandle {
            sandbox_id: self.id.clone(),
            container_id,
            session,
            translator: PathTranslator::new(mapping),
            tool_binary,
        })
    }

    async fn launch(
        &self,
        image: String,
        lifecycle: &mut Lifecycle,
    ) -> Result<String, ProvisionError> {
        let request = self.container_request(image);
        let id = self.engine.create_container(&request).await?;
        lifecycle.container = Some(ContainerRef {
            id: id.clone(),
            owned: true,
        });
        self.engine.start_container(&id).await?;
        Ok(id)
    }

    async fn attach(&self, id: &str, lifecycle: &mut Lifecycle) -> Result<String, ProvisionError> {
        let container = self.engine.inspect_container(id).await?;
        lifecycle.container = Some(ContainerRef {
            id: id.to_owned(),
            owned: false,
        });
        if !container.running {
            self.engine.start_container(id).await?;
        }
        self.check_workspace_mount(id, &container)?;
        if let Some(tool_binary) = &self.settings.tool_binary {
            self.copy_tool_binary(id, tool_binary).await?;
        }
        Ok(id.to_owned())
    }

    fn container_request(&self, image: String) -> ContainerRequest {
        let mut binds = vec![format!(
            "{}:{}:rw",
            self.settings.host_workspace.to_string_lossy(),
            self.settings.container_workspace
        )];
        if let Some(tool_binary) = &self.settings.tool_binary {
            binds.push(format!(
                "{}:{CONTAINER_TOOL_BINARY}:ro",
                tool_binary.to_string_lossy()
            ));
        }
        ContainerRequest {
            name: format!("{}-{}", self.settings.name_prefix, self.id),
            image,
            binds,
            labels: HashMap::from([
                ("stepforge.sandbox_id".to_owned(), self.id.clone()),
                (
                    "stepforge.workspace".to_owned(),
                    self.settings.host_workspace.to_string_lossy().into_owned(),
                ),
            ]),
            working_dir: Some(self.settings.container_workspace.clone()),
        }
    }

    /// File tools translate workspace paths onto the container root, so an
    /// attached container must bind the same host directory there.
    fn check_workspace_mount(
        &self,
        id: &str,
        container: &ContainerInfo,
    ) -> Result<(), ProvisionError> {
        let host = self.settings.host_workspace.as_path();
        let root = Path::new("/");
        let destination = normalize(Path::new(&self.settings.container_workspace), root);
        let mounted = container.mounts.iter().any(|mount| {
            normalize(Path::new(&mount.destination), root) == destination
                && Path::new(&mount.source) == host
        });
        if mounted {
            return Ok(());
        }
        Err(ProvisionError::WorkspaceNotMounted {
            container: id.to_owned(),
            host: host.display().to_string(),
            destination: self.settings.container_workspace.clone(),
        })
    }

    async fn copy_tool_binary(&self, id: &str, tool_binary: &Path) -> Result<(), ProvisionError> {
        let mkdir = vec![
            "mkdir".to_owned(),
            "-p".to_owned(),
            CONTAINER_TOOL_DIR.to_owned(),
        ];
        self.engine.exec(id, &mkdir, CONTROL_OUTPUT_BYTES).await?;
        self.engine
            .copy_into(id, tool_binary, CONTAINER_TOOL_BINARY)
            .await?;
        Ok(())
    }

    async fn verify_tool_binary(&self, id: &str) -> Result<(), ProvisionError> {
        let check = vec![
            "test".to_owned(),
            "-x".to_owned(),
            CONTAINER_TOOL_BINARY.to_owned(),
        ];
        let output = self.engine.exec(id, &check, CONTROL_OUTPUT_BYTES).await?;
        if output.exit_code != Some(0) {
            return Err(ProvisionError::ToolBinary {
                path: CONTAINER_TOOL_BINARY.to_owned(),
            });
        }
        Ok(())
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle) -> Result<(), EngineError> {
        if let Some(session) = lifecycle.session.take() {
            session.close().await;
        }

        let Some(container) = lifecycle.container.take() else {
            return Ok(());
        };
        if !container.owned {
            debug!(container = %container.id, "leaving attached container running");
            return Ok(());
        }

        if let Err(error) = self.engine.stop_container(&container.id).await
            && !error.is_not_found()
        {
            debug!(container = %container.id, %error, "stop before removal failed");
        }
        match self.engine.remove_container(&container.id).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error),
        }
    }
}

impl Drop for ContainerSandbox {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock()
            && lifecycle.state != SandboxState::Released
            && let Some(container) = &lifecycle.container
        {
            warn!(
                sandbox = %self.id,
                container = %container.id,
                "sandbox dropped without release"
            );
        }
    }
}
