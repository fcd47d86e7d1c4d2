use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use shell::CapturedStream;
use thiserror::Error;

/// Output bound for housekeeping execs whose output is never shown.
pub(crate) const CONTROL_OUTPUT_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    /// `source:destination[:mode]` bind specifications.
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerInfo {
    pub running: bool,
    pub mounts: Vec<MountInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine unreachable: {message}")]
    Unreachable { message: String },
    #[error("`{target}` not found during {operation}")]
    NotFound {
        operation: &'static str,
        target: String,
    },
    /// The target exists but is in the wrong state, e.g. a stopped container.
    #[error("{operation} conflicts with the state of `{target}`: {message}")]
    Conflict {
        operation: &'static str,
        target: String,
        message: String,
    },
    #[error("{operation} failed for `{target}`: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the engine or the target container is gone for good.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::NotFound { .. } | Self::Conflict { .. }
        )
    }

    pub fn operation(operation: &'static str, target: &str, message: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            target: target.to_owned(),
            message: message.into(),
        }
    }
}

/// The container operations a sandbox needs from its engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Makes `image` available locally, pulling it when missing.
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;

    async fn build_image(
        &self,
        dockerfile: &Path,
        context: &Path,
        tag: &str,
    ) -> Result<(), EngineError>;

    /// Loads an image archive and returns the loaded image reference.
    async fn load_image(&self, archive: &Path) -> Result<String, EngineError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, request: &ContainerRequest) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError>;

    async fn copy_into(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
    ) -> Result<(), EngineError>;

    /// Runs `argv` in the container. Each stream keeps at most
    /// `capture_limit` leading bytes; stdout also keeps its last
    /// [`STDOUT_TAIL_BYTES`](shell::STDOUT_TAIL_BYTES).
    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        capture_limit: usize,
    ) -> Result<ExecOutput, EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    /// Force-removes a container. A missing container is reported as
    /// `NotFound`.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}
