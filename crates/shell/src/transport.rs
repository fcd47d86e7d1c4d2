use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::CapturedStream;

/// Bytes captured from one script run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The script outlived its timeout. `terminated` is false when the
    /// in-flight process could not be killed.
    #[error("script timed out (terminated: {terminated})")]
    TimedOut { terminated: bool },
    #[error("failed to start script: {0}")]
    Spawn(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Where a session's scripts actually run: a host process or a container exec.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    /// Runs `script` to completion in a fresh shell process, keeping at most
    /// `capture_limit` bytes of the head of each stream plus
    /// [`STDOUT_TAIL_BYTES`](crate::STDOUT_TAIL_BYTES) of the end of stdout.
    async fn execute(
        &self,
        script: &str,
        timeout: Duration,
        capture_limit: usize,
    ) -> Result<RawOutput, TransportError>;

    fn describe(&self) -> String;
}
