use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use types::{CommandOutput, CommandRunner, ShellError, mark_truncated, truncate_output};

mod capture;
mod local;
mod script;
mod transport;

pub use capture::{CapturedStream, OutputBuffer, STDOUT_TAIL_BYTES, read_bounded};
pub use local::{LocalTransport, default_shell_binary};
pub use transport::{RawOutput, ShellTransport, TransportError};

use script::{ShellState, Trailer, build_script, split_output};

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSessionConfig {
    pub initial_cwd: Option<String>,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for ShellSessionConfig {
    fn default() -> Self {
        Self {
            initial_cwd: None,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionStatus {
    Open,
    Broken(String),
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: ShellState,
    status: SessionStatus,
}

/// A persistent command channel: the working directory and exported
/// variables left by one command are visible to the next.
///
/// Every command runs in a fresh shell process that first replays the
/// captured state, so a timed-out command can be killed without losing the
/// session. At most one command is in flight; callers queue on the lock.
pub struct ShellSession {
    transport: Arc<dyn ShellTransport>,
    config: ShellSessionConfig,
    marker: String,
    inner: Mutex<SessionInner>,
}

impl ShellSession {
    pub fn new(transport: Arc<dyn ShellTransport>, config: ShellSessionConfig) -> Self {
        let state = ShellState::starting_at(config.initial_cwd.clone());
        Self {
            transport,
            marker: format!("__STEPFORGE_{}__", uuid::Uuid::new_v4().simple()),
            config,
            inner: Mutex::new(SessionInner {
                state,
                status: SessionStatus::Open,
            }),
        }
    }

    pub fn local(shell: impl Into<String>, config: ShellSessionConfig) -> Self {
        Self::new(Arc::new(LocalTransport::new(shell)), config)
    }

    pub fn config(&self) -> &ShellSessionConfig {
        &self.config
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ShellError> {
        self.run_with_limit(command, timeout, self.config.max_output_bytes)
            .await
    }

    /// [`run`](Self::run) with a per-call output bound in place of the
    /// session's `max_output_bytes`. The timeout starts once the session is
    /// free, not while the call waits for an earlier command.
    pub async fn run_with_limit(
        &self,
        command: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<CommandOutput, ShellError> {
        if command.trim().is_empty() {
            return Err(ShellError::EmptyCommand);
        }

        let mut inner = self.inner.lock().await;
        match &inner.status {
            SessionStatus::Open => {}
            SessionStatus::Closed => return Err(ShellError::Closed),
            SessionStatus::Broken(message) => {
                return Err(ShellError::Unusable {
                    message: message.clone(),
                });
            }
        }

        let script = build_script(&inner.state, &self.marker, command);
        debug!(
            transport = %self.transport.describe(),
            command,
            ?timeout,
            "running shell command"
        );

        match self
            .transport
            .execute(&script, timeout, max_output_bytes)
            .await
        {
            Ok(raw) => {
                let (stdout, trailer) = render_stdout(raw.stdout, &self.marker, max_output_bytes);
                let exit_code = match trailer {
                    Some(trailer) => {
                        inner.state = trailer.state;
                        trailer.exit_code
                    }
                    None => raw.exit_code.unwrap_or(-1),
                };
                Ok(CommandOutput {
                    stdout,
                    stderr: render_stream(raw.stderr, max_output_bytes),
                    exit_code,
                })
            }
            Err(TransportError::TimedOut { terminated }) => {
                if !terminated {
                    let message = format!("could not terminate timed-out command `{command}`");
                    warn!(transport = %self.transport.describe(), "{message}");
                    inner.status = SessionStatus::Broken(message);
                }
                Err(ShellError::Timeout {
                    command: command.to_owned(),
                    timeout,
                })
            }
            Err(TransportError::Spawn(message)) => Err(ShellError::Spawn { message }),
            Err(TransportError::Unavailable(message)) => {
                inner.status = SessionStatus::Broken(message.clone());
                Err(ShellError::Unavailable { message })
            }
        }
    }

    /// Forgets the captured cwd and exports.
    pub async fn reset(&self) -> Result<(), ShellError> {
        let mut inner = self.inner.lock().await;
        if inner.status == SessionStatus::Closed {
            return Err(ShellError::Closed);
        }
        inner.state = ShellState::starting_at(self.config.initial_cwd.clone());
        Ok(())
    }

    /// Refuses further commands. Waits for an in-flight command first.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = SessionStatus::Closed;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.status == SessionStatus::Closed
    }

    pub async fn cwd(&self) -> Option<String> {
        self.inner.lock().await.state.cwd.clone()
    }
}

/// Splits the trailer off captured stdout and bounds the command's own
/// output, naming its full length when some of it was dropped.
fn render_stdout(
    stdout: CapturedStream,
    marker: &str,
    max_output_bytes: usize,
) -> (String, Option<Trailer>) {
    if stdout.is_complete() {
        let text = String::from_utf8_lossy(&stdout.into_bytes()).into_owned();
        let (body, trailer) = split_output(&text, marker);
        return (truncate_output(body, max_output_bytes), trailer);
    }

    let tail = String::from_utf8_lossy(&stdout.tail).into_owned();
    let (tail_body, trailer) = split_output(&tail, marker);
    let trailer_bytes = tail.len() - tail_body.len();
    let body_bytes = stdout.total.saturating_sub(trailer_bytes);
    let head = if body_bytes < stdout.head.len() {
        &stdout.head[..body_bytes]
    } else {
        &stdout.head[..]
    };
    let head = String::from_utf8_lossy(head).into_owned();
    if body_bytes <= max_output_bytes {
        return (head, trailer);
    }
    (mark_truncated(head, max_output_bytes, body_bytes), trailer)
}

fn render_stream(stream: CapturedStream, max_output_bytes: usize) -> String {
    if stream.is_complete() {
        return truncate_output(
            String::from_utf8_lossy(&stream.into_bytes()).into_owned(),
            max_output_bytes,
        );
    }
    let total = stream.total;
    let head = String::from_utf8_lossy(&stream.head).into_owned();
    mark_truncated(head, max_output_bytes, total)
}

#[async_trait]
impl CommandRunner for ShellSession {
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ShellError> {
        ShellSession::run(self, command, timeout.unwrap_or(self.config.default_timeout)).await
    }

    async fn reset(&self) -> Result<(), ShellError> {
        ShellSession::reset(self).await
    }
}
