use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{io::AsyncRead, process::Command, time};
use tracing::warn;

use crate::{
    OutputBuffer, RawOutput, STDOUT_TAIL_BYTES, ShellTransport, TransportError, read_bounded,
};

/// Runs session scripts as child processes of the engine.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    shell: String,
}

impl LocalTransport {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(default_shell_binary())
    }
}

#[async_trait]
impl ShellTransport for LocalTransport {
    async fn execute(
        &self,
        script: &str,
        timeout: Duration,
        capture_limit: usize,
    ) -> Result<RawOutput, TransportError> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|error| TransportError::Spawn(format!("{}: {error}", self.shell)))?;
        let mut group = GroupGuard { pid: child.id() };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let mut out = OutputBuffer::new(capture_limit, STDOUT_TAIL_BYTES);
            let mut err = OutputBuffer::new(capture_limit, 0);
            let (out_read, err_read) = tokio::join!(
                drain(stdout, &mut out),
                drain(stderr, &mut err)
            );
            out_read?;
            err_read?;
            let status = child.wait().await?;
            Ok::<_, io::Error>(RawOutput {
                stdout: out.finish(),
                stderr: err.finish(),
                exit_code: status.code(),
            })
        };

        match time::timeout(timeout, run).await {
            Ok(Ok(output)) => {
                group.disarm();
                Ok(output)
            }
            Ok(Err(error)) => Err(TransportError::Spawn(error.to_string())),
            Err(_) => {
                let pid = group.pid;
                let terminated = group.kill();
                if !terminated {
                    warn!(?pid, "failed to kill timed-out shell process group");
                }
                Err(TransportError::TimedOut { terminated })
            }
        }
    }

    fn describe(&self) -> String {
        format!("local:{}", self.shell)
    }
}

async fn drain<R>(reader: Option<R>, buffer: &mut OutputBuffer) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => read_bounded(reader, buffer).await,
        None => Ok(()),
    }
}

/// Kills the script's process group when dropped unless disarmed. Covers a
/// run future dropped mid-command, where `kill_on_drop` only reaches the
/// direct child.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn kill(&mut self) -> bool {
        self.pid.take().is_some_and(kill_process_group)
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_process_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

// Dropping the child with kill_on_drop is all we can do here.
#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> bool {
    true
}

pub fn default_shell_binary() -> String {
    "/bin/sh".to_owned()
}
