use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shell::{RawOutput, ShellTransport, TransportError};
use tokio::time;
use tracing::warn;

use crate::engine::{CONTROL_OUTPUT_BYTES, ContainerEngine};

/// Runs the payload with bash when the image has it, recording the wrapper
/// pid so a timed-out exec can be killed from a second exec.
const EXEC_WRAPPER: &str = r#"echo $$ > "$1"
if command -v bash >/dev/null 2>&1; then bash -c "$2"; else sh -c "$2"; fi
__sf_ec=$?
rm -f "$1"
exit $__sf_ec"#;

/// Kills the recorded pid and every descendant.
const KILL_SCRIPT: &str = r#"kill_tree() {
  for child in $(cat /proc/"$1"/task/*/children 2>/dev/null); do kill_tree "$child"; done
  kill -KILL "$1" 2>/dev/null
}
pid=$(cat "$1" 2>/dev/null) || exit 0
[ -n "$pid" ] && kill_tree "$pid"
rm -f "$1"
exit 0"#;

/// Relays session scripts into a running container via exec.
pub struct ContainerShellTransport {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
}

impl ContainerShellTransport {
    pub fn new(engine: Arc<dyn ContainerEngine>, container_id: impl Into<String>) -> Self {
        Self {
            engine,
            container_id: container_id.into(),
        }
    }
}

fn kill_argv(pid_file: &str) -> Vec<String> {
    vec![
        "sh".to_owned(),
        "-c".to_owned(),
        KILL_SCRIPT.to_owned(),
        "stepforge-kill".to_owned(),
        pid_file.to_owned(),
    ]
}

async fn terminate(engine: &dyn ContainerEngine, container_id: &str, pid_file: &str) -> bool {
    match engine
        .exec(container_id, &kill_argv(pid_file), CONTROL_OUTPUT_BYTES)
        .await
    {
        Ok(output) => output.exit_code == Some(0),
        Err(error) => {
            warn!(container = %container_id, %error, "failed to kill timed-out exec");
            false
        }
    }
}

/// Kills the in-flight exec from a second exec when dropped unless
/// disarmed, so an abandoned run does not keep running in the container.
struct ExecGuard {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
    pid_file: Option<String>,
}

impl ExecGuard {
    async fn kill(&mut self) -> bool {
        match self.pid_file.take() {
            Some(pid_file) => terminate(self.engine.as_ref(), &self.container_id, &pid_file).await,
            None => true,
        }
    }

    fn disarm(&mut self) {
        self.pid_file = None;
    }
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        let Some(pid_file) = self.pid_file.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = self.engine.clone();
        let container_id = self.container_id.clone();
        runtime.spawn(async move {
            terminate(engine.as_ref(), &container_id, &pid_file).await;
        });
    }
}

#[async_trait]
impl ShellTransport for ContainerShellTransport {
    async fn execute(
        &self,
        script: &str,
        timeout: Duration,
        capture_limit: usize,
    ) -> Result<RawOutput, TransportError> {
        let pid_file = format!("/tmp/.stepforge-{}.pid", uuid::Uuid::new_v4().simple());
        let argv = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            EXEC_WRAPPER.to_owned(),
            "stepforge-exec".to_owned(),
            pid_file.clone(),
            script.to_owned(),
        ];
        let mut guard = ExecGuard {
            engine: self.engine.clone(),
            container_id: self.container_id.clone(),
            pid_file: Some(pid_file),
        };

        let run = self.engine.exec(&self.container_id, &argv, capture_limit);
        match time::timeout(timeout, run).await {
            Ok(Ok(output)) => {
                guard.disarm();
                Ok(RawOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output
                        .exit_code
                        .and_then(|code| i32::try_from(code).ok()),
                })
            }
            Ok(Err(error)) => {
                guard.disarm();
                if error.is_unavailable() {
                    Err(TransportError::Unavailable(error.to_string()))
                } else {
                    Err(TransportError::Spawn(error.to_string()))
                }
            }
            Err(_) => Err(TransportError::TimedOut {
                terminated: guard.kill().await,
            }),
        }
    }

    fn describe(&self) -> String {
        format!("container:{}", self.container_id)
    }
}
