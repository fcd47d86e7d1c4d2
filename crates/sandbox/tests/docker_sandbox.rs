use std::{sync::Arc, time::Duration};

use sandbox::{ContainerSandbox, DockerEngine, SandboxSettings, SandboxState};
use types::{SandboxError, SandboxSpec};

async fn docker_or_skip() -> Option<Arc<DockerEngine>> {
    let engine = DockerEngine::connect_local().ok()?;
    match engine.ping().await {
        Ok(()) => Some(Arc::new(engine)),
        Err(error) => {
            eprintln!("skipping docker test: {error}");
            None
        }
    }
}

#[tokio::test]
async fn alpine_sandbox_writes_through_the_workspace_mount() {
    let Some(engine) = docker_or_skip().await else {
        return;
    };
    let workspace = tempfile::tempdir().expect("temp dir");
    let host_root = workspace.path().canonicalize().expect("canonical workspace");
    let sandbox = ContainerSandbox::new(engine, SandboxSettings::new(&host_root, "/workspace"));

    let handle = sandbox
        .acquire(&SandboxSpec::Image("alpine:3.20".to_owned()))
        .await
        .expect("alpine sandbox should start");
    let output = handle
        .session
        .run("echo from-container > notes.txt && pwd", Duration::from_secs(30))
        .await
        .expect("command should run in the container");
    assert_eq!(output.stdout.trim(), "/workspace");

    let written = std::fs::read_to_string(host_root.join("notes.txt")).expect("file on host");
    assert_eq!(written.trim(), "from-container");

    let error = handle
        .session
        .run("sleep 30", Duration::from_millis(500))
        .await
        .expect_err("sleep should time out");
    assert!(matches!(error, types::ShellError::Timeout { .. }));
    let after = handle
        .session
        .run("echo ok", Duration::from_secs(10))
        .await
        .expect("session survives a timeout");
    assert_eq!(after.stdout.trim(), "ok");

    sandbox.release().await.expect("release");
    sandbox.release().await.expect("second release");
    assert_eq!(sandbox.status().await.state, SandboxState::Released);
}

#[tokio::test]
async fn unknown_image_fails_acquisition() {
    let Some(engine) = docker_or_skip().await else {
        return;
    };
    let workspace = tempfile::tempdir().expect("temp dir");
    let sandbox = ContainerSandbox::new(
        engine,
        SandboxSettings::new(workspace.path(), "/workspace"),
    );
    let error = sandbox
        .acquire(&SandboxSpec::Image(
            "stepforge.invalid/does-not-exist:never".to_owned(),
        ))
        .await
        .err()
        .expect("missing image should fail");
    assert!(matches!(error, SandboxError::Acquisition { .. }));
    sandbox.release().await.expect("release after failure");
}
