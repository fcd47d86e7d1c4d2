use std::{path::Path, sync::Arc};

use sandbox::{PathTranslator, SandboxHandle, WorkspaceMapping};
use serde_json::json;
use shell::{ShellSession, ShellSessionConfig, default_shell_binary};
use tools::{SandboxedExecutor, ToolExecutor, ToolRegistry};
use types::{EDIT_TOOL_NAME, ToolCall, ToolsConfig};

const TOOL_BINARY: &str = env!("CARGO_BIN_EXE_stepforge-tool");

/// A sandbox whose container side is the host directory itself, with the
/// real tool executable standing in for the provisioned one.
fn same_directory_sandbox(root: &Path) -> SandboxHandle {
    let session = ShellSession::local(
        default_shell_binary(),
        ShellSessionConfig {
            initial_cwd: Some(root.to_string_lossy().into_owned()),
            ..ShellSessionConfig::default()
        },
    );
    SandboxHandle {
        sandbox_id: "sb-relay".to_owned(),
        container_id: "ctr-relay".to_owned(),
        session: Arc::new(session),
        translator: PathTranslator::new(WorkspaceMapping::new(root, root).expect("mapping")),
        tool_binary: Some(TOOL_BINARY.to_owned()),
    }
}

fn executor(root: &Path) -> SandboxedExecutor {
    let registry = ToolRegistry::from_config(&ToolsConfig::default()).expect("default tools");
    SandboxedExecutor::new(Arc::new(registry), same_directory_sandbox(root))
}

#[tokio::test]
async fn viewing_a_file_larger_than_the_output_bound_is_truncated_not_lost() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let path = workspace.path().join("large.txt");
    // Tabs and quotes grow the JSON reply well past the raw output bound.
    let text: String = (0..2_000)
        .map(|line| format!("line {line}\t\"quoted\"\tvalue\n"))
        .collect();
    std::fs::write(&path, &text).expect("seed");

    let result = executor(workspace.path())
        .execute_call(&ToolCall::new(
            "c1",
            EDIT_TOOL_NAME,
            json!({"command": "view", "path": path.to_string_lossy()}),
        ))
        .await
        .expect("sandbox healthy");

    assert!(result.success, "{result:?}");
    assert!(result.output.contains("line 0\t\"quoted\""), "{}", result.output);
    assert!(result.output.contains("bytes total]"), "{}", result.output);
    assert!(!result.output.contains("line 1999"));
}

#[tokio::test]
async fn relayed_create_writes_through_the_real_executable() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let path = workspace.path().join("made.txt");

    let result = executor(workspace.path())
        .execute_call(&ToolCall::new(
            "c1",
            EDIT_TOOL_NAME,
            json!({"command": "create", "path": path.to_string_lossy(), "file_text": "made"}),
        ))
        .await
        .expect("sandbox healthy");

    assert!(result.success, "{result:?}");
    assert_eq!(std::fs::read_to_string(&path).expect("created"), "made");
}
