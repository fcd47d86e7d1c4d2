use std::{fs, path::Path};

use runner::{
    CliOverrides, ConfigSearchPaths, EXIT_ERROR, Runner, TrajectoryOverrides,
    load_config_with_paths, resolve_workspace,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use types::AgentState;

fn isolated_paths(root: &Path, workspace: &Path) -> ConfigSearchPaths {
    ConfigSearchPaths {
        system_dir: root.join("system"),
        user_dir: None,
        workspace_dir: workspace.join(".stepforge"),
    }
}

#[tokio::test]
async fn unreachable_provider_ends_in_error_and_writes_the_trajectory() {
    let root = tempfile::tempdir().expect("tempdir");
    let workspace_dir = root.path().join("project");
    fs::create_dir_all(workspace_dir.join(".stepforge")).expect("workspace config dir");
    fs::write(
        workspace_dir.join(".stepforge/stepforge.toml"),
        r#"
[agent]
max_steps = 3

[provider]
kind = "ollama"
model = "llama3"
base_url = "http://127.0.0.1:9/v1"

[reliability]
max_attempts = 1
backoff_base_ms = 1
backoff_max_ms = 1
"#,
    )
    .expect("workspace config");
    let workspace = resolve_workspace(Some(&workspace_dir)).expect("workspace");
    let trajectory = root.path().join("logs").join("run.jsonl");

    let config = load_config_with_paths(
        &isolated_paths(root.path(), &workspace),
        None,
        CliOverrides {
            trajectory: Some(TrajectoryOverrides {
                path: Some(trajectory.clone()),
            }),
            ..CliOverrides::default()
        },
    )
    .expect("config should load");
    assert_eq!(config.agent.max_steps, 3);

    let runner = Runner::new(config, workspace.clone()).expect("runner should build");
    let summary = runner
        .run("list the files", &CancellationToken::new())
        .await
        .expect("setup should succeed");

    assert_eq!(summary.outcome.state, AgentState::Error);
    assert_eq!(summary.outcome.steps, 1);
    assert_eq!(summary.mode, "local");
    assert_eq!(summary.exit_code(), EXIT_ERROR);
    assert!(summary.lines().iter().any(|line| line == "state=ERROR"));

    let lines = fs::read_to_string(&trajectory)
        .expect("trajectory written")
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("json line"))
        .collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "step");
    assert_eq!(lines[0]["state"], "error");
    assert_eq!(lines[1]["kind"], "outcome");
    assert_eq!(lines[1]["state"], "error");
}

#[tokio::test]
async fn openai_without_a_key_fails_before_any_run() {
    let root = tempfile::tempdir().expect("tempdir");
    let workspace = resolve_workspace(Some(root.path())).expect("workspace");
    let mut config = load_config_with_paths(
        &isolated_paths(root.path(), &workspace),
        None,
        CliOverrides::default(),
    )
    .expect("defaults should load");
    config.provider.api_key_env = Some("STEPFORGE_TEST_UNSET_KEY".to_owned());

    if std::env::var("OPENAI_API_KEY").is_ok() || std::env::var("API_KEY").is_ok() {
        return;
    }
    let runner = Runner::new(config, workspace).expect("runner should build");
    let error = runner
        .run("anything", &CancellationToken::new())
        .await
        .expect_err("missing key should fail");
    assert!(error.to_string().contains("missing API key"));
}
