use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use mockall::mock;
use runtime::{ExecutionMode, ParallelDispatcher, TaskRunner};
use sandbox::{
    ContainerEngine, ContainerInfo, ContainerRequest, ContainerSandbox, EngineError, ExecOutput,
    SandboxSettings,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tools::{LocalExecutor, ToolRegistry};
use types::{
    AgentSettings, AgentState, AgentStep, BASH_TOOL_NAME, Context, Decision, EDIT_TOOL_NAME,
    Provider, ProviderError, ProviderId, RunOutcome, SEQUENTIAL_THINKING_TOOL_NAME, SandboxSpec,
    TASK_DONE_TOOL_NAME, Task, ToolCall, ToolContext, ToolsConfig, TrajectoryError,
    TrajectorySink,
};

mock! {
    ProviderContract {}
    #[async_trait]
    impl Provider for ProviderContract {
        fn provider_id(&self) -> &ProviderId;
        async fn decide(&self, context: &Context) -> Result<Decision, ProviderError>;
    }
}

struct ScriptedProvider {
    provider_id: ProviderId,
    decisions: Mutex<VecDeque<Decision>>,
}

impl ScriptedProvider {
    fn new(decisions: Vec<Decision>) -> Self {
        Self {
            provider_id: ProviderId::from("scripted"),
            decisions: Mutex::new(decisions.into()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    async fn decide(&self, _context: &Context) -> Result<Decision, ProviderError> {
        self.decisions
            .lock()
            .expect("decisions mutex")
            .pop_front()
            .ok_or_else(|| ProviderError::RequestFailed {
                provider: self.provider_id.clone(),
                message: "script exhausted".to_owned(),
            })
    }
}

#[derive(Default)]
struct RecordingSink {
    steps: Mutex<Vec<AgentStep>>,
    outcomes: Mutex<Vec<RunOutcome>>,
}

#[async_trait]
impl TrajectorySink for RecordingSink {
    async fn record(&self, step: &AgentStep) -> Result<(), TrajectoryError> {
        self.steps.lock().expect("steps mutex").push(step.clone());
        Ok(())
    }

    async fn finalize(&self, outcome: &RunOutcome) -> Result<(), TrajectoryError> {
        self.outcomes
            .lock()
            .expect("outcomes mutex")
            .push(outcome.clone());
        Ok(())
    }
}

/// Engine with no images and no containers.
struct EmptyEngine;

fn missing(operation: &'static str, target: &str) -> EngineError {
    EngineError::NotFound {
        operation,
        target: target.to_owned(),
    }
}

#[async_trait]
impl ContainerEngine for EmptyEngine {
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        Err(missing("pull_image", image))
    }

    async fn build_image(
        &self,
        _dockerfile: &Path,
        _context: &Path,
        tag: &str,
    ) -> Result<(), EngineError> {
        Err(missing("build_image", tag))
    }

    async fn load_image(&self, archive: &Path) -> Result<String, EngineError> {
        Err(missing("load_image", &archive.display().to_string()))
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String, EngineError> {
        Err(missing("create_container", &request.image))
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        Err(missing("start_container", id))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        Err(missing("inspect_container", id))
    }

    async fn copy_into(
        &self,
        id: &str,
        _source: &Path,
        _destination: &str,
    ) -> Result<(), EngineError> {
        Err(missing("copy_into", id))
    }

    async fn exec(
        &self,
        id: &str,
        _argv: &[String],
        _capture_limit: usize,
    ) -> Result<ExecOutput, EngineError> {
        Err(missing("exec", id))
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        Err(missing("stop_container", id))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        Err(missing("remove_container", id))
    }
}

fn builtin_registry() -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::from_config(&ToolsConfig::default()).expect("built-in tools"))
}

fn budget(max_steps: usize) -> AgentSettings {
    AgentSettings {
        max_steps,
        ..AgentSettings::default()
    }
}

fn local_mode() -> ExecutionMode {
    ExecutionMode::Local {
        shell: shell::default_shell_binary(),
    }
}

#[tokio::test]
async fn lists_files_then_creates_notes_and_finishes() {
    let workspace = tempfile::tempdir().expect("workspace");
    std::fs::write(workspace.path().join("README.md"), "hello\n").expect("seed file");
    let notes = workspace.path().join("notes.txt");

    let provider = Arc::new(ScriptedProvider::new(vec![
        Decision::with_tool_calls(vec![ToolCall::new(
            "ls",
            BASH_TOOL_NAME,
            json!({"command": "ls"}),
        )]),
        Decision::with_tool_calls(vec![
            ToolCall::new(
                "create",
                EDIT_TOOL_NAME,
                json!({
                    "command": "create",
                    "path": notes.display().to_string(),
                    "file_text": "remember the milk\n",
                }),
            ),
            ToolCall::new("done", TASK_DONE_TOOL_NAME, json!({})),
        ]),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let runner = TaskRunner::new(provider, builtin_registry(), "scripted-model")
        .with_settings(budget(5))
        .with_sink(sink.clone());
    let task = Task::new("list files then create file notes.txt", workspace.path());

    let outcome = runner
        .run(&task, local_mode(), &CancellationToken::new())
        .await;

    assert_eq!(outcome.state, AgentState::Done, "{outcome:?}");
    assert!(outcome.steps <= 5);

    let steps = sink.steps.lock().expect("steps mutex").clone();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].tool_calls[0].name, BASH_TOOL_NAME);
    assert!(steps[0].tool_results[0].success);
    assert!(steps[0].tool_results[0].output.contains("README.md"));
    assert!(steps[1].tool_results.iter().all(|result| result.success));

    assert_eq!(
        std::fs::read_to_string(&notes).expect("notes.txt written"),
        "remember the milk\n"
    );
    let outcomes = sink.outcomes.lock().expect("outcomes mutex").clone();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, AgentState::Done);
}

#[tokio::test]
async fn budget_of_one_stops_after_a_single_step() {
    let workspace = tempfile::tempdir().expect("workspace");
    let mut provider = MockProviderContract::new();
    provider
        .expect_provider_id()
        .return_const(ProviderId::from("mock"));
    provider.expect_decide().times(1).returning(|_| {
        Ok(Decision::with_tool_calls(vec![ToolCall::new(
            "t",
            SEQUENTIAL_THINKING_TOOL_NAME,
            json!({
                "thought": "keep going",
                "thought_number": 1,
                "total_thoughts": 3,
                "next_thought_needed": true,
            }),
        )]))
    });
    let sink = Arc::new(RecordingSink::default());
    let runner = TaskRunner::new(Arc::new(provider), builtin_registry(), "mock-model")
        .with_settings(budget(1))
        .with_sink(sink.clone());

    let outcome = runner
        .run(
            &Task::new("think forever", workspace.path()),
            local_mode(),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.state, AgentState::MaxSteps);
    assert_eq!(outcome.steps, 1);
    assert_eq!(sink.steps.lock().expect("steps mutex").len(), 1);
}

#[tokio::test]
async fn missing_image_ends_in_error_and_releases_once() {
    let workspace = tempfile::tempdir().expect("workspace");
    let mut provider = MockProviderContract::new();
    provider.expect_decide().never();
    let sink = Arc::new(RecordingSink::default());
    let runner = TaskRunner::new(Arc::new(provider), builtin_registry(), "mock-model")
        .with_settings(budget(5))
        .with_sink(sink.clone());
    let sandbox = Arc::new(ContainerSandbox::new(
        Arc::new(EmptyEngine),
        SandboxSettings::new(workspace.path(), "/workspace"),
    ));

    let outcome = runner
        .run(
            &Task::new("anything", workspace.path()),
            ExecutionMode::Sandboxed {
                sandbox: sandbox.clone(),
                spec: SandboxSpec::Image("does-not-exist:latest".to_owned()),
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.state, AgentState::Error);
    assert_eq!(outcome.steps, 0);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("does-not-exist:latest"))
    );
    assert_eq!(sandbox.status().await.release_calls, 1);
    assert!(sink.steps.lock().expect("steps mutex").is_empty());
    assert_eq!(sink.outcomes.lock().expect("outcomes mutex").len(), 1);
}

#[tokio::test]
async fn dispatcher_returns_one_result_per_call_with_exact_failures() {
    let workspace = tempfile::tempdir().expect("workspace");
    let executor = Arc::new(LocalExecutor::new(
        builtin_registry(),
        ToolContext::default(),
    ));
    let dispatcher = ParallelDispatcher::new(executor);

    let calls = (0..8)
        .map(|index| {
            if index % 3 == 0 {
                ToolCall::new(
                    format!("call-{index}"),
                    EDIT_TOOL_NAME,
                    json!({"command": "view", "path": format!("relative-{index}.txt")}),
                )
            } else {
                ToolCall::new(
                    format!("call-{index}"),
                    EDIT_TOOL_NAME,
                    json!({
                        "command": "create",
                        "path": workspace.path().join(format!("file-{index}.txt")).display().to_string(),
                        "file_text": format!("{index}\n"),
                    }),
                )
            }
        })
        .collect::<Vec<_>>();

    let report = dispatcher
        .dispatch_all(&calls, &CancellationToken::new())
        .await;

    assert_eq!(report.results.len(), 8);
    assert_eq!(report.failed_count(), 3);
    for (call, result) in calls.iter().zip(&report.results) {
        assert_eq!(call.id, result.id);
        let expect_failure = call.arguments["command"] == "view";
        assert_eq!(result.success, !expect_failure, "{result:?}");
        assert_eq!(result.error.is_some(), expect_failure);
    }
}
