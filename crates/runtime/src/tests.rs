use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use mockall::mock;
use serde_json::{Value, json};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tools::{ToolExecutor, ToolRegistry};
use types::{
    AgentSettings, AgentState, AgentStep, Context, Decision, FunctionDecl, MessageRole, Provider,
    ProviderError, ProviderId, RunOutcome, SandboxError, TASK_DONE_TOOL_NAME, Task, Tool,
    ToolCall, ToolContext, ToolError, ToolExecResult, ToolFootprint, ToolResult, TrajectoryError,
    TrajectorySink,
};

use super::{AgentLoop, IDLE_NUDGE, JsonlTrajectory, ParallelDispatcher, normalize_call_ids};

mock! {
    ProviderContract {}
    #[async_trait]
    impl Provider for ProviderContract {
        fn provider_id(&self) -> &ProviderId;
        async fn decide(&self, context: &Context) -> Result<Decision, ProviderError>;
    }
}

#[derive(Debug)]
enum ProviderStep {
    Decide(Decision),
    DecideDelayed { decision: Decision, delay: Duration },
    Fail(ProviderError),
}

struct FakeProvider {
    provider_id: ProviderId,
    steps: Mutex<VecDeque<ProviderStep>>,
    seen: Mutex<Vec<Context>>,
}

impl FakeProvider {
    fn new(steps: Vec<ProviderStep>) -> Self {
        Self {
            provider_id: ProviderId::from("fake"),
            steps: Mutex::new(steps.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn contexts(&self) -> Vec<Context> {
        self.seen.lock().expect("seen mutex").clone()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    async fn decide(&self, context: &Context) -> Result<Decision, ProviderError> {
        self.seen.lock().expect("seen mutex").push(context.clone());
        let step = self
            .steps
            .lock()
            .expect("steps mutex")
            .pop_front()
            .expect("test provider expected another scripted step");
        match step {
            ProviderStep::Decide(decision) => Ok(decision),
            ProviderStep::DecideDelayed { decision, delay } => {
                sleep(delay).await;
                Ok(decision)
            }
            ProviderStep::Fail(error) => Err(error),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    steps: Mutex<Vec<AgentStep>>,
    outcome: Mutex<Option<RunOutcome>>,
}

impl RecordingSink {
    fn steps(&self) -> Vec<AgentStep> {
        self.steps.lock().expect("steps mutex").clone()
    }
}

#[async_trait]
impl TrajectorySink for RecordingSink {
    async fn record(&self, step: &AgentStep) -> Result<(), TrajectoryError> {
        self.steps.lock().expect("steps mutex").push(step.clone());
        Ok(())
    }

    async fn finalize(&self, outcome: &RunOutcome) -> Result<(), TrajectoryError> {
        *self.outcome.lock().expect("outcome mutex") = Some(outcome.clone());
        Ok(())
    }
}

/// Pure tool whose behaviour is picked by the `mode` argument.
struct StubTool {
    schema: FunctionDecl,
    calls: Arc<AtomicUsize>,
}

impl StubTool {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            schema: FunctionDecl::new(
                "stub",
                Some("test stub".to_owned()),
                json!({"type": "object", "properties": {"mode": {"type": "string"}}}),
            ),
            calls,
        }
    }
}

#[async_trait]
impl Tool for StubTool {
    fn schema(&self) -> &FunctionDecl {
        &self.schema
    }

    fn footprint(&self) -> ToolFootprint {
        ToolFootprint::Pure
    }

    async fn execute(
        &self,
        arguments: &Value,
        _context: &ToolContext,
    ) -> Result<ToolExecResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match arguments.get("mode").and_then(Value::as_str).unwrap_or("ok") {
            "fail" => Err(ToolError::InvalidArguments {
                tool: "stub".to_owned(),
                message: "asked to fail".to_owned(),
            }),
            "panic" => panic!("stub asked to panic"),
            "slow" => {
                sleep(Duration::from_millis(50)).await;
                Ok(ToolExecResult::ok("slow done"))
            }
            "hang" => {
                sleep(Duration::from_secs(30)).await;
                Ok(ToolExecResult::ok("never"))
            }
            other => Ok(ToolExecResult::ok(format!("stub {other}"))),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Executor that reports an unusable sandbox for one tool name.
struct FaultyExecutor {
    registry: ToolRegistry,
}

#[async_trait]
impl ToolExecutor for FaultyExecutor {
    fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    async fn execute_call(&self, call: &ToolCall) -> Result<ToolResult, SandboxError> {
        if call.name == "explode" {
            return Err(SandboxError::Fatal {
                message: "container vanished".to_owned(),
            });
        }
        Ok(ToolResult::success(call.id.clone(), "fine"))
    }
}

fn stub_executor(calls: Arc<AtomicUsize>) -> Arc<dyn ToolExecutor> {
    let registry = ToolRegistry::builder()
        .with_tool(StubTool::new(calls))
        .enable(TASK_DONE_TOOL_NAME)
        .expect("task_done is built in")
        .build();
    Arc::new(tools::LocalExecutor::new(
        Arc::new(registry),
        ToolContext::default(),
    ))
}

fn stub(id: &str, mode: &str) -> ToolCall {
    ToolCall::new(id, "stub", json!({"mode": mode}))
}

fn done(id: &str) -> ToolCall {
    ToolCall::new(id, TASK_DONE_TOOL_NAME, json!({}))
}

fn test_task() -> Task {
    Task::new("exercise the stub", "/work/project")
}

fn settings(max_steps: usize) -> AgentSettings {
    AgentSettings {
        max_steps,
        ..AgentSettings::default()
    }
}

#[tokio::test]
async fn dispatch_all_keeps_call_order_and_isolates_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = ParallelDispatcher::new(stub_executor(calls.clone()));
    let batch = vec![
        stub("a", "slow"),
        stub("b", "fail"),
        stub("c", "ok"),
        stub("d", "panic"),
        stub("e", "fail"),
    ];

    let report = dispatcher
        .dispatch_all(&batch, &CancellationToken::new())
        .await;

    let ids = report
        .results
        .iter()
        .map(|result| result.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(report.failed_count(), 3);
    assert!(report.results[0].success);
    assert_eq!(report.results[0].output, "slow done");
    assert!(
        report.results[3]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("panicked"))
    );
    assert!(report.fault.is_none());
    assert!(!report.cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn dispatch_all_runs_calls_concurrently() {
    let dispatcher = ParallelDispatcher::new(stub_executor(Arc::new(AtomicUsize::new(0))));
    let batch = (0..4)
        .map(|index| stub(&format!("slow-{index}"), "slow"))
        .collect::<Vec<_>>();

    let start = std::time::Instant::now();
    let report = dispatcher
        .dispatch_all(&batch, &CancellationToken::new())
        .await;

    assert_eq!(report.failed_count(), 0);
    assert!(
        start.elapsed() < Duration::from_millis(190),
        "four 50ms calls took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn dispatch_all_fails_in_flight_calls_on_cancellation() {
    let dispatcher = ParallelDispatcher::new(stub_executor(Arc::new(AtomicUsize::new(0))));
    let batch = vec![stub("a", "hang"), stub("b", "hang")];
    let cancellation = CancellationToken::new();
    let trigger = cancellation.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher.dispatch_all(&batch, &cancellation),
    )
    .await
    .expect("cancellation should end the batch promptly");

    assert!(report.cancelled);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.failed_count(), 2);
}

#[tokio::test]
async fn dispatch_all_surfaces_sandbox_fault_without_dropping_siblings() {
    let dispatcher = ParallelDispatcher::new(Arc::new(FaultyExecutor {
        registry: ToolRegistry::builder().build(),
    }));
    let batch = vec![
        ToolCall::new("1", "noop", json!({})),
        ToolCall::new("2", "explode", json!({})),
    ];

    let report = dispatcher
        .dispatch_all(&batch, &CancellationToken::new())
        .await;

    assert!(report.results[0].success);
    assert!(!report.results[1].success);
    assert!(matches!(report.fault, Some(SandboxError::Fatal { .. })));
}

#[test]
fn normalize_call_ids_replaces_missing_and_repeated_ids() {
    let calls = vec![stub("", "ok"), stub("x", "ok"), stub("x", "ok")];

    let normalized = normalize_call_ids(3, calls);

    let ids = normalized
        .iter()
        .map(|call| call.id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["call_3_0", "x", "call_3_2"]);
}

#[tokio::test]
async fn run_ends_in_done_when_task_done_is_called_with_siblings() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(FakeProvider::new(vec![
        ProviderStep::Decide(Decision::with_tool_calls(vec![stub("p1", "ok")])),
        ProviderStep::Decide(Decision {
            content: Some("wrapping up".to_owned()),
            tool_calls: vec![stub("p2", "ok"), done("d1")],
            finish_reason: Some("tool_calls".to_owned()),
        }),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentLoop::new(provider.clone(), stub_executor(calls.clone()), "test-model")
        .with_settings(settings(5))
        .with_sink(sink.clone());

    let outcome = agent.run(&test_task(), &CancellationToken::new()).await;

    assert_eq!(outcome.state, AgentState::Done);
    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.final_message.as_deref(), Some("wrapping up"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let steps = sink.steps();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_number, 1);
    assert_eq!(steps[0].state, AgentState::ToolExec);
    assert_eq!(steps[1].state, AgentState::Done);
    assert_eq!(steps[1].tool_results.len(), 2);

    let contexts = provider.contexts();
    assert_eq!(contexts[0].messages[0].role, MessageRole::System);
    assert!(
        contexts[0].messages[1]
            .content
            .as_deref()
            .is_some_and(|content| content.contains("/work/project"))
    );
    assert!(contexts[0].tools.iter().any(|tool| tool.name == "stub"));
    let tool_message = &contexts[1].messages[3];
    assert_eq!(tool_message.role, MessageRole::Tool);
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("p1"));
    assert_eq!(tool_message.content.as_deref(), Some("stub ok"));
}

#[tokio::test]
async fn run_stops_at_step_budget_without_another_model_call() {
    let mut provider = MockProviderContract::new();
    provider
        .expect_provider_id()
        .return_const(ProviderId::from("mock"));
    provider
        .expect_decide()
        .times(1)
        .returning(|_| Ok(Decision::with_tool_calls(vec![stub("p", "ok")])));
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentLoop::new(
        Arc::new(provider),
        stub_executor(Arc::new(AtomicUsize::new(0))),
        "test-model",
    )
    .with_settings(settings(1))
    .with_sink(sink.clone());

    let outcome = agent.run(&test_task(), &CancellationToken::new()).await;

    assert_eq!(outcome.state, AgentState::MaxSteps);
    assert_eq!(outcome.steps, 1);
    assert_eq!(sink.steps().len(), 1);
}

#[tokio::test]
async fn idle_decision_is_nudged_unless_idle_completion_is_enabled() {
    let provider = Arc::new(FakeProvider::new(vec![
        ProviderStep::Decide(Decision::text("thinking out loud")),
        ProviderStep::Decide(Decision::with_tool_calls(vec![done("d")])),
    ]));
    let agent = AgentLoop::new(
        provider.clone(),
        stub_executor(Arc::new(AtomicUsize::new(0))),
        "test-model",
    )
    .with_settings(settings(5));

    let outcome = agent.run(&test_task(), &CancellationToken::new()).await;

    assert_eq!(outcome.state, AgentState::Done);
    assert_eq!(outcome.steps, 2);
    let second = &provider.contexts()[1];
    let last = second.messages.last().expect("nudge message");
    assert_eq!(last.role, MessageRole::User);
    assert_eq!(last.content.as_deref(), Some(IDLE_NUDGE));

    let provider = Arc::new(FakeProvider::new(vec![ProviderStep::Decide(
        Decision::text("all finished"),
    )]));
    let agent = AgentLoop::new(
        provider,
        stub_executor(Arc::new(AtomicUsize::new(0))),
        "test-model",
    )
    .with_settings(AgentSettings {
        allow_idle_completion: true,
        ..settings(5)
    });

    let outcome = agent.run(&test_task(), &CancellationToken::new()).await;

    assert_eq!(outcome.state, AgentState::Done);
    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.final_message.as_deref(), Some("all finished"));
}

#[tokio::test]
async fn failed_tool_results_produce_a_reflection_and_the_loop_continues() {
    let provider = Arc::new(FakeProvider::new(vec![
        ProviderStep::Decide(Decision::with_tool_calls(vec![
            stub("good", "ok"),
            stub("bad", "fail"),
        ])),
        ProviderStep::Decide(Decision::with_tool_calls(vec![done("d")])),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentLoop::new(
        provider.clone(),
        stub_executor(Arc::new(AtomicUsize::new(0))),
        "test-model",
    )
    .with_settings(settings(5))
    .with_sink(sink.clone());

    let outcome = agent.run(&test_task(), &CancellationToken::new()).await;

    assert_eq!(outcome.state, AgentState::Done);
    let steps = sink.steps();
    let reflection = steps[0].reflection.as_deref().expect("reflection recorded");
    assert!(reflection.contains("`stub` (bad) failed"));
    assert!(reflection.contains("asked to fail"));
    assert!(steps[1].reflection.is_none());

    let second = &provider.contexts()[1];
    let last = second.messages.last().expect("reflection message");
    assert_eq!(last.role, MessageRole::User);
    assert_eq!(last.content.as_deref(), Some(reflection));
}

#[tokio::test]
async fn provider_failure_ends_in_error_with_a_recorded_step() {
    let provider = Arc::new(FakeProvider::new(vec![ProviderStep::Fail(
        ProviderError::HttpStatus {
            provider: ProviderId::from("fake"),
            status: 500,
            message: "upstream down".to_owned(),
        },
    )]));
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentLoop::new(
        provider,
        stub_executor(Arc::new(AtomicUsize::new(0))),
        "test-model",
    )
    .with_sink(sink.clone());

    let outcome = agent.run(&test_task(), &CancellationToken::new()).await;

    assert_eq!(outcome.state, AgentState::Error);
    assert_eq!(outcome.steps, 1);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("upstream down"))
    );
    let steps = sink.steps();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].state, AgentState::Error);
}

#[tokio::test]
async fn sandbox_fault_ends_the_run_in_error() {
    let provider = Arc::new(FakeProvider::new(vec![ProviderStep::Decide(
        Decision::with_tool_calls(vec![ToolCall::new("1", "explode", json!({}))]),
    )]));
    let executor = Arc::new(FaultyExecutor {
        registry: ToolRegistry::builder().build(),
    });
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentLoop::new(provider, executor, "test-model").with_sink(sink.clone());

    let outcome = agent.run(&test_task(), &CancellationToken::new()).await;

    assert_eq!(outcome.state, AgentState::Error);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("container vanished"))
    );
    assert_eq!(sink.steps()[0].state, AgentState::Error);
}

#[tokio::test]
async fn cancellation_before_the_first_step_skips_the_provider() {
    let mut provider = MockProviderContract::new();
    provider.expect_decide().never();
    let agent = AgentLoop::new(
        Arc::new(provider),
        stub_executor(Arc::new(AtomicUsize::new(0))),
        "test-model",
    );
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let outcome = agent.run(&test_task(), &cancellation).await;

    assert_eq!(outcome.state, AgentState::Error);
    assert_eq!(outcome.steps, 0);
    assert_eq!(outcome.error.as_deref(), Some("run cancelled"));
}

#[tokio::test]
async fn cancellation_during_a_provider_call_ends_in_error() {
    let provider = Arc::new(FakeProvider::new(vec![ProviderStep::DecideDelayed {
        decision: Decision::text("late"),
        delay: Duration::from_millis(250),
    }]));
    let agent = AgentLoop::new(
        provider,
        stub_executor(Arc::new(AtomicUsize::new(0))),
        "test-model",
    );
    let cancellation = CancellationToken::new();
    let trigger = cancellation.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let outcome = agent.run(&test_task(), &cancellation).await;

    assert_eq!(outcome.state, AgentState::Error);
    assert_eq!(outcome.error.as_deref(), Some("run cancelled"));
}

#[tokio::test]
async fn jsonl_trajectory_appends_steps_and_a_summary_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("run.jsonl");
    let sink = JsonlTrajectory::create(&path).expect("trajectory should open");
    let step = AgentStep {
        step_number: 1,
        state: AgentState::ToolExec,
        decision: Some(Decision::with_tool_calls(vec![stub("p", "ok")])),
        tool_calls: vec![stub("p", "ok")],
        tool_results: vec![ToolResult::success("p", "stub ok")],
        reflection: None,
        error: None,
        recorded_at: chrono::Utc::now(),
    };

    sink.record(&step).await.expect("record");
    let written = std::fs::read_to_string(&path).expect("step is written before finalize");
    assert_eq!(written.lines().count(), 1);

    sink.finalize(&RunOutcome {
        state: AgentState::Done,
        steps: 1,
        final_message: Some("done".to_owned()),
        error: None,
    })
    .await
    .expect("finalize");

    let contents = std::fs::read_to_string(&path).expect("trajectory contents");
    let lines = contents
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("json line"))
        .collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "step");
    assert_eq!(lines[0]["step_number"], 1);
    assert_eq!(lines[0]["state"], "tool_exec");
    assert_eq!(lines[0]["tool_results"][0]["id"], "p");
    assert_eq!(lines[1]["kind"], "outcome");
    assert_eq!(lines[1]["state"], "done");
}

#[test]
fn jsonl_trajectory_reports_unwritable_locations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, "not a directory").expect("write blocker");

    let error = JsonlTrajectory::create(blocker.join("run.jsonl"))
        .expect_err("a file cannot be a parent directory");

    assert!(matches!(error, TrajectoryError::Open { .. }));
}
