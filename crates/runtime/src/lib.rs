use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tools::ToolExecutor;
use types::{
    AgentSettings, AgentState, AgentStep, Context, Decision, FunctionDecl, Message, ModelId,
    NullTrajectory, Provider, RunOutcome, RuntimeError, TASK_DONE_TOOL_NAME, Task, ToolCall,
    ToolResult, TrajectorySink,
};

mod dispatch;
mod task_runner;
mod trajectory;

pub use dispatch::{DispatchReport, ParallelDispatcher};
pub use task_runner::{ExecutionMode, TaskRunner};
pub use trajectory::JsonlTrajectory;

#[cfg(test)]
mod tests;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous software engineering agent. \
Work inside the project root given with the task. Use the available tools to inspect and \
change files and to run commands. Paths passed to file tools must be absolute. When the task \
is complete, call the `task_done` tool.";

pub const IDLE_NUDGE: &str = "No tool was called. If the task is complete, call the \
`task_done` tool; otherwise continue working with the available tools.";

/// Drives one task through model decisions and tool calls until the model
/// signals completion, the step budget runs out, or a fatal error occurs.
///
/// The loop owns the conversation. Sandbox and shell lifetimes belong to
/// the caller (see [`TaskRunner`]).
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    dispatcher: ParallelDispatcher,
    model: ModelId,
    settings: AgentSettings,
    sink: Arc<dyn TrajectorySink>,
}

enum StepFlow {
    Continue,
    Finished(RunOutcome),
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        executor: Arc<dyn ToolExecutor>,
        model: impl Into<ModelId>,
    ) -> Self {
        Self {
            provider,
            dispatcher: ParallelDispatcher::new(executor),
            model: model.into(),
            settings: AgentSettings::default(),
            sink: Arc::new(NullTrajectory),
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TrajectorySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Runs `task` to a terminal state. Failures are folded into the
    /// returned outcome; finalizing the sink is left to the caller.
    pub async fn run(&self, task: &Task, cancellation: &CancellationToken) -> RunOutcome {
        let mut conversation = self.seed(task);
        let tools = self.dispatcher.executor().registry().schemas().to_vec();
        let mut step = 0usize;

        tracing::info!(
            max_steps = self.settings.max_steps,
            tools = tools.len(),
            workspace = %task.workspace.display(),
            "starting agent run"
        );

        loop {
            match self
                .run_step(&mut conversation, &tools, &mut step, cancellation)
                .await
            {
                Ok(StepFlow::Continue) => {}
                Ok(StepFlow::Finished(outcome)) => {
                    tracing::info!(state = %outcome.state, steps = outcome.steps, "agent run finished");
                    return outcome;
                }
                Err(error) => {
                    tracing::warn!(steps = step, %error, "agent run aborted");
                    return RunOutcome::failed(step, error);
                }
            }
        }
    }

    fn seed(&self, task: &Task) -> Vec<Message> {
        let system_prompt = self
            .settings
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());
        tracing::debug!(state = %AgentState::Init, "seeding conversation");
        vec![
            Message::system(system_prompt),
            Message::user(format!(
                "[Project root path]:\n{}\n\n[Task]:\n{}",
                task.workspace.display(),
                task.instruction
            )),
        ]
    }

    async fn run_step(
        &self,
        conversation: &mut Vec<Message>,
        tools: &[FunctionDecl],
        step: &mut usize,
        cancellation: &CancellationToken,
    ) -> Result<StepFlow, RuntimeError> {
        if cancellation.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if *step >= self.settings.max_steps {
            tracing::info!(steps = *step, "step budget exhausted");
            return Ok(StepFlow::Finished(RunOutcome {
                state: AgentState::MaxSteps,
                steps: *step,
                final_message: None,
                error: None,
            }));
        }
        *step += 1;
        let number = *step;

        tracing::debug!(step = number, state = %AgentState::Running, "requesting decision");
        tracing::info!(step = number, max_steps = self.settings.max_steps, "calling provider");
        let context = Context {
            model: self.model.clone(),
            messages: conversation.clone(),
            tools: tools.to_vec(),
        };
        let decided = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(RuntimeError::Cancelled),
            decided = self.provider.decide(&context) => decided,
        };
        let mut decision = match decided {
            Ok(decision) => decision,
            Err(error) => {
                let mut record = step_record(number, AgentState::Error, None);
                record.error = Some(error.to_string());
                self.record(&record).await;
                return Err(error.into());
            }
        };

        decision.tool_calls = normalize_call_ids(number, std::mem::take(&mut decision.tool_calls));
        let calls = decision.tool_calls.clone();
        conversation.push(Message::assistant(decision.content.clone(), calls.clone()));

        if calls.is_empty() {
            return Ok(self.idle_step(conversation, number, decision).await);
        }

        let terminal = calls.iter().any(|call| call.name == TASK_DONE_TOOL_NAME);
        tracing::debug!(
            step = number,
            state = %AgentState::ToolExec,
            calls = calls.len(),
            terminal,
            "executing tool calls"
        );
        let report = self.dispatcher.dispatch_all(&calls, cancellation).await;
        for result in &report.results {
            conversation.push(Message::tool_result(result));
        }

        let mut record = step_record(number, AgentState::ToolExec, Some(decision.clone()));
        record.tool_calls = calls.clone();
        record.tool_results = report.results.clone();

        if let Some(fault) = report.fault {
            record.state = AgentState::Error;
            record.error = Some(fault.to_string());
            self.record(&record).await;
            return Err(fault.into());
        }
        if report.cancelled {
            record.state = AgentState::Error;
            record.error = Some(RuntimeError::Cancelled.to_string());
            self.record(&record).await;
            return Err(RuntimeError::Cancelled);
        }

        record.reflection = reflect(&calls, &report.results);
        if let Some(reflection) = &record.reflection {
            conversation.push(Message::user(reflection.clone()));
        }

        if terminal {
            record.state = AgentState::Done;
            self.record(&record).await;
            return Ok(StepFlow::Finished(RunOutcome {
                state: AgentState::Done,
                steps: number,
                final_message: decision.content,
                error: None,
            }));
        }

        self.record(&record).await;
        Ok(StepFlow::Continue)
    }

    async fn idle_step(
        &self,
        conversation: &mut Vec<Message>,
        number: usize,
        decision: Decision,
    ) -> StepFlow {
        if self.settings.allow_idle_completion {
            let final_message = decision.content.clone();
            self.record(&step_record(number, AgentState::Done, Some(decision)))
                .await;
            return StepFlow::Finished(RunOutcome {
                state: AgentState::Done,
                steps: number,
                final_message,
                error: None,
            });
        }

        tracing::debug!(step = number, "decision without tool calls; nudging model");
        conversation.push(Message::user(IDLE_NUDGE));
        self.record(&step_record(number, AgentState::Running, Some(decision)))
            .await;
        StepFlow::Continue
    }

    async fn record(&self, step: &AgentStep) {
        if let Err(error) = self.sink.record(step).await {
            tracing::warn!(step = step.step_number, %error, "failed to record trajectory step");
        }
    }
}

fn step_record(number: usize, state: AgentState, decision: Option<Decision>) -> AgentStep {
    AgentStep {
        step_number: number,
        state,
        decision,
        tool_calls: Vec::new(),
        tool_results: Vec::new(),
        reflection: None,
        error: None,
        recorded_at: Utc::now(),
    }
}

/// Gives every call an id unique within its step. Missing or repeated ids
/// are replaced with `call_<step>_<index>`.
fn normalize_call_ids(step: usize, calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::with_capacity(calls.len());
    calls
        .into_iter()
        .enumerate()
        .map(|(index, mut call)| {
            if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
                call.id = format!("call_{step}_{index}");
                seen.insert(call.id.clone());
            }
            call
        })
        .collect()
}

fn reflect(calls: &[ToolCall], results: &[ToolResult]) -> Option<String> {
    let failures = calls
        .iter()
        .zip(results)
        .filter(|(_, result)| !result.success)
        .map(|(call, result)| {
            format!(
                "- `{}` ({}) failed: {}",
                call.name,
                call.id,
                result.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>();
    if failures.is_empty() {
        return None;
    }
    Some(format!(
        "Some tool calls in the last step failed:\n{}\nCheck the arguments or try a different approach.",
        failures.join("\n")
    ))
}
