use std::sync::Arc;

use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;
use tools::ToolExecutor;
use tracing::{debug, warn};
use types::{SandboxError, ToolCall, ToolResult};

const CANCELLED_MESSAGE: &str = "tool call cancelled before completion";

/// Results of one batch, in call order.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub results: Vec<ToolResult>,
    /// First fault that left the execution environment unusable.
    pub fault: Option<SandboxError>,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|result| !result.success).count()
    }
}

/// Fans a batch of tool calls out to one executor and collects the
/// results back in call order.
///
/// Each call runs on its own task, so a panic or error in one call never
/// touches its siblings.
#[derive(Clone)]
pub struct ParallelDispatcher {
    executor: Arc<dyn ToolExecutor>,
}

impl ParallelDispatcher {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn ToolExecutor> {
        &self.executor
    }

    pub async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        cancellation: &CancellationToken,
    ) -> DispatchReport {
        if calls.is_empty() {
            return DispatchReport::default();
        }
        if cancellation.is_cancelled() {
            return cancelled_report(calls);
        }

        debug!(calls = calls.len(), "dispatching tool calls");
        let handles = calls
            .iter()
            .cloned()
            .map(|call| {
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move { executor.execute_call(&call).await })
            })
            .collect::<Vec<_>>();
        let aborts = handles
            .iter()
            .map(|handle| handle.abort_handle())
            .collect::<Vec<AbortHandle>>();

        let joined = tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            joined = futures::future::join_all(handles) => Some(joined),
        };

        let Some(joined) = joined else {
            warn!(calls = calls.len(), "run cancelled; aborting in-flight tool calls");
            for abort in &aborts {
                abort.abort();
            }
            return cancelled_report(calls);
        };

        let mut report = DispatchReport {
            results: Vec::with_capacity(calls.len()),
            fault: None,
            cancelled: false,
        };
        for (call, outcome) in calls.iter().zip(joined) {
            let result = match outcome {
                Ok(Ok(mut result)) => {
                    result.id.clone_from(&call.id);
                    result
                }
                Ok(Err(fault)) => {
                    warn!(tool = %call.name, call_id = %call.id, %fault, "sandbox fault during tool call");
                    let result =
                        ToolResult::failure(call.id.clone(), String::new(), fault.to_string());
                    report.fault.get_or_insert(fault);
                    result
                }
                Err(join_error) => join_failure(call, &join_error),
            };
            report.results.push(result);
        }
        report
    }
}

fn join_failure(call: &ToolCall, join_error: &JoinError) -> ToolResult {
    let message = if join_error.is_panic() {
        format!("tool `{}` panicked during execution", call.name)
    } else {
        CANCELLED_MESSAGE.to_owned()
    };
    warn!(tool = %call.name, call_id = %call.id, %message, "tool task did not complete");
    ToolResult::failure(call.id.clone(), String::new(), message)
}

fn cancelled_report(calls: &[ToolCall]) -> DispatchReport {
    DispatchReport {
        results: calls
            .iter()
            .map(|call| ToolResult::failure(call.id.clone(), String::new(), CANCELLED_MESSAGE))
            .collect(),
        fault: None,
        cancelled: true,
    }
}
