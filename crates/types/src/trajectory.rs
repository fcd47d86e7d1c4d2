use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Decision, ToolCall, ToolResult, TrajectoryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Init,
    Running,
    ToolExec,
    Done,
    MaxSteps,
    Error,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::MaxSteps | Self::Error)
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::ToolExec => "TOOL_EXEC",
            Self::Done => "DONE",
            Self::MaxSteps => "MAX_STEPS",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Record of one completed loop iteration. Never mutated after it is
/// handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub step_number: usize,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// How a run ended, as returned to the caller and written as the last
/// trajectory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub state: AgentState,
    pub steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn failed(steps: usize, error: impl fmt::Display) -> Self {
        Self {
            state: AgentState::Error,
            steps,
            final_message: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == AgentState::Done
    }
}

/// Append-only destination for step records.
#[async_trait]
pub trait TrajectorySink: Send + Sync {
    async fn record(&self, step: &AgentStep) -> Result<(), TrajectoryError>;

    async fn finalize(&self, outcome: &RunOutcome) -> Result<(), TrajectoryError>;
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrajectory;

#[async_trait]
impl TrajectorySink for NullTrajectory {
    async fn record(&self, _step: &AgentStep) -> Result<(), TrajectoryError> {
        Ok(())
    }

    async fn finalize(&self, _outcome: &RunOutcome) -> Result<(), TrajectoryError> {
        Ok(())
    }
}
