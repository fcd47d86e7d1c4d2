use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::*;

/// Records numbered thoughts so the model can plan, revise and branch
/// before acting. State lives for the lifetime of the registry.
pub struct SequentialThinkingTool {
    schema: FunctionDecl,
    state: Mutex<ThinkingState>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Thought {
    thought: String,
    thought_number: u32,
    total_thoughts: u32,
    next_thought_needed: bool,
    #[serde(default)]
    is_revision: bool,
    #[serde(default)]
    revises_thought: Option<u32>,
    #[serde(default)]
    branch_from_thought: Option<u32>,
    #[serde(default)]
    branch_id: Option<String>,
    #[serde(default)]
    needs_more_thoughts: bool,
}

#[derive(Debug, Default)]
struct ThinkingState {
    history: Vec<Thought>,
    branches: BTreeMap<String, Vec<Thought>>,
}

impl SequentialThinkingTool {
    pub fn new() -> Self {
        let integer = |description: &str| json!({"type": "integer", "minimum": 1, "description": description});
        let parameters = object_schema(
            vec![
                (
                    "thought",
                    json!({"type": "string", "description": "Your current thinking step."}),
                ),
                ("thought_number", integer("Current thought number.")),
                ("total_thoughts", integer("Estimated total thoughts needed.")),
                (
                    "next_thought_needed",
                    json!({"type": "boolean", "description": "Whether another thought step is needed."}),
                ),
                (
                    "is_revision",
                    json!({"type": "boolean", "description": "Whether this revises previous thinking."}),
                ),
                ("revises_thought", integer("Which thought is being reconsidered.")),
                ("branch_from_thought", integer("Branching point thought number.")),
                (
                    "branch_id",
                    json!({"type": "string", "description": "Branch identifier."}),
                ),
                (
                    "needs_more_thoughts",
                    json!({"type": "boolean", "description": "Whether more thoughts are needed than estimated."}),
                ),
            ],
            &[
                "thought",
                "thought_number",
                "total_thoughts",
                "next_thought_needed",
            ],
        );
        let description = "Think through a problem step by step. Each call records one thought; \
            thoughts can revise earlier ones or branch into alternatives, and the total can be \
            adjusted as understanding deepens. Use it to plan before acting."
            .to_owned();

        Self {
            schema: FunctionDecl::new(SEQUENTIAL_THINKING_TOOL_NAME, Some(description), parameters),
            state: Mutex::new(ThinkingState::default()),
        }
    }

    fn validate(thought: &Thought) -> Result<(), ToolError> {
        if thought.thought.trim().is_empty() {
            return Err(invalid_args(
                SEQUENTIAL_THINKING_TOOL_NAME,
                "`thought` must not be empty",
            ));
        }
        if thought.thought_number == 0 || thought.total_thoughts == 0 {
            return Err(invalid_args(
                SEQUENTIAL_THINKING_TOOL_NAME,
                "`thought_number` and `total_thoughts` must be at least 1",
            ));
        }
        if thought.revises_thought == Some(0) || thought.branch_from_thought == Some(0) {
            return Err(invalid_args(
                SEQUENTIAL_THINKING_TOOL_NAME,
                "thought references must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for SequentialThinkingTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SequentialThinkingTool {
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
        let mut thought: Thought = parse_args(SEQUENTIAL_THINKING_TOOL_NAME, arguments)?;
        Self::validate(&thought)?;
        thought.total_thoughts = thought.total_thoughts.max(thought.thought_number);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let (Some(_), Some(branch_id)) = (thought.branch_from_thought, thought.branch_id.clone()) {
            state
                .branches
                .entry(branch_id)
                .or_default()
                .push(thought.clone());
        }
        state.history.push(thought.clone());

        let status = json!({
            "thought_number": thought.thought_number,
            "total_thoughts": thought.total_thoughts,
            "next_thought_needed": thought.next_thought_needed,
            "branches": state.branches.keys().collect::<Vec<_>>(),
            "thought_history_length": state.history.len(),
        });
        let status = serde_json::to_string_pretty(&status)?;
        Ok(ToolExecResult::ok(format!(
            "Sequential thinking step completed.\n\nStatus:\n{status}"
        )))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}
