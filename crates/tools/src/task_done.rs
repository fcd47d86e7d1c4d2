use super::*;

/// Signals that the task is complete. The agent loop stops on it.
pub struct TaskDoneTool {
    schema: FunctionDecl,
}

impl TaskDoneTool {
    pub fn new() -> Self {
        let description = "Report that the task is complete. Call this only after the work \
            has been verified; the run ends once it is called."
            .to_owned();
        Self {
            schema: FunctionDecl::new(
                TASK_DONE_TOOL_NAME,
                Some(description),
                object_schema(Vec::new(), &[]),
            ),
        }
    }
}

impl Default for TaskDoneTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TaskDoneTool {
    fn schema(&self) -> &FunctionDecl {
        &self.schema
    }

    fn footprint(&self) -> ToolFootprint {
        ToolFootprint::Pure
    }

    async fn execute(
        &self,
        _arguments: &Value,
        _context: &ToolContext,
    ) -> Result<ToolExecResult, ToolError> {
        Ok(ToolExecResult::ok("Task done."))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}
