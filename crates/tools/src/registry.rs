use thiserror::Error;
use tracing::{debug, warn};
use types::ToolsConfig;

use super::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown tool `{name}`")]
    UnknownTool { name: String },
    #[error("tool `{name}` is registered twice")]
    DuplicateTool { name: String },
}

/// Construction-time knobs shared by the built-in tools.
#[derive(Debug, Clone, Copy)]
struct ToolSettings {
    command_timeout: Duration,
}

struct KnownTool {
    name: &'static str,
    build: fn(&ToolSettings) -> Arc<dyn Tool>,
}

const KNOWN_TOOLS: &[KnownTool] = &[
    KnownTool {
        name: BASH_TOOL_NAME,
        build: build_bash,
    },
    KnownTool {
        name: EDIT_TOOL_NAME,
        build: build_edit,
    },
    KnownTool {
        name: SEQUENTIAL_THINKING_TOOL_NAME,
        build: build_sequential_thinking,
    },
    KnownTool {
        name: TASK_DONE_TOOL_NAME,
        build: build_task_done,
    },
];

fn build_bash(settings: &ToolSettings) -> Arc<dyn Tool> {
    Arc::new(BashTool::new(settings.command_timeout))
}

fn build_edit(_: &ToolSettings) -> Arc<dyn Tool> {
    Arc::new(EditTool::new())
}

fn build_sequential_thinking(_: &ToolSettings) -> Arc<dyn Tool> {
    Arc::new(SequentialThinkingTool::new())
}

fn build_task_done(_: &ToolSettings) -> Arc<dyn Tool> {
    Arc::new(TaskDoneTool::new())
}

pub fn known_tool_names() -> impl Iterator<Item = &'static str> {
    KNOWN_TOOLS.iter().map(|known| known.name)
}

/// The tools available to one run. Built once, then only read.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    schemas: Vec<FunctionDecl>,
    max_output_bytes: usize,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn from_config(config: &ToolsConfig) -> Result<Self, RegistryError> {
        Ok(Self::builder()
            .max_output_bytes(config.max_output_bytes)
            .command_timeout(Duration::from_secs(config.command_timeout_secs))
            .enable_all(&config.enabled)?
            .build())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Specs advertised to the model, ordered by name.
    pub fn schemas(&self) -> &[FunctionDecl] {
        &self.schemas
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Runs `name` under its timeout and bounds the output it returns.
    /// Shell tools are timed by their session instead.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &Value,
        context: &ToolContext,
    ) -> Result<ToolExecResult, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| execution_failed(name, format!("unknown tool `{name}`")))?;

        let timeout = tool.timeout();
        debug!(tool = name, ?timeout, "executing tool");
        let mut result = match tool.footprint() {
            // Timed by the session once it holds the session lock.
            ToolFootprint::Shell => tool.execute(arguments, context).await?,
            _ => tokio::time::timeout(timeout, tool.execute(arguments, context))
                .await
                .map_err(|_| {
                    warn!(tool = name, ?timeout, "tool exceeded its deadline");
                    execution_failed(name, format!("tool timed out after {timeout:?}"))
                })??,
        };

        result.output = truncate_output(result.output, self.max_output_bytes);
        Ok(result)
    }
}

pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    settings: ToolSettings,
    max_output_bytes: usize,
    duplicate: Option<String>,
}

impl Default for ToolRegistryBuilder {
    fn default() -> Self {
        Self {
            tools: BTreeMap::new(),
            settings: ToolSettings {
                command_timeout: DEFAULT_COMMAND_TIMEOUT,
            },
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            duplicate: None,
        }
    }
}

impl ToolRegistryBuilder {
    pub fn max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Timeout for commands run by the built-in shell tool. Applies to
    /// built-ins enabled after this call.
    pub fn command_timeout(mut self, command_timeout: Duration) -> Self {
        self.settings.command_timeout = command_timeout;
        self
    }

    /// Enables a built-in tool by name.
    pub fn enable(self, name: &str) -> Result<Self, RegistryError> {
        let known = KNOWN_TOOLS
            .iter()
            .find(|known| known.name == name)
            .ok_or_else(|| RegistryError::UnknownTool {
                name: name.to_owned(),
            })?;
        let tool = (known.build)(&self.settings);
        Ok(self.insert(tool))
    }

    pub fn enable_all<I, S>(self, names: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(self, |builder, name| builder.enable(name.as_ref()))
    }

    /// Adds a caller-supplied tool under its schema name.
    pub fn with_tool<T>(self, tool: T) -> Self
    where
        T: Tool + 'static,
    {
        self.insert(Arc::new(tool))
    }

    fn insert(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_owned();
        if self.tools.insert(name.clone(), tool).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name);
        }
        self
    }

    /// Freezes the registry, refusing a name that was registered twice.
    pub fn try_build(self) -> Result<ToolRegistry, RegistryError> {
        if let Some(name) = self.duplicate {
            return Err(RegistryError::DuplicateTool { name });
        }
        Ok(self.build())
    }

    /// Freezes the registry. A name registered twice keeps its last tool.
    pub fn build(self) -> ToolRegistry {
        let schemas = self
            .tools
            .values()
            .map(|tool| tool.schema().clone())
            .collect();
        ToolRegistry {
            tools: self.tools,
            schemas,
            max_output_bytes: self.max_output_bytes,
        }
    }
}
