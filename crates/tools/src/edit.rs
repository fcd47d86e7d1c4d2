use std::{fs, path::Path};

use serde::Deserialize;
use walkdir::WalkDir;

use super::*;

const SNIPPET_LINES: usize = 4;
const LISTING_DEPTH: usize = 2;

/// Views, creates and edits files by absolute path.
pub struct EditTool {
    schema: FunctionDecl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EditCommand {
    View,
    Create,
    StrReplace,
    Insert,
}

impl EditCommand {
    fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Create => "create",
            Self::StrReplace => "str_replace",
            Self::Insert => "insert",
        }
    }
}

#[derive(Debug, Deserialize)]
struct EditArgs {
    command: EditCommand,
    path: String,
    #[serde(default)]
    file_text: Option<String>,
    #[serde(default)]
    old_str: Option<String>,
    #[serde(default)]
    new_str: Option<String>,
    #[serde(default)]
    insert_line: Option<i64>,
    #[serde(default)]
    view_range: Option<Vec<i64>>,
}

impl EditTool {
    pub fn new() -> Self {
        let parameters = object_schema(
            vec![
                (
                    "command",
                    json!({
                        "type": "string",
                        "enum": ["view", "create", "str_replace", "insert"],
                        "description": "The operation to run."
                    }),
                ),
                (
                    "path",
                    json!({
                        "type": "string",
                        "description": "Absolute path to the file or directory, e.g. `/repo/file.py` or `/repo`."
                    }),
                ),
                (
                    "file_text",
                    json!({
                        "type": "string",
                        "description": "Required for `create`: content of the new file."
                    }),
                ),
                (
                    "old_str",
                    json!({
                        "type": "string",
                        "description": "Required for `str_replace`: the exact text to replace. It must match exactly once."
                    }),
                ),
                (
                    "new_str",
                    json!({
                        "type": "string",
                        "description": "Replacement text for `str_replace` (defaults to empty), or the text to add for `insert`."
                    }),
                ),
                (
                    "insert_line",
                    json!({
                        "type": "integer",
                        "description": "Required for `insert`: `new_str` is inserted after this line. 0 inserts at the top."
                    }),
                ),
                (
                    "view_range",
                    json!({
                        "type": "array",
                        "items": {"type": "integer"},
                        "description": "Optional for `view` on a file: [start, end] 1-based line numbers; end -1 reads to the end."
                    }),
                ),
            ],
            &["command", "path"],
        );
        let description = "Custom editing tool for viewing, creating and editing files.\n\
            * `view` on a file prints it with line numbers, like `cat -n`; on a directory it lists non-hidden entries up to 2 levels deep.\n\
            * `create` fails if the path already exists.\n\
            * `str_replace` requires `old_str` to match exactly one location, whitespace included.\n\
            * `insert` adds `new_str` after line `insert_line`."
            .to_owned();

        Self {
            schema: FunctionDecl::new(EDIT_TOOL_NAME, Some(description), parameters),
        }
    }
}

impl Default for EditTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EditTool {
    fn schema(&self) -> &FunctionDecl {
        &self.schema
    }

    fn footprint(&self) -> ToolFootprint {
        ToolFootprint::Filesystem {
            path_fields: &["path"],
        }
    }

    async fn execute(
        &self,
        arguments: &Value,
        _context: &ToolContext,
    ) -> Result<ToolExecResult, ToolError> {
        let request: EditArgs = parse_args(EDIT_TOOL_NAME, arguments)?;
        let path = Path::new(&request.path);
        validate_path(request.command, path)?;

        let output = match request.command {
            EditCommand::View => view(path, request.view_range.as_deref())?,
            EditCommand::Create => {
                let file_text = request
                    .file_text
                    .ok_or_else(|| invalid_args(EDIT_TOOL_NAME, "`file_text` is required for `create`"))?;
                create(path, &file_text)?
            }
            EditCommand::StrReplace => {
                let old_str = request.old_str.ok_or_else(|| {
                    invalid_args(EDIT_TOOL_NAME, "`old_str` is required for `str_replace`")
                })?;
                str_replace(path, &old_str, request.new_str.as_deref().unwrap_or(""))?
            }
            EditCommand::Insert => {
                let insert_line = request.insert_line.ok_or_else(|| {
                    invalid_args(EDIT_TOOL_NAME, "`insert_line` is required for `insert`")
                })?;
                let new_str = request.new_str.ok_or_else(|| {
                    invalid_args(EDIT_TOOL_NAME, "`new_str` is required for `insert`")
                })?;
                insert(path, insert_line, &new_str)?
            }
        };
        Ok(ToolExecResult::ok(output))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

fn validate_path(command: EditCommand, path: &Path) -> Result<(), ToolError> {
    let shown = path.display();
    if !path.is_absolute() {
        return Err(invalid_args(
            EDIT_TOOL_NAME,
            format!("the path `{shown}` is not an absolute path, it should start with `/`"),
        ));
    }
    if command == EditCommand::Create {
        if path.exists() {
            return Err(invalid_args(
                EDIT_TOOL_NAME,
                format!("file already exists at `{shown}`; `create` cannot overwrite files"),
            ));
        }
        return Ok(());
    }
    if !path.exists() {
        return Err(invalid_args(
            EDIT_TOOL_NAME,
            format!("the path `{shown}` does not exist"),
        ));
    }
    if path.is_dir() && command != EditCommand::View {
        return Err(invalid_args(
            EDIT_TOOL_NAME,
            format!(
                "the path `{shown}` is a directory; `{}` only works on files",
                command.as_str()
            ),
        ));
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<String, ToolError> {
    fs::read_to_string(path).map_err(|error| {
        execution_failed(
            EDIT_TOOL_NAME,
            format!("failed to read `{}`: {error}", path.display()),
        )
    })
}

fn write_file(path: &Path, content: &str) -> Result<(), ToolError> {
    fs::write(path, content).map_err(|error| {
        execution_failed(
            EDIT_TOOL_NAME,
            format!("failed to write `{}`: {error}", path.display()),
        )
    })
}

/// Numbers `content` like `cat -n`, starting at `first_line`.
fn numbered(content: &str, first_line: usize) -> String {
    content
        .split('\n')
        .enumerate()
        .map(|(index, line)| format!("{:6}\t{line}", index + first_line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn view(path: &Path, view_range: Option<&[i64]>) -> Result<String, ToolError> {
    if path.is_dir() {
        if view_range.is_some() {
            return Err(invalid_args(
                EDIT_TOOL_NAME,
                "`view_range` is not allowed when `path` points to a directory",
            ));
        }
        return list_directory(path);
    }

    let content = read_file(path)?;
    let Some(range) = view_range else {
        return Ok(format!(
            "Here's the result of running `cat -n` on {}:\n{}\n",
            path.display(),
            numbered(&content, 1)
        ));
    };

    let lines: Vec<&str> = content.split('\n').collect();
    let (start, end) = resolve_view_range(range, lines.len())?;
    let selected = lines[start - 1..end].join("\n");
    Ok(format!(
        "Here's the result of running `cat -n` on {}:\n{}\n",
        path.display(),
        numbered(&selected, start)
    ))
}

/// Validates a 1-based inclusive `[start, end]` range; `end == -1` means the last line.
fn resolve_view_range(range: &[i64], line_count: usize) -> Result<(usize, usize), ToolError> {
    let [start, end] = range else {
        return Err(invalid_args(
            EDIT_TOOL_NAME,
            "`view_range` must be a list of two integers",
        ));
    };
    let line_count_i64 = i64::try_from(line_count).unwrap_or(i64::MAX);
    if *start < 1 || *start > line_count_i64 {
        return Err(invalid_args(
            EDIT_TOOL_NAME,
            format!(
                "invalid `view_range` {range:?}: first element {start} should be within [1, {line_count}]"
            ),
        ));
    }
    let end = if *end == -1 {
        line_count_i64
    } else {
        *end
    };
    if end < *start || end > line_count_i64 {
        return Err(invalid_args(
            EDIT_TOOL_NAME,
            format!(
                "invalid `view_range` {range:?}: second element should be -1 or within [{start}, {line_count}]"
            ),
        ));
    }
    // Both bounds were checked against `line_count`, which came from a usize.
    Ok((*start as usize, end as usize))
}

fn list_directory(path: &Path) -> Result<String, ToolError> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(path)
        .min_depth(1)
        .max_depth(LISTING_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });
    for entry in walker {
        let entry = entry.map_err(|error| {
            execution_failed(
                EDIT_TOOL_NAME,
                format!("failed to list `{}`: {error}", path.display()),
            )
        })?;
        entries.push(entry.path().display().to_string());
    }

    Ok(format!(
        "Here's the files and directories up to {LISTING_DEPTH} levels deep in {}, excluding hidden items:\n{}\n",
        path.display(),
        entries.join("\n")
    ))
}

fn create(path: &Path, file_text: &str) -> Result<String, ToolError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            execution_failed(
                EDIT_TOOL_NAME,
                format!("failed to create `{}`: {error}", parent.display()),
            )
        })?;
    }
    write_file(path, file_text)?;
    Ok(format!("File created successfully at: {}", path.display()))
}

fn str_replace(path: &Path, old_str: &str, new_str: &str) -> Result<String, ToolError> {
    if old_str.is_empty() {
        return Err(invalid_args(EDIT_TOOL_NAME, "`old_str` must not be empty"));
    }
    let content = read_file(path)?;
    let matches: Vec<usize> = content
        .match_indices(old_str)
        .map(|(offset, _)| offset)
        .collect();

    let offset = match matches.as_slice() {
        [] => {
            return Err(invalid_args(
                EDIT_TOOL_NAME,
                format!(
                    "no replacement was performed, `old_str` did not appear verbatim in {}",
                    path.display()
                ),
            ));
        }
        [offset] => *offset,
        many => {
            let lines: Vec<usize> = many
                .iter()
                .map(|offset| line_of(&content, *offset))
                .collect();
            return Err(invalid_args(
                EDIT_TOOL_NAME,
                format!(
                    "no replacement was performed, `old_str` matched {} locations (lines {lines:?}); include more context to make it unique",
                    many.len()
                ),
            ));
        }
    };

    let updated = content.replacen(old_str, new_str, 1);
    write_file(path, &updated)?;

    let replacement_line = line_of(&content, offset);
    let snippet = snippet_around(&updated, replacement_line, new_str.matches('\n').count());
    Ok(format!(
        "The file {path} has been edited. Here's the result of running `cat -n` on a snippet of {path}:\n{snippet}\nReview the changes and make sure they are as expected. Edit the file again if necessary.",
        path = path.display()
    ))
}

fn insert(path: &Path, insert_line: i64, new_str: &str) -> Result<String, ToolError> {
    let content = read_file(path)?;
    let mut lines: Vec<&str> = content.split('\n').collect();
    let line_count = lines.len();
    let position = usize::try_from(insert_line)
        .ok()
        .filter(|line| *line <= line_count)
        .ok_or_else(|| {
            invalid_args(
                EDIT_TOOL_NAME,
                format!(
                    "invalid `insert_line` {insert_line}: it should be within [0, {line_count}]"
                ),
            )
        })?;

    let inserted: Vec<&str> = new_str.split('\n').collect();
    let inserted_count = inserted.len();
    lines.splice(position..position, inserted);
    let updated = lines.join("\n");
    write_file(path, &updated)?;

    let snippet = snippet_around(&updated, position + 1, inserted_count.saturating_sub(1));
    Ok(format!(
        "The file {} has been edited. Here's the result of running `cat -n` on a snippet of the edited file:\n{snippet}\nReview the changes and make sure they are as expected (correct indentation, no duplicate lines). Edit the file again if necessary.",
        path.display()
    ))
}

/// 1-based line holding byte `offset`.
fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

/// Numbered lines around a change that starts at 1-based `line` and spans
/// `extra_lines` further lines.
fn snippet_around(content: &str, line: usize, extra_lines: usize) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let start = line.saturating_sub(SNIPPET_LINES).max(1);
    let end = (line + extra_lines + SNIPPET_LINES).min(lines.len());
    if start > end {
        return String::new();
    }
    numbered(&lines[start - 1..end].join("\n"), start)
}
