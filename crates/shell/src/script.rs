//! Wraps each command so the shell state it leaves behind can be captured
//! and replayed into the next process.

const VOLATILE_VARIABLES: &[&str] = &[
    "PWD",
    "OLDPWD",
    "SHLVL",
    "_",
    "BASHOPTS",
    "SHELLOPTS",
    "BASH_VERSINFO",
    "EUID",
    "PPID",
    "UID",
    "GROUPS",
];

const EXPORT_PREFIXES: &[&str] = &["declare -x ", "export "];

/// Shell state carried from one command to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ShellState {
    pub cwd: Option<String>,
    /// Re-executable `export -p` lines.
    pub exports: Vec<String>,
}

impl ShellState {
    pub fn starting_at(cwd: Option<String>) -> Self {
        Self {
            cwd,
            exports: Vec::new(),
        }
    }
}

/// What the wrapper printed after the command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Trailer {
    pub exit_code: i32,
    pub state: ShellState,
}

pub(crate) fn build_script(state: &ShellState, marker: &str, command: &str) -> String {
    let mut script = String::with_capacity(command.len() + 256);

    if !state.exports.is_empty() || state.cwd.is_some() {
        script.push_str("{\n");
        for entry in &state.exports {
            script.push_str(entry);
            script.push('\n');
        }
        if let Some(cwd) = &state.cwd {
            script.push_str("cd ");
            script.push_str(&shell_quote(cwd));
            script.push('\n');
        }
        script.push_str("} 2>/dev/null\n");
    }

    script.push_str("{\n");
    script.push_str(command);
    script.push_str("\n}\n");
    script.push_str("__sf_ec=$?\n");
    script.push_str(&format!("printf '\\n%s\\n' {}\n", shell_quote(marker)));
    script.push_str("printf '%s\\n' \"$__sf_ec\"\n");
    script.push_str("pwd\n");
    script.push_str("export -p\n");
    script.push_str("exit \"$__sf_ec\"\n");
    script
}

/// Splits captured stdout into the command's own output and the trailer.
/// A missing or malformed trailer (the command exited the shell early)
/// yields `None` and the whole stdout.
pub(crate) fn split_output(stdout: &str, marker: &str) -> (String, Option<Trailer>) {
    let separator = format!("\n{marker}\n");
    let Some(index) = stdout.rfind(&separator) else {
        return (stdout.to_owned(), None);
    };

    let (body, rest) = stdout.split_at(index);
    let mut lines = rest[separator.len()..].lines();
    let exit_code = lines.next().and_then(|line| line.trim().parse::<i32>().ok());
    let cwd = lines
        .next()
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .map(ToOwned::to_owned);

    match (exit_code, cwd) {
        (Some(exit_code), Some(cwd)) => (
            body.to_owned(),
            Some(Trailer {
                exit_code,
                state: ShellState {
                    cwd: Some(cwd),
                    exports: parse_exports(lines),
                },
            }),
        ),
        _ => (stdout.to_owned(), None),
    }
}

fn parse_exports<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();
    for line in lines {
        if EXPORT_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            entries.push(line.to_owned());
        } else if let Some(last) = entries.last_mut() {
            // Multi-line values continue the previous entry.
            last.push('\n');
            last.push_str(line);
        }
    }
    entries.retain(|entry| {
        export_name(entry).is_some_and(|name| !VOLATILE_VARIABLES.contains(&name))
    });
    entries
}

fn export_name(entry: &str) -> Option<&str> {
    let rest = EXPORT_PREFIXES
        .iter()
        .find_map(|prefix| entry.strip_prefix(prefix))?;
    let name = rest.split(['=', '\n']).next()?.trim();
    (!name.is_empty()).then_some(name)
}

pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
