use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("workspace root `{path}` must be absolute")]
    RelativeRoot { path: PathBuf },
}

/// A host workspace root paired with where it is mounted in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMapping {
    host_root: PathBuf,
    container_root: PathBuf,
}

impl WorkspaceMapping {
    pub fn new(
        host_root: impl Into<PathBuf>,
        container_root: impl Into<PathBuf>,
    ) -> Result<Self, MappingError> {
        let host_root = host_root.into();
        let container_root = container_root.into();
        for root in [&host_root, &container_root] {
            if !root.is_absolute() {
                return Err(MappingError::RelativeRoot { path: root.clone() });
            }
        }
        Ok(Self {
            host_root: lexical_normalize(&host_root),
            container_root: lexical_normalize(&container_root),
        })
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn container_root(&self) -> &Path {
        &self.container_root
    }
}

/// Result of translating one path. An unmapped value is returned untouched
/// and must not be used by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    Mapped(PathBuf),
    NotMapped(String),
}

impl Translation {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }

    pub fn into_mapped(self) -> Option<PathBuf> {
        match self {
            Self::Mapped(path) => Some(path),
            Self::NotMapped(_) => None,
        }
    }
}

/// Maps paths between the host workspace and its container mount.
///
/// Normalization is lexical: `.` and `..` are folded without touching the
/// filesystem, and relative inputs are anchored at the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTranslator {
    mapping: WorkspaceMapping,
}

impl PathTranslator {
    pub fn new(mapping: WorkspaceMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &WorkspaceMapping {
        &self.mapping
    }

    pub fn to_container(&self, host_path: &str) -> Translation {
        translate(
            host_path,
            &self.mapping.host_root,
            &self.mapping.container_root,
        )
    }

    pub fn to_host(&self, container_path: &str) -> Translation {
        translate(
            container_path,
            &self.mapping.container_root,
            &self.mapping.host_root,
        )
    }

    /// Replaces host-root occurrences in free text (such as a shell command)
    /// with the container root.
    pub fn rewrite_to_container(&self, text: &str) -> String {
        replace_root(text, &self.mapping.host_root, &self.mapping.container_root)
    }

    /// Replaces container-root occurrences in free text with the host root.
    pub fn rewrite_to_host(&self, text: &str) -> String {
        replace_root(text, &self.mapping.container_root, &self.mapping.host_root)
    }
}

/// Resolves `.`/`..` lexically and anchors relative paths at `base`.
/// `..` never climbs above the filesystem root.
pub fn normalize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        lexical_normalize(path)
    } else {
        lexical_normalize(&base.join(path))
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

fn translate(value: &str, from_root: &Path, to_root: &Path) -> Translation {
    let normalized = normalize(Path::new(value), from_root);
    match normalized.strip_prefix(from_root) {
        Ok(relative) if relative.as_os_str().is_empty() => Translation::Mapped(to_root.to_path_buf()),
        Ok(relative) => Translation::Mapped(to_root.join(relative)),
        Err(_) => Translation::NotMapped(value.to_owned()),
    }
}

fn replace_root(text: &str, from_root: &Path, to_root: &Path) -> String {
    let from = from_root.to_string_lossy();
    let to = to_root.to_string_lossy();
    if from == "/" || from == to {
        return text.to_owned();
    }

    let mut rewritten = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(index) = rest.find(from.as_ref()) {
        let after = &rest[index + from.len()..];
        rewritten.push_str(&rest[..index]);
        if ends_path_component(after) {
            rewritten.push_str(&to);
        } else {
            rewritten.push_str(&from);
        }
        rest = after;
    }
    rewritten.push_str(rest);
    rewritten
}

fn ends_path_component(after: &str) -> bool {
    after
        .chars()
        .next()
        .is_none_or(|next| !(next.is_alphanumeric() || matches!(next, '_' | '-' | '.')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        PathTranslator::new(
            WorkspaceMapping::new("/home/dev/project", "/workspace").expect("valid mapping"),
        )
    }

    #[test]
    fn host_paths_inside_workspace_round_trip() {
        let translator = translator();
        for host in [
            "/home/dev/project",
            "/home/dev/project/src/main.rs",
            "/home/dev/project/./src/../README.md",
            "src/lib.rs",
        ] {
            let container = translator
                .to_container(host)
                .into_mapped()
                .expect("inside the workspace");
            let back = translator
                .to_host(&container.to_string_lossy())
                .into_mapped()
                .expect("container path maps back");
            assert_eq!(
                back,
                normalize(Path::new(host), Path::new("/home/dev/project")),
                "round trip of {host}"
            );
        }
    }

    #[test]
    fn relative_paths_anchor_at_source_root() {
        assert_eq!(
            translator().to_container("notes.txt"),
            Translation::Mapped(PathBuf::from("/workspace/notes.txt"))
        );
        assert_eq!(
            translator().to_host("src"),
            Translation::Mapped(PathBuf::from("/home/dev/project/src"))
        );
    }

    #[test]
    fn paths_escaping_the_workspace_are_rejected() {
        let translator = translator();
        for host in [
            "/etc/passwd",
            "/home/dev/project/../other",
            "../outside",
            "/home/dev/projectile/file",
        ] {
            assert_eq!(
                translator.to_container(host),
                Translation::NotMapped(host.to_owned()),
                "{host} must not be mapped"
            );
        }
        assert!(!translator.to_host("/etc/hosts").is_mapped());
    }

    #[test]
    fn parent_components_clamp_at_filesystem_root() {
        assert_eq!(
            normalize(Path::new("/../../tmp/./x"), Path::new("/")),
            PathBuf::from("/tmp/x")
        );
    }

    #[test]
    fn relative_roots_are_rejected() {
        assert_eq!(
            WorkspaceMapping::new("project", "/workspace"),
            Err(MappingError::RelativeRoot {
                path: PathBuf::from("project")
            })
        );
    }

    #[test]
    fn free_text_rewrites_only_whole_root_components() {
        let translator = translator();
        assert_eq!(
            translator.rewrite_to_container("ls /home/dev/project/src && cat /home/dev/projectile"),
            "ls /workspace/src && cat /home/dev/projectile"
        );
        assert_eq!(
            translator.rewrite_to_host("error in /workspace/main.py: line 3"),
            "error in /home/dev/project/main.py: line 3"
        );
    }
}
