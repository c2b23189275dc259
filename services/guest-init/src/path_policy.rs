//! Path confinement for exec/upload/download requests.
//!
//! Every guest-facing path the agent touches on behalf of a caller is
//! resolved against a single workspace root and rejected if it would
//! escape that root. This is the only thing standing between a malicious
//! `path`/`cwd`/`dest` field and the rest of the guest filesystem, so it
//! has to be conservative: no `..` above the root, no symlink traversal
//! out of the root, trailing slashes and `.` ignored.

use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathPolicyError {
    #[error("path escapes workspace: {0}")]
    InvalidPath(String),

    #[error("base directory does not exist: {0}")]
    NotFound(String),
}

/// A path that has been confined to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Canonical absolute guest path, e.g. `/workspace/scripts/run.ts`.
    pub guest_path: PathBuf,
}

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.guest_path
    }
}

/// Confines guest-absolute paths to `/workspace`.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    workspace: PathBuf,
}

impl PathPolicy {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve `requested` against `/workspace`.
    ///
    /// Empty input defaults to the workspace root. The path is first
    /// normalized lexically (rejecting any `..` that would climb above
    /// the workspace); if the resulting path exists on disk, it is also
    /// canonicalized (resolving symlinks) and re-checked, so a symlink
    /// planted inside the workspace that points outside of it is caught
    /// too. A path whose parent does not exist is rejected with
    /// `NotFound` when `require_parent_exists` is set (upload/mkdir-style
    /// calls create the final component themselves).
    pub fn resolve(
        &self,
        requested: &str,
        require_parent_exists: bool,
    ) -> Result<ResolvedPath, PathPolicyError> {
        let trimmed = requested.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(ResolvedPath {
                guest_path: self.workspace.clone(),
            });
        }

        let lexical = self.lexical_join(trimmed)?;

        // Symlink check: canonicalize the deepest existing ancestor and make
        // sure it is still under the workspace once symlinks are resolved.
        let (existing_ancestor, remainder) = deepest_existing_ancestor(&lexical);
        let canonical_ancestor = fs::canonicalize(&existing_ancestor).map_err(|_| {
            PathPolicyError::NotFound(existing_ancestor.display().to_string())
        })?;

        if !is_within(&canonical_ancestor, &self.workspace) {
            return Err(PathPolicyError::InvalidPath(requested.to_string()));
        }

        if require_parent_exists && !remainder.is_empty() && canonical_ancestor != lexical {
            // The immediate parent of the final component must exist even
            // though the final component itself need not.
            if remainder.len() > 1 {
                return Err(PathPolicyError::NotFound(requested.to_string()));
            }
        }

        let resolved = canonical_ancestor.join(&remainder);
        if !is_within(&resolved, &self.workspace) && resolved != self.workspace {
            return Err(PathPolicyError::InvalidPath(requested.to_string()));
        }

        Ok(ResolvedPath {
            guest_path: resolved,
        })
    }

    /// Purely lexical resolution, for validating a destination that is not
    /// required to exist yet (e.g. an upload target directory).
    ///
    /// Guest-facing paths are always absolute and rooted at `/workspace`
    /// (the guest-visible confinement boundary); that leading `/workspace`
    /// segment names the boundary itself, not a path component to carry
    /// into the host-side join, so it is consumed here rather than pushed
    /// into `normalized`. Anything whose first component isn't literally
    /// `workspace` is rejected outright — it can never be a descendant of
    /// the workspace no matter how it's normalized.
    fn lexical_join(&self, requested: &str) -> Result<PathBuf, PathPolicyError> {
        let candidate = Path::new(requested);
        let mut components = candidate.components();

        match components.next() {
            Some(Component::RootDir) => {}
            _ => return Err(PathPolicyError::InvalidPath(requested.to_string())),
        }
        match components.next() {
            Some(Component::Normal(part)) if part == "workspace" => {}
            _ => return Err(PathPolicyError::InvalidPath(requested.to_string())),
        }

        let mut depth: i32 = 0;
        let mut normalized = PathBuf::new();
        for component in components {
            match component {
                Component::Normal(part) => {
                    depth += 1;
                    normalized.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(PathPolicyError::InvalidPath(requested.to_string()));
                    }
                    normalized.pop();
                }
                Component::RootDir | Component::Prefix(_) => {}
            }
        }

        if normalized.as_os_str().is_empty() {
            return Ok(self.workspace.clone());
        }

        Ok(self.workspace.join(normalized))
    }
}

/// Walk up `path` until an existing ancestor is found, returning it along
/// with the path components below it that do not yet exist.
fn deepest_existing_ancestor(path: &Path) -> (PathBuf, PathBuf) {
    let mut remainder = PathBuf::new();
    let mut cursor = path.to_path_buf();

    loop {
        if cursor.exists() {
            return (cursor, remainder);
        }
        let Some(name) = cursor.file_name().map(PathBuf::from) else {
            return (cursor, remainder);
        };
        let mut joined = name;
        joined.push(&remainder);
        remainder = joined;
        if !cursor.pop() {
            return (cursor, remainder);
        }
    }
}

fn is_within(candidate: &Path, root: &Path) -> bool {
    candidate == root || candidate.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn policy(workspace: &Path) -> PathPolicy {
        PathPolicy::new(workspace)
    }

    #[test]
    fn empty_input_defaults_to_workspace_root() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("workspace");
        fs::create_dir_all(&ws).unwrap();
        let resolved = policy(&ws).resolve("", false).unwrap();
        assert_eq!(resolved.guest_path, ws);
    }

    #[test]
    fn resolves_simple_relative_path() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("workspace");
        fs::create_dir_all(ws.join("scripts")).unwrap();
        fs::write(ws.join("scripts/run.ts"), b"").unwrap();
        let resolved = policy(&ws).resolve("/workspace/scripts/run.ts", false).unwrap();
        assert_eq!(resolved.guest_path, ws.join("scripts/run.ts"));
    }

    #[test]
    fn rejects_parent_traversal_above_root() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("workspace");
        fs::create_dir_all(&ws).unwrap();
        let err = policy(&ws).resolve("/workspace/../etc/passwd", false).unwrap_err();
        assert!(matches!(err, PathPolicyError::InvalidPath(_)));
    }

    #[test]
    fn rejects_symlink_escaping_workspace() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("workspace");
        fs::create_dir_all(&ws).unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        symlink(&outside, ws.join("escape")).unwrap();
        let err = policy(&ws).resolve("/workspace/escape/foo", false).unwrap_err();
        assert!(matches!(err, PathPolicyError::InvalidPath(_)));
    }

    #[test]
    fn allows_nonexistent_path_under_existing_directory() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("workspace");
        fs::create_dir_all(&ws).unwrap();
        let resolved = policy(&ws)
            .resolve("/workspace/new-file.txt", false)
            .unwrap();
        assert_eq!(resolved.guest_path, ws.join("new-file.txt"));
    }

    #[test]
    fn trailing_slash_is_irrelevant() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("workspace");
        fs::create_dir_all(ws.join("dir")).unwrap();
        let a = policy(&ws).resolve("/workspace/dir/", false).unwrap();
        let b = policy(&ws).resolve("/workspace/dir", false).unwrap();
        assert_eq!(a, b);
    }
}
