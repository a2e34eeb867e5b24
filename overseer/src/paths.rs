//! Project path derivation.
//!
//! Every component shares the same notion of project root and workspace
//! directory, so path math lives in one place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Canonical locations inside the managed project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    /// Root of the project the orchestrator operates on.
    pub repo_root: PathBuf,
    /// `<repo_root>/workspace` — the only directory generated files land in.
    pub workspace_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let workspace_dir = repo_root.join("workspace");
        Self {
            repo_root,
            workspace_dir,
        }
    }

    /// Ensure the workspace directory exists and return it.
    pub fn ensure_workspace(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.workspace_dir)
            .with_context(|| format!("create workspace {}", self.workspace_dir.display()))?;
        Ok(&self.workspace_dir)
    }

    /// Convert a repo-relative path like `workspace/IMPROVEMENTS.md` into an
    /// absolute path. Absolute inputs are returned unchanged.
    pub fn abs_repo_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        let rel = rel.as_ref();
        if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.repo_root.join(rel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_under_root() {
        let paths = ProjectPaths::new("/tmp/project");
        assert_eq!(paths.workspace_dir, PathBuf::from("/tmp/project/workspace"));
    }

    #[test]
    fn abs_repo_path_keeps_absolute_inputs() {
        let paths = ProjectPaths::new("/tmp/project");
        assert_eq!(
            paths.abs_repo_path("/etc/hosts"),
            PathBuf::from("/etc/hosts")
        );
        assert_eq!(
            paths.abs_repo_path("workspace/a.md"),
            PathBuf::from("/tmp/project/workspace/a.md")
        );
    }
}
