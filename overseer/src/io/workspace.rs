//! Workspace patch applier.
//!
//! Generated files land strictly under `<project>/workspace/`. The whole
//! batch is validated before any byte is written: one traversal attempt
//! poisons the call and nothing touches disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::state::{ApplyMode, CodePatch};
use crate::error::ConfigurationError;

/// Writes patches under a confined workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply patches and return the absolute paths written, in input order.
    ///
    /// Duplicate `file_path` entries are deduplicated, last write wins (the
    /// position of the first occurrence is kept). `Append` only appends
    /// when the target exists, otherwise it behaves as `Overwrite`.
    #[instrument(skip_all, fields(patches = patches.len()))]
    pub fn apply(&self, patches: &[CodePatch]) -> Result<Vec<PathBuf>> {
        // Validate every path before writing anything.
        let mut deduped: Vec<(PathBuf, &CodePatch)> = Vec::new();
        let mut index_by_target: HashMap<PathBuf, usize> = HashMap::new();
        for patch in patches {
            let target = self.safe_target(&patch.file_path)?;
            match index_by_target.get(&target) {
                Some(&idx) => deduped[idx] = (target, patch),
                None => {
                    index_by_target.insert(target.clone(), deduped.len());
                    deduped.push((target, patch));
                }
            }
        }

        let mut written = Vec::with_capacity(deduped.len());
        for (target, patch) in deduped {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }

            match patch.apply_mode {
                ApplyMode::Append if target.exists() => {
                    use std::io::Write;
                    let mut file = fs::OpenOptions::new()
                        .append(true)
                        .open(&target)
                        .with_context(|| format!("open for append {}", target.display()))?;
                    file.write_all(patch.content.as_bytes())
                        .with_context(|| format!("append {}", target.display()))?;
                }
                _ => {
                    fs::write(&target, &patch.content)
                        .with_context(|| format!("write {}", target.display()))?;
                }
            }
            debug!(path = %target.display(), mode = ?patch.apply_mode, "wrote patch");
            written.push(target);
        }

        Ok(written)
    }

    /// Resolve a patch path safely within the workspace root.
    ///
    /// A leading `workspace/` prefix is stripped for convenience; absolute
    /// paths and `..` components are rejected.
    fn safe_target(&self, file_path: &str) -> Result<PathBuf, ConfigurationError> {
        let trimmed = file_path.trim();
        if trimmed.is_empty() {
            return Err(ConfigurationError("empty patch file_path".to_string()));
        }
        if Path::new(trimmed).is_absolute() {
            warn!(path = trimmed, "absolute patch path rejected");
            return Err(ConfigurationError(format!(
                "absolute paths are not allowed: {trimmed}"
            )));
        }

        let mut rel = trimmed;
        if let Some(stripped) = rel.strip_prefix("workspace/") {
            rel = stripped;
        }
        while let Some(stripped) = rel.strip_prefix("./") {
            rel = stripped;
        }

        let rel_path = Path::new(rel);
        let traversal = rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir));
        if traversal || rel.is_empty() {
            warn!(path = trimmed, "traversal patch path rejected");
            return Err(ConfigurationError(format!(
                "directory traversal is not allowed: {trimmed}"
            )));
        }

        Ok(self.root.join(rel_path))
    }
}
