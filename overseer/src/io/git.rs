//! Git adapter.
//!
//! The verifier and turn runner depend on a handful of git operations, so
//! we keep a small, explicit wrapper around `git` subprocess calls. A
//! missing `git` binary degrades (returncode 127, empty listings) instead
//! of crashing: verification then fails with a reason, which is the
//! correct outcome when version control is unavailable.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(120);
const GIT_OUTPUT_LIMIT: usize = 1_000_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Raw result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(&self) -> bool {
        self.returncode == 0
    }

    /// stderr if non-empty, else stdout — whichever carries the detail.
    pub fn detail(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run git with `args` in this adapter's workdir.
    ///
    /// A missing binary yields returncode 127 rather than an error.
    pub fn run(&self, args: &[&str]) -> GitOutput {
        self.run_in(&self.workdir, args)
    }

    /// Run git with `args` in an explicit directory (e.g. a worktree).
    pub fn run_in(&self, dir: &Path, args: &[&str]) -> GitOutput {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(dir);
        match run_command_with_timeout(cmd, GIT_TIMEOUT, GIT_OUTPUT_LIMIT) {
            Ok(out) if out.timed_out => GitOutput {
                returncode: 124,
                stdout: out.stdout_lossy(),
                stderr: "git timed out".to_string(),
            },
            Ok(out) => GitOutput {
                returncode: out.status.code().unwrap_or(1),
                stdout: out.stdout_lossy(),
                stderr: out.stderr_lossy(),
            },
            Err(err) => {
                let not_found = err
                    .root_cause()
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
                if !not_found {
                    warn!(err = %err, "git invocation failed");
                }
                GitOutput {
                    returncode: if not_found { 127 } else { 1 },
                    stdout: String::new(),
                    stderr: if not_found {
                        "git not found".to_string()
                    } else {
                        format!("{err:#}")
                    },
                }
            }
        }
    }

    /// Tracked files, empty when git is unavailable or this is not a repo.
    #[instrument(skip_all)]
    pub fn ls_files(&self) -> Vec<String> {
        let out = self.run(&["ls-files"]);
        if !out.ok() {
            debug!(returncode = out.returncode, "ls-files unavailable");
            return Vec::new();
        }
        out.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Vec<StatusEntry> {
        let out = self.run(&["status", "--porcelain"]);
        if !out.ok() {
            return Vec::new();
        }
        out.stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(parse_status_line)
            .collect()
    }

    /// Changed paths (tracked or untracked) outside `workspace/`.
    pub fn dirty_outside_workspace(&self) -> BTreeSet<String> {
        porcelain_paths(&self.status_porcelain())
            .into_iter()
            .filter(|p| !p.starts_with("workspace/"))
            .collect()
    }

    /// Best-effort restore of newly dirtied paths after a failed contract
    /// attempt. `git restore --staged --worktree` first, falling back to
    /// `reset` + `checkout`.
    #[instrument(skip_all, fields(files = files.len()))]
    pub fn restore_paths(&self, files: &BTreeSet<String>) {
        if files.is_empty() {
            return;
        }
        let list: Vec<&str> = files.iter().map(String::as_str).collect();

        let mut args = vec!["restore", "--staged", "--worktree", "--"];
        args.extend(&list);
        if self.run(&args).ok() {
            return;
        }

        warn!("git restore failed, falling back to reset + checkout");
        let mut reset = vec!["reset", "--"];
        reset.extend(&list);
        self.run(&reset);
        let mut checkout = vec!["checkout", "--"];
        checkout.extend(&list);
        self.run(&checkout);
    }

    /// Create a detached worktree at `dir` pinned to HEAD.
    pub fn worktree_add(&self, dir: &Path) -> Result<()> {
        let dir_str = dir.display().to_string();
        let out = self.run(&["worktree", "add", "--detach", &dir_str, "HEAD"]);
        if !out.ok() {
            return Err(anyhow::anyhow!("git worktree add failed: {}", out.detail()));
        }
        Ok(())
    }

    /// Remove a worktree, forcibly; best-effort.
    pub fn worktree_remove(&self, dir: &Path) {
        let dir_str = dir.display().to_string();
        let out = self.run(&["worktree", "remove", "--force", &dir_str]);
        if !out.ok() {
            debug!(dir = %dir.display(), detail = out.detail(), "worktree remove failed");
        }
    }

    /// `git apply --check <patch>` executed inside `dir`.
    pub fn apply_check_in(&self, dir: &Path, patch_abs: &Path) -> GitOutput {
        let patch = patch_abs.display().to_string();
        self.run_in(dir, &["apply", "--check", &patch])
    }

    /// `git apply <patch>` executed inside `dir` (only ever a worktree).
    pub fn apply_in(&self, dir: &Path, patch_abs: &Path) -> GitOutput {
        let patch = patch_abs.display().to_string();
        self.run_in(dir, &["apply", &patch])
    }
}

/// Extract affected paths from porcelain entries, rename-aware.
pub fn porcelain_paths(entries: &[StatusEntry]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for entry in entries {
        if let Some((old, new)) = entry.path.split_once(" -> ") {
            out.insert(old.trim().to_string());
            out.insert(new.trim().to_string());
        } else {
            out.insert(entry.path.clone());
        }
    }
    out
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Some(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return None;
    }
    Some(StatusEntry {
        code: line[..2].to_string(),
        path: line[3..].trim().to_string(),
    })
}
