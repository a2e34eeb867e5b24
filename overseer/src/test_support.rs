//! Shared helpers for unit and integration tests.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

use crate::config::ModelConfig;
use crate::core::state::Message;
use crate::error::TransportError;
use crate::llm::CompletionService;
use crate::research::{RepoResearch, WebSearch};

/// A temporary git repository with one initial commit.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path();

        run_git(root, &["init"])?;
        run_git(root, &["config", "user.email", "test@example.com"])?;
        run_git(root, &["config", "user.name", "test"])?;

        std::fs::write(root.join("README.md"), "hi\n").context("write README")?;
        run_git(root, &["add", "README.md"])?;
        run_git(root, &["commit", "-m", "chore: init"])?;

        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Write and commit a tracked file.
    pub fn commit_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create parent")?;
        }
        std::fs::write(&path, contents).context("write file")?;
        run_git(self.root(), &["add", rel])?;
        let message = format!("chore: add {rel}");
        run_git(self.root(), &["commit", "-m", message.as_str()])?;
        Ok(())
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("git {} failed", args.join(" ")));
    }
    Ok(())
}

/// Completion service returning scripted replies in order; once exhausted,
/// the last reply repeats.
pub struct FakeCompletion {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
}

impl FakeCompletion {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
        }
    }
}

impl CompletionService for FakeCompletion {
    fn complete(
        &self,
        _messages: &[Message],
        _model: &ModelConfig,
    ) -> Result<String, TransportError> {
        let mut replies = self.replies.lock().expect("replies lock");
        if let Some(next) = replies.pop_front() {
            *self.last.lock().expect("last lock") = Some(next.clone());
            return Ok(next);
        }
        self.last
            .lock()
            .expect("last lock")
            .clone()
            .ok_or_else(|| TransportError::Api("fake completion exhausted".to_string()))
    }
}

/// Completion service that always fails with a transport error.
pub struct FailingCompletion;

impl CompletionService for FailingCompletion {
    fn complete(
        &self,
        _messages: &[Message],
        _model: &ModelConfig,
    ) -> Result<String, TransportError> {
        Err(TransportError::Http("connection refused".to_string()))
    }
}

/// Web search returning a fixed notes blob.
pub struct FakeWebSearch {
    pub notes: String,
}

impl WebSearch for FakeWebSearch {
    fn search(&self, _query: &str, _top_k: usize) -> Result<String> {
        Ok(self.notes.clone())
    }
}

/// Repo research returning a fixed notes blob.
pub struct FakeRepoResearch {
    pub notes: String,
}

impl RepoResearch for FakeRepoResearch {
    fn query(&self, _query: &str, _top_k: usize) -> Result<String> {
        Ok(self.notes.clone())
    }
}
