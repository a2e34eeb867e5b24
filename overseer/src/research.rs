//! Research provider seams.
//!
//! The repository index and the web-search backend are external
//! collaborators: the orchestrator only ever sees these two traits, each
//! invoked a small bounded number of times per task. The default
//! [`Disabled`] implementation reports itself unavailable so routing can
//! skip research stages cleanly.

use anyhow::Result;

/// Queries the repository index (RAG) for grounding notes.
pub trait RepoResearch {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Free-text answer for a query, best effort.
    fn query(&self, query: &str, top_k: usize) -> Result<String>;
}

/// Queries the web for external facts.
pub trait WebSearch {
    fn is_enabled(&self) -> bool {
        true
    }

    fn search(&self, query: &str, top_k: usize) -> Result<String>;
}

/// Provider that is not wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

impl RepoResearch for Disabled {
    fn is_enabled(&self) -> bool {
        false
    }

    fn query(&self, _query: &str, _top_k: usize) -> Result<String> {
        Ok(String::new())
    }
}

impl WebSearch for Disabled {
    fn is_enabled(&self) -> bool {
        false
    }

    fn search(&self, _query: &str, _top_k: usize) -> Result<String> {
        Ok(String::new())
    }
}
