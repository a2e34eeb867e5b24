//! Repository research stage.
//!
//! Thin adapter over the [`crate::research::RepoResearch`] seam. Always
//! leaves `research_notes` set — even empty — so the planner's "needs
//! grounding" heuristic cannot route here twice in one turn.

use anyhow::Result;

use crate::core::intent::strip_console_prefix;
use crate::core::state::{Role, TaskState};
use crate::stages::StageDeps;

const STAGE: &str = "research";

pub fn run(state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));
    state.next_stage = None;

    let query = state
        .research_query
        .take()
        .or_else(|| state.goal.clone())
        .unwrap_or_else(|| strip_console_prefix(state.latest_user_text()).to_string());

    if !deps.repo_research.is_enabled() {
        state.research_notes = Some(String::new());
        state.add_message(
            Role::System,
            "[research] repository research provider is disabled.",
            Some(STAGE),
        );
        state.log(format!("[{STAGE}] provider disabled"));
        return Ok(());
    }

    match deps.repo_research.query(&query, deps.config.research_top_k) {
        Ok(notes) => {
            state.add_message(
                Role::System,
                format!("[research results]\n{}", notes.trim()),
                Some(STAGE),
            );
            state.research_notes = Some(notes);
            state.log(format!("[{STAGE}] notes gathered"));
        }
        Err(err) => {
            // Degrade: record the miss, never fail the turn over research.
            state.research_notes = Some(String::new());
            state.add_message(
                Role::System,
                format!("[research] query failed: {err:#}"),
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] query failed: {err:#}"));
        }
    }
    Ok(())
}
