//! Web research stage.
//!
//! Owns the per-task web-search budget: callers route here, but the
//! counter only moves when a search actually runs, so the planner's
//! pre-research and the critic's failure-driven research share one budget.

use anyhow::Result;

use crate::core::state::{Role, TaskState};
use crate::stages::StageDeps;

const STAGE: &str = "research_web";

pub fn run(state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));
    state.next_stage = None;

    let query = state
        .research_query
        .take()
        .or_else(|| state.goal.clone())
        .unwrap_or_else(|| state.latest_user_text().to_string());

    if !deps.config.web_search_enabled || !deps.web_search.is_enabled() {
        state.research_notes.get_or_insert_with(String::new);
        state.add_message(
            Role::System,
            "[web_search] provider is disabled.",
            Some(STAGE),
        );
        state.log(format!("[{STAGE}] provider disabled"));
        return Ok(());
    }

    if state.web_search_count >= deps.config.max_web_searches {
        state.research_notes.get_or_insert_with(String::new);
        state.add_message(
            Role::System,
            format!(
                "[web_search] budget exhausted ({}/{}).",
                state.web_search_count, deps.config.max_web_searches
            ),
            Some(STAGE),
        );
        state.log(format!("[{STAGE}] budget exhausted"));
        return Ok(());
    }

    state.web_search_count += 1;
    match deps.web_search.search(&query, deps.config.research_top_k) {
        Ok(results) => {
            state.add_message(
                Role::System,
                format!("[web_search results]\n{}", results.trim()),
                Some(STAGE),
            );
            state.web_results = Some(results.clone());
            state.research_notes = Some(results);
            state.log(format!("[{STAGE}] results gathered (query={query:?})"));
        }
        Err(err) => {
            state.research_notes.get_or_insert_with(String::new);
            state.add_message(
                Role::System,
                format!("[web_search] search failed: {err:#}"),
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] search failed: {err:#}"));
        }
    }
    Ok(())
}
