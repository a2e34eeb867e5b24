//! Intent-routing stage: classify the latest user message and seed the
//! task state for this turn.

use anyhow::Result;
use tracing::debug;

use crate::core::intent::{classify, Intent};
use crate::core::state::{Mode, Stage, TaskState};
use crate::stages::StageDeps;

const STAGE: &str = "intent";

pub fn run(state: &mut TaskState, _deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));

    let text = state.latest_user_text().to_string();
    let intent = classify(&text);
    debug!(?intent, "classified user intent");

    match intent {
        Intent::Task { goal } => {
            state.mode = Some(Mode::Task);
            state.log(format!("[{STAGE}] intent=task goal={goal:?}"));
            state.goal = Some(goal);
            state.next_stage = Some(Stage::Planning);
        }
        Intent::Research { query } => {
            state.log(format!("[{STAGE}] intent=research query={query:?}"));
            state.research_query = Some(query);
            state.next_stage = Some(Stage::Researching);
        }
        Intent::ResearchWeb { query } => {
            state.log(format!("[{STAGE}] intent=research_web query={query:?}"));
            state.research_query = Some(query);
            state.next_stage = Some(Stage::ResearchingWeb);
        }
        Intent::Chat => {
            state.mode = Some(Mode::Chat);
            state.goal = None;
            state.next_stage = None;
            state.log(format!("[{STAGE}] intent=chat"));
        }
    }
    Ok(())
}
