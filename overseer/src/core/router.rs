//! Stage transitions.
//!
//! Each transition is a pure function of [`TaskState`] returning the next
//! [`Stage`]. An explicit `next_stage` override wins when it names a stage
//! that is legal from the current one; anything else falls through to the
//! heuristics, so a stale or bogus override can never derail the machine.

use crate::core::intent::looks_like_repo_research;
use crate::core::state::{Mode, Stage, TaskState};

/// Compute the next stage from the current one.
///
/// `Chatting` is terminal and maps to itself; `Coding -> Executing` and
/// `Executing -> Critiquing` are deterministic.
pub fn next_stage(current: Stage, state: &TaskState) -> Stage {
    match current {
        Stage::IntentRouting => from_intent(state),
        Stage::Planning => from_planner(state),
        Stage::Coding => Stage::Executing,
        Stage::Executing => Stage::Critiquing,
        Stage::Critiquing => from_critic(state),
        Stage::Researching => from_research(state),
        Stage::ResearchingWeb => from_research_web(state),
        Stage::Chatting => Stage::Chatting,
    }
}

fn override_in(state: &TaskState, allowed: &[Stage]) -> Option<Stage> {
    state.next_stage.filter(|stage| allowed.contains(stage))
}

fn in_task(state: &TaskState) -> bool {
    state.mode == Some(Mode::Task) && state.goal.is_some()
}

fn from_intent(state: &TaskState) -> Stage {
    if let Some(stage) = override_in(
        state,
        &[
            Stage::Chatting,
            Stage::Planning,
            Stage::Researching,
            Stage::ResearchingWeb,
        ],
    ) {
        return stage;
    }
    if looks_like_repo_research(state.latest_user_text()) {
        return Stage::Researching;
    }
    if in_task(state) {
        return Stage::Planning;
    }
    Stage::Chatting
}

fn from_planner(state: &TaskState) -> Stage {
    if let Some(stage) = override_in(state, &[Stage::ResearchingWeb, Stage::Researching]) {
        return stage;
    }
    // Patch/diff tasks benefit from repo grounding before coding.
    let goal = state.goal.as_deref().unwrap_or("").to_lowercase();
    let wants_patch =
        goal.contains("diff") || goal.contains("patch") || goal.contains("improvements.patch");
    if wants_patch && state.research_notes.is_none() {
        return Stage::Researching;
    }
    Stage::Coding
}

fn from_research(state: &TaskState) -> Stage {
    if in_task(state) {
        Stage::Planning
    } else {
        Stage::Chatting
    }
}

fn from_research_web(state: &TaskState) -> Stage {
    // Coding only for web-informed repair: pending fix instructions mean the
    // critic sent us here mid-loop and the coder must consume the notes.
    if state.fix_instructions.is_some() {
        return Stage::Coding;
    }
    if in_task(state) {
        return Stage::Planning;
    }
    Stage::Chatting
}

fn from_critic(state: &TaskState) -> Stage {
    override_in(
        state,
        &[
            Stage::Coding,
            Stage::Planning,
            Stage::Researching,
            Stage::ResearchingWeb,
            Stage::Chatting,
        ],
    )
    .unwrap_or(Stage::Chatting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Role;

    fn task_state(goal: &str) -> TaskState {
        TaskState {
            mode: Some(Mode::Task),
            goal: Some(goal.to_string()),
            ..TaskState::default()
        }
    }

    #[test]
    fn intent_override_wins() {
        let mut state = task_state("anything");
        state.next_stage = Some(Stage::ResearchingWeb);
        assert_eq!(next_stage(Stage::IntentRouting, &state), Stage::ResearchingWeb);
    }

    #[test]
    fn intent_ignores_illegal_override() {
        let mut state = task_state("anything");
        state.next_stage = Some(Stage::Executing);
        assert_eq!(next_stage(Stage::IntentRouting, &state), Stage::Planning);
    }

    #[test]
    fn intent_defaults_to_chat() {
        let mut state = TaskState::default();
        state.add_message(Role::User, "hello there", None);
        assert_eq!(next_stage(Stage::IntentRouting, &state), Stage::Chatting);
    }

    #[test]
    fn intent_heuristic_routes_repo_questions_to_research() {
        let mut state = TaskState::default();
        state.add_message(Role::User, "what files are in this repo?", None);
        assert_eq!(next_stage(Stage::IntentRouting, &state), Stage::Researching);
    }

    #[test]
    fn coding_and_executing_are_deterministic() {
        let state = task_state("x");
        assert_eq!(next_stage(Stage::Coding, &state), Stage::Executing);
        assert_eq!(next_stage(Stage::Executing, &state), Stage::Critiquing);
    }

    #[test]
    fn planner_requests_research_for_patch_goals() {
        let state = task_state("produce workspace/IMPROVEMENTS.patch as a unified diff");
        assert_eq!(next_stage(Stage::Planning, &state), Stage::Researching);

        let mut grounded = task_state("produce workspace/IMPROVEMENTS.patch");
        grounded.research_notes = Some("notes".to_string());
        assert_eq!(next_stage(Stage::Planning, &grounded), Stage::Coding);
    }

    #[test]
    fn research_routes_by_mode() {
        assert_eq!(next_stage(Stage::Researching, &task_state("x")), Stage::Planning);
        assert_eq!(
            next_stage(Stage::Researching, &TaskState::default()),
            Stage::Chatting
        );
    }

    #[test]
    fn web_research_resumes_repair_when_fix_pending() {
        let mut state = task_state("x");
        state.fix_instructions = Some("fix".to_string());
        assert_eq!(next_stage(Stage::ResearchingWeb, &state), Stage::Coding);

        state.fix_instructions = None;
        assert_eq!(next_stage(Stage::ResearchingWeb, &state), Stage::Planning);
        assert_eq!(
            next_stage(Stage::ResearchingWeb, &TaskState::default()),
            Stage::Chatting
        );
    }

    #[test]
    fn critic_defaults_to_chat_without_override() {
        let state = task_state("x");
        assert_eq!(next_stage(Stage::Critiquing, &state), Stage::Chatting);

        let mut repair = task_state("x");
        repair.next_stage = Some(Stage::Coding);
        assert_eq!(next_stage(Stage::Critiquing, &repair), Stage::Coding);
    }

    #[test]
    fn chatting_is_terminal() {
        assert_eq!(
            next_stage(Stage::Chatting, &TaskState::default()),
            Stage::Chatting
        );
    }
}
