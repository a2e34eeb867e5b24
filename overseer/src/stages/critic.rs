//! Critiquing stage: apply the pure repair decision to the task state.

use anyhow::Result;

use crate::core::critic::{decide, CriticDecision, CriticInput};
use crate::core::state::{Role, Stage, TaskState};
use crate::stages::StageDeps;

const STAGE: &str = "critic";

pub fn run(state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));
    // Clear stale routing hints unless set intentionally below.
    state.next_stage = None;

    let policy = deps.critic_policy;
    let goal_text = format!(
        "{}\n{}",
        state.goal.as_deref().unwrap_or(""),
        state.latest_user_text()
    );
    state.expected_failure = (policy.expected_failure)(&goal_text);

    let decision = decide(
        &policy,
        &CriticInput {
            goal_text: &goal_text,
            last_result: state.last_exec_result(),
            loop_count: state.loop_count,
            web_search_count: state.web_search_count,
        },
    );

    match decision {
        CriticDecision::LoopLimit => {
            state.add_message(
                Role::System,
                format!(
                    "[critic] loop limit reached ({}/{}) -> finishing",
                    state.loop_count, policy.max_loops
                ),
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] done (loop limit)"));
        }
        CriticDecision::NoResults => {
            state.add_message(Role::System, "[critic] no exec results -> finishing", Some(STAGE));
            state.log(format!("[{STAGE}] done (no exec results)"));
        }
        CriticDecision::Success => {
            state.fix_instructions = None;
            state.add_message(Role::System, "[critic] execution ok -> finishing", Some(STAGE));
            state.log(format!("[{STAGE}] done (success)"));
        }
        CriticDecision::ExpectedFailure => {
            state.add_message(
                Role::System,
                "[critic] failure was expected -> finishing",
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] done (expected failure)"));
        }
        CriticDecision::ResearchWeb {
            query,
            fix_instructions,
        } => {
            state.loop_count += 1;
            state.research_query = Some(query);
            state.fix_instructions = Some(fix_instructions);
            state.next_stage = Some(Stage::ResearchingWeb);
            state.add_message(
                Role::System,
                format!(
                    "[critic] execution failed -> route to research_web (loop={}, web_count={})",
                    state.loop_count, state.web_search_count
                ),
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] done (route research_web)"));
        }
        CriticDecision::Repair { fix_instructions } => {
            state.loop_count += 1;
            state.fix_instructions = Some(fix_instructions);
            state.next_stage = Some(Stage::Coding);
            state.add_message(
                Role::System,
                format!(
                    "[critic] execution failed -> route to coder (loop={})",
                    state.loop_count
                ),
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] done (route coder)"));
        }
    }
    Ok(())
}
