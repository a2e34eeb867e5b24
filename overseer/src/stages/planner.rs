//! Planning stage: turn the goal into a small linear plan.
//!
//! May first route to web research when the goal needs external facts.
//! A model that cannot produce the structured plan degrades to a single
//! catch-all step rather than failing the turn.

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::config::ModelRole;
use crate::core::intent::needs_web_research;
use crate::core::state::{Message, Mode, PlanStep, Role, Stage, StepStatus, TaskState};
use crate::stages::{complete_validated_json, prompts, ModelFailure, StageDeps};

const STAGE: &str = "planner";
const PLANNER_SCHEMA: &str = include_str!("../../schemas/planner_output.schema.json");

pub fn run(state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));
    state.next_stage = None;

    if state.mode != Some(Mode::Task) || state.goal.is_none() {
        state.log(format!("[{STAGE}] no goal in task mode; nothing to plan"));
        return Ok(());
    }
    let goal = state.goal.clone().unwrap_or_default();

    // Web pre-research before planning, once, when the goal needs facts.
    // `research_notes` is always Some(..) after a research stage ran, even
    // when it produced nothing, so this cannot loop.
    if deps.config.web_search_enabled
        && deps.web_search.is_enabled()
        && state.research_notes.is_none()
        && needs_web_research(&goal)
    {
        state.research_query = Some(goal.trim().to_string());
        state.next_stage = Some(Stage::ResearchingWeb);
        state.add_message(
            Role::System,
            format!("[planner] requesting web search for goal: {goal:?}"),
            Some(STAGE),
        );
        state.log(format!("[{STAGE}] routed to research_web"));
        return Ok(());
    }

    let system = prompts()
        .get_template("planner")
        .and_then(|t| t.render(minijinja::context! {}))
        .unwrap_or_default();
    let notes = state
        .research_notes
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let user = match notes {
        Some(notes) => format!("Goal: {goal}\n\nWeb research notes:\n{notes}\n"),
        None => format!("Goal: {goal}"),
    };
    let messages = vec![
        Message {
            role: Role::System,
            content: system,
            stage: Some(STAGE.to_string()),
        },
        Message {
            role: Role::User,
            content: user,
            stage: Some(STAGE.to_string()),
        },
    ];

    let plan = match complete_validated_json(deps, ModelRole::Planner, &messages, PLANNER_SCHEMA, STAGE)
    {
        Ok(value) => parse_plan(&value),
        Err(ModelFailure::Transport(err)) => {
            state.log(format!("[{STAGE}] transport error: {err}; fallback plan"));
            fallback_plan(&goal)
        }
        Err(ModelFailure::Parse(err)) => {
            state.log(format!("[{STAGE}] parse error: {err}; fallback plan"));
            fallback_plan(&goal)
        }
    };

    debug!(steps = plan.len(), "plan created");
    state.log(format!("[{STAGE}] created {} plan steps", plan.len()));
    state.plan = plan;
    Ok(())
}

fn parse_plan(value: &Value) -> Vec<PlanStep> {
    let mut steps = Vec::new();
    let Some(raw) = value.get("plan").and_then(Value::as_array) else {
        return steps;
    };
    for (idx, entry) in raw.iter().enumerate() {
        let Some(description) = entry
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty())
        else {
            continue;
        };
        let id = entry
            .get("id")
            .and_then(Value::as_u64)
            .unwrap_or(idx as u64 + 1) as u32;
        steps.push(PlanStep {
            id,
            description: description.to_string(),
            status: StepStatus::Pending,
        });
    }
    steps
}

fn fallback_plan(goal: &str) -> Vec<PlanStep> {
    vec![PlanStep {
        id: 1,
        description: format!("Attempt to solve goal: {goal}"),
        status: StepStatus::Pending,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plan_entries_and_skips_blanks() {
        let value: Value = serde_json::json!({
            "plan": [
                {"id": 1, "description": "First"},
                {"description": "   "},
                {"description": "Third"}
            ]
        });
        let plan = parse_plan(&value);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].id, 1);
        assert_eq!(plan[1].id, 3);
        assert_eq!(plan[1].description, "Third");
    }

    #[test]
    fn fallback_plan_carries_goal() {
        let plan = fallback_plan("write hello.py");
        assert_eq!(plan.len(), 1);
        assert!(plan[0].description.contains("write hello.py"));
    }
}
