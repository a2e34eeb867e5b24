//! Impure stage nodes coordinating core logic with I/O.
//!
//! Each stage is `fn(&mut TaskState, &StageDeps) -> Result<()>`. Stages
//! never decide routing by themselves beyond setting the `next_stage`
//! override; the pure router in [`crate::core::router`] interprets state.
//! A stage error is caught by the turn loop and degrades to the chat
//! stage, so nothing here may corrupt state on failure.

mod chat;
mod coder;
mod critic;
mod executor;
mod intent;
mod planner;
mod research;
mod research_web;

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::Result;
use jsonschema::Draft;
use minijinja::Environment;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ModelRole, OverseerConfig};
use crate::core::critic::CriticPolicy;
use crate::core::state::{Message, Role, Stage, TaskState};
use crate::error::{ParseError, TransportError};
use crate::io::git::Git;
use crate::io::sandbox::Sandbox;
use crate::io::workspace::Workspace;
use crate::llm::CompletionService;
use crate::paths::ProjectPaths;
use crate::research::{RepoResearch, WebSearch};

const PLANNER_TEMPLATE: &str = include_str!("../prompts/planner.md");
const CODER_TEMPLATE: &str = include_str!("../prompts/coder.md");
const CODER_PATCH_TEMPLATE: &str = include_str!("../prompts/coder_patch.md");
const CODER_USER_TEMPLATE: &str = include_str!("../prompts/coder_user.md");
const CHAT_TEMPLATE: &str = include_str!("../prompts/chat.md");

static PROMPTS: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("planner", PLANNER_TEMPLATE)
        .expect("planner template should be valid");
    env.add_template("coder", CODER_TEMPLATE)
        .expect("coder template should be valid");
    env.add_template("coder_patch", CODER_PATCH_TEMPLATE)
        .expect("coder_patch template should be valid");
    env.add_template("coder_user", CODER_USER_TEMPLATE)
        .expect("coder_user template should be valid");
    env.add_template("chat", CHAT_TEMPLATE)
        .expect("chat template should be valid");
    env
});

pub(crate) fn prompts() -> &'static Environment<'static> {
    &PROMPTS
}

/// Everything a stage may touch, assembled per attempt by the turn runner
/// and passed down by dependency injection.
pub struct StageDeps<'a> {
    pub config: &'a OverseerConfig,
    pub paths: &'a ProjectPaths,
    pub completions: &'a dyn CompletionService,
    pub repo_research: &'a dyn RepoResearch,
    pub web_search: &'a dyn WebSearch,
    pub sandbox: &'a Sandbox,
    pub workspace: &'a Workspace,
    pub git: &'a Git,
    pub critic_policy: CriticPolicy,
    /// Wall-clock deadline for the whole turn, threaded into every
    /// subprocess call.
    pub deadline: Instant,
}

impl StageDeps<'_> {
    /// Remaining turn budget; `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

/// Execute one stage node. `Chatting` is the terminal stage.
pub fn run_stage(stage: Stage, state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    match stage {
        Stage::IntentRouting => intent::run(state, deps),
        Stage::Planning => planner::run(state, deps),
        Stage::Coding => coder::run(state, deps),
        Stage::Executing => executor::run(state, deps),
        Stage::Critiquing => critic::run(state, deps),
        Stage::Researching => research::run(state, deps),
        Stage::ResearchingWeb => research_web::run(state, deps),
        Stage::Chatting => chat::run(state, deps),
    }
}

/// Why a structured completion could not be obtained.
#[derive(Debug)]
pub(crate) enum ModelFailure {
    Transport(TransportError),
    /// Not valid JSON, or JSON violating the schema, even after the one
    /// strict-mode retry.
    Parse(ParseError),
}

const STRICT_RETRY_NUDGE: &str = "Your previous reply was not valid strict JSON matching the \
     required format. Respond again with STRICT JSON only - no prose, no markdown fences.";

/// Request a completion that must match `schema`.
///
/// Exactly one strict-mode retry on a parse/schema failure, then the error
/// is returned for the caller's deterministic fallback.
pub(crate) fn complete_validated_json(
    deps: &StageDeps<'_>,
    role: ModelRole,
    messages: &[Message],
    schema_raw: &str,
    stage_label: &str,
) -> Result<Value, ModelFailure> {
    let model = deps.config.model_for(role);
    let raw = deps
        .completions
        .complete(messages, model)
        .map_err(ModelFailure::Transport)?;

    match parse_and_validate(&raw, schema_raw) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            debug!(stage = stage_label, err = %first_err, "structured output invalid, strict retry");
            let mut retry_messages = messages.to_vec();
            retry_messages.push(Message {
                role: Role::System,
                content: STRICT_RETRY_NUDGE.to_string(),
                stage: Some(stage_label.to_string()),
            });
            let raw2 = deps
                .completions
                .complete(&retry_messages, model)
                .map_err(ModelFailure::Transport)?;
            parse_and_validate(&raw2, schema_raw).map_err(|second_err| {
                warn!(stage = stage_label, err = %second_err, "strict retry still invalid");
                ModelFailure::Parse(ParseError(second_err))
            })
        }
    }
}

fn parse_and_validate(raw: &str, schema_raw: &str) -> Result<Value, String> {
    let cleaned = strip_markdown_fences(raw);
    let value: Value =
        serde_json::from_str(cleaned).map_err(|e| format!("invalid JSON: {e}"))?;
    let schema: Value =
        serde_json::from_str(schema_raw).map_err(|e| format!("invalid schema: {e}"))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| format!("compile schema: {e}"))?;
    let violations: Vec<String> = compiled
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(format!("schema violations: {}", violations.join("; ")));
    }
    Ok(value)
}

/// Models habitually wrap JSON in markdown fences; tolerate that one wrapper.
fn strip_markdown_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_SCHEMA: &str = r#"{
        "type": "object",
        "required": ["plan"],
        "properties": {"plan": {"type": "array"}}
    }"#;

    #[test]
    fn strips_fenced_json() {
        assert_eq!(strip_markdown_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_markdown_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn parse_and_validate_enforces_schema() {
        assert!(parse_and_validate(r#"{"plan": []}"#, SIMPLE_SCHEMA).is_ok());
        assert!(parse_and_validate(r#"{"plan": 3}"#, SIMPLE_SCHEMA).is_err());
        assert!(parse_and_validate("not json", SIMPLE_SCHEMA).is_err());
    }

    #[test]
    fn templates_compile() {
        assert!(prompts().get_template("planner").is_ok());
        assert!(prompts().get_template("coder").is_ok());
        assert!(prompts().get_template("coder_patch").is_ok());
        assert!(prompts().get_template("coder_user").is_ok());
        assert!(prompts().get_template("chat").is_ok());
    }
}
