//! Chatting stage: the terminal stage of every turn.
//!
//! Produces exactly one assistant reply. A transport failure degrades to a
//! deterministic error-text reply — the turn still resolves.

use anyhow::Result;

use crate::config::ModelRole;
use crate::core::state::{Message, Role, TaskState};
use crate::stages::{prompts, StageDeps};

const STAGE: &str = "chat";
/// Conversation tail forwarded to the model.
const HISTORY_WINDOW: usize = 16;

pub fn run(state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));

    let system = prompts()
        .get_template("chat")
        .and_then(|t| t.render(minijinja::context! {}))
        .unwrap_or_default();

    let start = state.messages.len().saturating_sub(HISTORY_WINDOW);
    let mut messages = vec![Message {
        role: Role::System,
        content: system,
        stage: Some(STAGE.to_string()),
    }];
    messages.extend(state.messages[start..].iter().cloned());

    let model = deps.config.model_for(ModelRole::Chat);
    let reply = match deps.completions.complete(&messages, model) {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => "(the model returned an empty reply)".to_string(),
        Err(err) => {
            state.log(format!("[{STAGE}] transport error: {err}"));
            format!(
                "I could not reach the model backend ({err}). The turn's artifacts and \
                 execution results above still stand."
            )
        }
    };

    state.add_message(Role::Assistant, reply, Some(STAGE));
    state.log(format!("[{STAGE}] done"));
    Ok(())
}
