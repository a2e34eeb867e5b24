//! Coding stage: produce workspace patches and a command batch.
//!
//! The model's reply is schema-validated JSON with one strict-mode retry;
//! after that the stage falls back deterministically instead of erroring.
//! Patch-proposal goals switch the system prompt and ground the model in
//! the real tracked-file list so diff hunks target files that exist.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ModelRole;
use crate::core::contract::requests_patch;
use crate::core::state::{ApplyMode, CodePatch, ExecRequest, Message, Mode, Role, TaskState};
use crate::io::sandbox::filter_safe_commands;
use crate::stages::{complete_validated_json, prompts, ModelFailure, StageDeps};

const STAGE: &str = "coder";
const CODER_SCHEMA: &str = include_str!("../../schemas/coder_output.schema.json");
const TRACKED_LIMIT: usize = 200;

pub fn run(state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));
    state.next_stage = None;

    if state.mode != Some(Mode::Task) || state.goal.is_none() {
        state.log(format!("[{STAGE}] not in task mode or missing goal; skipping"));
        return Ok(());
    }
    let goal = state.goal.clone().unwrap_or_default();

    let patch_mode = requests_patch(&goal);
    // Patch tasks always write their workspace artifacts, so a "no files"
    // phrase only binds outside patch-proposal mode.
    let forbid_files = !patch_mode && goal_forbids_files(&goal);
    let forbid_cmds = goal_forbids_commands(&goal);

    if forbid_files && forbid_cmds {
        state.exec_request = None;
        state.fix_instructions = None;
        state.add_message(
            Role::System,
            "[coder] Goal forbids files and commands; nothing to do.",
            Some(STAGE),
        );
        state.log(format!("[{STAGE}] goal forbids files+commands -> skip"));
        return Ok(());
    }

    let tracked = if patch_mode {
        filtered_tracked_files(deps, TRACKED_LIMIT)
    } else {
        Vec::new()
    };
    let messages = build_messages(state, &goal, patch_mode, &tracked);

    let value = match complete_validated_json(deps, ModelRole::Coder, &messages, CODER_SCHEMA, STAGE)
    {
        Ok(value) => value,
        Err(failure) => {
            apply_model_failure(state, deps, patch_mode, forbid_files, forbid_cmds, &failure);
            return Ok(());
        }
    };

    let mut patches = parse_patches(&value);
    if forbid_files {
        patches.clear();
    }

    let artifacts_missing = patch_mode && !has_patch_artifacts(&patches);
    if artifacts_missing {
        // The contract verifier will catch the gap at turn level; record
        // the complaint so the retry prompt carries it.
        let msg = "[coder] PATCH-PROPOSAL incomplete: both the .patch and the .md \
                   artifacts are required."
            .to_string();
        warn!("patch proposal missing required artifacts");
        state.add_message(Role::System, msg.clone(), Some(STAGE));
        state.fix_instructions = Some(format!(
            "{msg}\nRegenerate both workspace artifacts with strict JSON."
        ));
    }

    let mut exec_request = parse_exec(&value, forbid_cmds);
    if exec_request.is_none() && !forbid_cmds {
        if let Some(first) = patches.first() {
            exec_request = Some(ExecRequest {
                workdir: "workspace".to_string(),
                commands: vec![display_file_command(&first.file_path)],
            });
        }
    }

    if patches.is_empty() {
        state.exec_request = exec_request.clone();
        state.log(format!("[{STAGE}] no patches produced"));
        if let Some(req) = &exec_request {
            state.add_message(
                Role::System,
                format!(
                    "The coder produced no files.\n\nSuggested commands to run:\n  (workdir: {})\n{}",
                    req.workdir,
                    req.commands
                        .iter()
                        .map(|c| format!("- {c}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                ),
                Some(STAGE),
            );
        }
        return Ok(());
    }

    let written = match deps.workspace.apply(&patches) {
        Ok(written) => written,
        Err(err) => {
            state.pending_patches.clear();
            state.exec_request = None;
            state.add_message(
                Role::System,
                format!("[coder] ERROR applying patches: {err:#}"),
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] ERROR applying patches: {err:#}"));
            return Ok(());
        }
    };

    state.pending_patches.clear();
    state.applied_patches.extend(patches.iter().cloned());

    let mut summary = vec!["The coder created or updated the following files:".to_string()];
    for (patch, path) in patches.iter().zip(&written) {
        summary.push(format!("- {}  (-> {})", patch.file_path, path.display()));
    }
    if let Some(req) = &exec_request {
        if !req.commands.is_empty() {
            summary.push(String::new());
            summary.push("Suggested commands to run:".to_string());
            summary.push(format!("  (workdir: {})", req.workdir));
            for cmd in &req.commands {
                summary.push(format!("- {cmd}"));
            }
        }
    }

    debug!(patches = patches.len(), "applied coder patches");
    state.exec_request = exec_request;
    if !artifacts_missing {
        state.fix_instructions = None;
    }
    state.add_message(Role::System, summary.join("\n"), Some(STAGE));
    state.log(format!("[{STAGE}] applied {} patches", patches.len()));
    Ok(())
}

fn build_messages(
    state: &TaskState,
    goal: &str,
    patch_mode: bool,
    tracked: &[String],
) -> Vec<Message> {
    let template = if patch_mode { "coder_patch" } else { "coder" };
    let system = prompts()
        .get_template(template)
        .and_then(|t| t.render(minijinja::context! {}))
        .unwrap_or_default();

    let plan = format_plan(state);
    let existing: Vec<String> = {
        let mut files: Vec<String> = state
            .applied_patches
            .iter()
            .map(|p| p.file_path.clone())
            .collect();
        files.sort();
        files.dedup();
        files
    };
    let existing_str = if existing.is_empty() {
        "(none yet)".to_string()
    } else {
        existing
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let tracked_str = tracked
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    let notes = state
        .research_notes
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    let user = prompts()
        .get_template("coder_user")
        .and_then(|t| {
            t.render(minijinja::context! {
                goal => goal,
                plan => plan,
                repair => state.fix_instructions.as_deref(),
                existing_files => existing_str,
                notes => notes,
                tracked => (!tracked_str.is_empty()).then_some(tracked_str),
            })
        })
        .unwrap_or_else(|_| format!("Goal:\n{goal}"));

    let mut messages = vec![
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
    if let Some(tail) = recent_context_tail(state, 8, 3000) {
        messages.push(Message {
            role: Role::System,
            content: tail,
            stage: Some(STAGE.to_string()),
        });
    }
    messages
}

/// Compact tail of recent messages so the coder stays grounded in what
/// already happened this turn (executor output, contract complaints).
fn recent_context_tail(state: &TaskState, max_messages: usize, max_chars: usize) -> Option<String> {
    let start = state.messages.len().saturating_sub(max_messages);
    let mut lines = Vec::new();
    for m in &state.messages[start..] {
        let content = m.content.trim();
        if content.is_empty() {
            continue;
        }
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let stage = m.stage.as_deref().unwrap_or("?");
        let mut entry = content.to_string();
        if entry.len() > max_chars {
            let mut cut = max_chars;
            while !entry.is_char_boundary(cut) {
                cut -= 1;
            }
            entry.truncate(cut);
            entry.push_str("\n...[truncated]");
        }
        lines.push(format!("[{role}:{stage}] {entry}"));
    }
    if lines.is_empty() {
        None
    } else {
        Some(format!("Recent context (tail):\n{}", lines.join("\n\n")))
    }
}

fn format_plan(state: &TaskState) -> String {
    if state.plan.is_empty() {
        return "(no plan)".to_string();
    }
    state
        .plan
        .iter()
        .map(|s| format!("{}. {}", s.id, s.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn filtered_tracked_files(deps: &StageDeps<'_>, limit: usize) -> Vec<String> {
    deps.git
        .ls_files()
        .into_iter()
        .filter(|p| !p.starts_with("workspace/") && !p.starts_with(".venv/"))
        .filter(|p| !p.ends_with(".bin") && !p.ends_with(".sqlite3") && !p.ends_with(".db"))
        .take(limit)
        .collect()
}

fn apply_model_failure(
    state: &mut TaskState,
    deps: &StageDeps<'_>,
    patch_mode: bool,
    forbid_files: bool,
    forbid_cmds: bool,
    failure: &ModelFailure,
) {
    let detail = match failure {
        ModelFailure::Transport(err) => format!("model backend unavailable: {err}"),
        ModelFailure::Parse(err) => format!("model did not return valid structured output: {err}"),
    };
    state.log(format!("[{STAGE}] {detail}"));

    if patch_mode {
        let msg = format!(
            "[coder] ERROR in PATCH-PROPOSAL mode: {detail}.\n\
             Both workspace artifacts are still required; respond with strict JSON only."
        );
        state.add_message(Role::System, msg.clone(), Some(STAGE));
        state.fix_instructions = Some(msg);
        state.exec_request = None;
        return;
    }

    if forbid_files {
        state.exec_request = None;
        let msg = format!("[coder] Goal forbids files and {detail}; skipping.");
        state.add_message(Role::System, msg.clone(), Some(STAGE));
        state.fix_instructions = Some(msg);
        return;
    }

    // Deterministic fallback artifact: a tiny runnable script.
    let patch = CodePatch {
        file_path: "generated_script.py".to_string(),
        content: "print('Hello from the overseer coder fallback')\n".to_string(),
        apply_mode: ApplyMode::Overwrite,
    };
    let exec = (!forbid_cmds).then(|| ExecRequest {
        workdir: "workspace".to_string(),
        commands: vec!["python generated_script.py".to_string()],
    });

    match deps.workspace.apply(std::slice::from_ref(&patch)) {
        Ok(written) => {
            state.applied_patches.push(patch.clone());
            state.exec_request = exec.clone();
            state.fix_instructions = None;
            state.add_message(
                Role::System,
                format!(
                    "The coder fell back to a deterministic artifact:\n- {}  (-> {})\n{}",
                    patch.file_path,
                    written[0].display(),
                    exec.map(|e| format!(
                        "\nSuggested commands to run:\n  (workdir: {})\n- {}",
                        e.workdir, e.commands[0]
                    ))
                    .unwrap_or_default()
                ),
                Some(STAGE),
            );
        }
        Err(err) => {
            state.exec_request = None;
            state.add_message(
                Role::System,
                format!("[coder] fallback write failed: {err:#}"),
                Some(STAGE),
            );
        }
    }
}

/// Convert the model JSON payload into patches. Dedupe by `file_path`,
/// last one wins; CRLF is normalized away.
fn parse_patches(value: &Value) -> Vec<CodePatch> {
    let Some(raw) = value.get("patches").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut ordered: Vec<CodePatch> = Vec::new();
    for entry in raw {
        let Some(file_path) = entry
            .get("file_path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|f| !f.is_empty())
        else {
            continue;
        };
        let content = entry
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .replace("\r\n", "\n");
        let apply_mode = match entry.get("apply_mode").and_then(Value::as_str) {
            Some("append") => ApplyMode::Append,
            _ => ApplyMode::Overwrite,
        };
        let patch = CodePatch {
            file_path: file_path.to_string(),
            content,
            apply_mode,
        };
        match ordered.iter_mut().find(|p| p.file_path == patch.file_path) {
            Some(existing) => *existing = patch,
            None => ordered.push(patch),
        }
    }
    ordered
}

fn parse_exec(value: &Value, forbid_cmds: bool) -> Option<ExecRequest> {
    if forbid_cmds {
        return None;
    }
    let raw = value.get("exec")?.as_object()?;
    let workdir = raw
        .get("workdir")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .unwrap_or("workspace")
        .to_string();
    let commands: Vec<String> = raw
        .get("commands")
        .and_then(Value::as_array)
        .map(|cmds| {
            cmds.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let filtered = filter_safe_commands(&commands);
    if filtered.is_empty() {
        return None;
    }
    Some(ExecRequest {
        workdir,
        commands: filtered,
    })
}

fn has_patch_artifacts(patches: &[CodePatch]) -> bool {
    let has_patch = patches
        .iter()
        .any(|p| p.file_path.to_lowercase().ends_with(".patch"));
    let has_md = patches
        .iter()
        .any(|p| p.file_path.to_lowercase().ends_with(".md"));
    has_patch && has_md
}

/// Safe display command for the first written file: allow-listed binary,
/// quoted argument, no shell operators.
fn display_file_command(file_path: &str) -> String {
    let rel = file_path.strip_prefix("workspace/").unwrap_or(file_path);
    format!("python -c \"import pathlib; print(pathlib.Path('{rel}').read_text())\"")
}

fn goal_forbids_files(goal: &str) -> bool {
    let g = goal.to_lowercase();
    const MARKERS: &[&str] = &[
        "do not write files",
        "do not create files",
        "no files",
        "without writing files",
        "without creating files",
    ];
    MARKERS.iter().any(|m| g.contains(m))
}

fn goal_forbids_commands(goal: &str) -> bool {
    let g = goal.to_lowercase();
    const MARKERS: &[&str] = &[
        "do not run",
        "don't run",
        "no commands",
        "without running",
    ];
    MARKERS.iter().any(|m| g.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sandbox::is_safe_command;

    #[test]
    fn parse_patches_dedupes_last_wins() {
        let value = serde_json::json!({
            "patches": [
                {"file_path": "a.py", "content": "first"},
                {"file_path": "b.py", "content": "b"},
                {"file_path": "a.py", "content": "second", "apply_mode": "append"}
            ]
        });
        let patches = parse_patches(&value);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].file_path, "a.py");
        assert_eq!(patches[0].content, "second");
        assert_eq!(patches[0].apply_mode, ApplyMode::Append);
    }

    #[test]
    fn parse_patches_normalizes_crlf_and_bad_modes() {
        let value = serde_json::json!({
            "patches": [
                {"file_path": "a.py", "content": "x\r\ny\r\n", "apply_mode": "sideways"}
            ]
        });
        let patches = parse_patches(&value);
        assert_eq!(patches[0].content, "x\ny\n");
        assert_eq!(patches[0].apply_mode, ApplyMode::Overwrite);
    }

    #[test]
    fn parse_exec_filters_unsafe_commands() {
        let value = serde_json::json!({
            "exec": {"workdir": "workspace", "commands": ["python a.py", "rm -rf /", "python a.py"]}
        });
        let req = parse_exec(&value, false).expect("exec");
        assert_eq!(req.commands, vec!["python a.py".to_string()]);

        let all_unsafe = serde_json::json!({
            "exec": {"workdir": "workspace", "commands": ["rm -rf /"]}
        });
        assert!(parse_exec(&all_unsafe, false).is_none());
        assert!(parse_exec(&value, true).is_none());
    }

    #[test]
    fn display_command_is_allow_listed() {
        let cmd = display_file_command("workspace/hello.py");
        assert!(cmd.contains("hello.py"));
        assert!(is_safe_command(&cmd), "display command must pass the sandbox: {cmd}");
    }

    #[test]
    fn patch_artifact_detection() {
        let both = vec![
            CodePatch {
                file_path: "IMPROVEMENTS.patch".to_string(),
                content: String::new(),
                apply_mode: ApplyMode::Overwrite,
            },
            CodePatch {
                file_path: "IMPROVEMENTS.md".to_string(),
                content: String::new(),
                apply_mode: ApplyMode::Overwrite,
            },
        ];
        assert!(has_patch_artifacts(&both));
        assert!(!has_patch_artifacts(&both[..1].to_vec()));
    }

    #[test]
    fn goal_constraint_phrases() {
        assert!(goal_forbids_files("explain the design, do not create files"));
        assert!(!goal_forbids_files("create a script"));
        assert!(goal_forbids_commands("write it but do not run anything"));
        assert!(!goal_forbids_commands("write and run the script"));
    }
}
