//! Turn orchestration.
//!
//! One user turn resolves completely before the next is accepted: the
//! stage machine runs to its terminal chat stage, then the contract
//! verifier judges the output. Contract violations drive a bounded retry
//! loop with corrective instructions; a portable wall-clock deadline wraps
//! the whole invocation and is threaded into every subprocess call.

use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::OverseerConfig;
use crate::core::critic::CriticPolicy;
use crate::core::router;
use crate::core::state::{Mode, Role, Stage, TaskState};
use crate::io::git::Git;
use crate::io::sandbox::Sandbox;
use crate::io::workspace::Workspace;
use crate::llm::CompletionService;
use crate::paths::ProjectPaths;
use crate::research::{RepoResearch, WebSearch};
use crate::stages::{run_stage, StageDeps};
use crate::verify::Verifier;

/// Terminal outcome of a turn. Every variant maps to exactly one
/// human-readable summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Success,
    ExpectedFailure,
    ContractFailure,
    TimedOut,
}

/// What the REPL prints after a turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub summary: String,
    pub assistant_reply: Option<String>,
    pub attempts: u32,
    /// Contract failure reasons from the final attempt, if any.
    pub contract_failures: Vec<String>,
}

enum MachineResult {
    Finished,
    TimedOut,
}

/// Drives turns against one project checkout.
pub struct TurnRunner<'a> {
    pub config: &'a OverseerConfig,
    pub paths: &'a ProjectPaths,
    pub completions: &'a dyn CompletionService,
    pub repo_research: &'a dyn RepoResearch,
    pub web_search: &'a dyn WebSearch,
    pub critic_policy: CriticPolicy,
}

impl TurnRunner<'_> {
    /// Resolve one user turn, including all internal repair iterations.
    ///
    /// Never panics and never returns early with corrupted state: a timed
    /// out or contract-failed turn preserves everything accumulated so
    /// far.
    #[instrument(skip_all, fields(turn_id = state.turn_id + 1))]
    pub fn run_turn(&self, state: &mut TaskState, user_input: &str) -> TurnReport {
        state.turn_id += 1;
        state.reset_turn_fields();

        let git = Git::new(&self.paths.repo_root);
        let sandbox = Sandbox::new(
            &self.paths.repo_root,
            self.config.command_timeout(),
            self.config.exec_output_limit_bytes,
        );
        let workspace = Workspace::new(&self.paths.workspace_dir);
        let verifier = Verifier::new(
            self.paths,
            &git,
            &self.config.verify.build_command,
            self.config.command_timeout(),
            self.config.exec_output_limit_bytes,
        );

        let is_task_text = user_input
            .trim_start()
            .to_lowercase()
            .starts_with("task:");
        if is_task_text {
            let snapshot = repo_snapshot(&git, &self.paths.repo_root, self.config.repo_snapshot_max_files);
            state.add_message(Role::System, format!("[repo_snapshot]\n{snapshot}"), Some("turn"));
        }
        state.add_message(Role::User, user_input, None);

        let baseline_dirty = git.dirty_outside_workspace();
        let deadline = Instant::now() + self.config.turn_timeout();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(attempt, "starting turn attempt");

            let deps = StageDeps {
                config: self.config,
                paths: self.paths,
                completions: self.completions,
                repo_research: self.repo_research,
                web_search: self.web_search,
                sandbox: &sandbox,
                workspace: &workspace,
                git: &git,
                critic_policy: self.critic_policy,
                deadline,
            };

            match self.run_stage_machine(state, &deps) {
                MachineResult::Finished => {}
                MachineResult::TimedOut => {
                    let summary = format!(
                        "TIMED OUT: turn exceeded {}s; prior state preserved.",
                        self.config.turn_timeout_secs
                    );
                    state.add_message(Role::System, format!("[turn] {summary}"), Some("turn"));
                    warn!("turn deadline exceeded");
                    return self.report(state, TurnOutcome::TimedOut, summary, attempt, Vec::new());
                }
            }

            let in_task = is_task_text || state.mode == Some(Mode::Task);
            if !in_task {
                break;
            }

            let failure = verifier.validate_turn(user_input, &baseline_dirty);
            if failure.is_empty() {
                break;
            }

            for reason in &failure.reasons {
                state.log(format!("[contract] {reason}"));
            }
            // Revert anything the attempt dirtied so retries start clean.
            verifier.revert_newly_dirty(&failure);

            if attempt >= self.config.max_contract_retries {
                state.add_message(
                    Role::System,
                    "[turn] Contract failed after max retries.",
                    Some("turn"),
                );
                let summary = format!(
                    "CONTRACT FAILURE after {attempt} attempt(s): {}",
                    failure.reasons.join("; ")
                );
                return self.report(
                    state,
                    TurnOutcome::ContractFailure,
                    summary,
                    attempt,
                    failure.reasons,
                );
            }

            let fix = verifier.corrective_instruction(&failure);
            state.fix_instructions = Some(fix.clone());
            state.reset_for_contract_retry();
            state.add_message(Role::System, fix, Some("turn"));
            info!(attempt, reasons = failure.reasons.len(), "contract retry");
        }

        let (outcome, summary) = self.successful_outcome(state);
        self.report(state, outcome, summary, attempt, Vec::new())
    }

    fn run_stage_machine(&self, state: &mut TaskState, deps: &StageDeps<'_>) -> MachineResult {
        let mut stage = Stage::IntentRouting;
        let mut steps: u32 = 0;

        loop {
            if deps.remaining().is_none() {
                return MachineResult::TimedOut;
            }
            steps += 1;
            if steps > deps.config.max_stage_steps && stage != Stage::Chatting {
                state.log(format!(
                    "[router] stage step limit ({}) reached -> chat",
                    deps.config.max_stage_steps
                ));
                stage = Stage::Chatting;
            }

            state.log(format!("[router] enter {}", stage.as_str()));
            if let Err(err) = run_stage(stage, state, deps) {
                // No stage may take the machine down; degrade to chat with
                // a diagnostic trace entry.
                state.log(format!(
                    "[router] stage {} error: {err:#} -> chat",
                    stage.as_str()
                ));
                warn!(stage = stage.as_str(), err = %err, "stage error, degrading to chat");
                if stage == Stage::Chatting {
                    state.add_message(
                        Role::Assistant,
                        "Something went wrong while composing a reply; see the trace for details.",
                        Some("chat"),
                    );
                    return MachineResult::Finished;
                }
                stage = Stage::Chatting;
                continue;
            }

            if stage == Stage::Chatting {
                return MachineResult::Finished;
            }

            let next = router::next_stage(stage, state);
            state.log(format!("[router] {} -> {}", stage.as_str(), next.as_str()));
            // The override is consumed by the transition that honored (or
            // refused) it; a stale hint must not leak into later routing.
            state.next_stage = None;
            stage = next;
        }
    }

    fn successful_outcome(&self, state: &TaskState) -> (TurnOutcome, String) {
        if state.mode == Some(Mode::Task) {
            let last_failed = state.last_exec_result().is_some_and(|r| !r.ok());
            if state.expected_failure && last_failed {
                return (
                    TurnOutcome::ExpectedFailure,
                    "SUCCESS (expected failure): the demonstrated failure occurred and the \
                     contract is satisfied."
                        .to_string(),
                );
            }
            return (
                TurnOutcome::Success,
                format!(
                    "SUCCESS: task resolved ({} patch(es) applied this session).",
                    state.applied_patches.len()
                ),
            );
        }
        (TurnOutcome::Success, "SUCCESS: chat turn resolved.".to_string())
    }

    fn report(
        &self,
        state: &mut TaskState,
        outcome: TurnOutcome,
        summary: String,
        attempts: u32,
        contract_failures: Vec<String>,
    ) -> TurnReport {
        let assistant_reply = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone());
        state.log(format!("[turn] {summary}"));
        TurnReport {
            outcome,
            summary,
            assistant_reply,
            attempts,
            contract_failures,
        }
    }
}

/// Truncated, filtered listing of project files used to ground task turns.
///
/// Prefers `git ls-files`; falls back to a bounded directory walk when the
/// project is not a git checkout.
fn repo_snapshot(git: &Git, root: &Path, max_files: usize) -> String {
    let mut files = git.ls_files();
    if files.is_empty() {
        walk_files(root, root, &mut files, max_files * 3);
    }

    const SKIP_PREFIXES: &[&str] = &[".venv/", "workspace/logs/", "workspace/.venv/", ".git/"];
    const SKIP_EXTS: &[&str] = &[".bin", ".sqlite3", ".db", ".pkl", ".onnx"];

    let mut filtered: Vec<String> = files
        .into_iter()
        .filter(|f| !SKIP_PREFIXES.iter().any(|p| f.starts_with(p)))
        .filter(|f| !f.contains("/__pycache__/"))
        .filter(|f| !SKIP_EXTS.iter().any(|e| f.ends_with(e)))
        .collect();
    filtered.sort();
    filtered.truncate(max_files);

    let mut out = String::from("Repo files (truncated):");
    for f in &filtered {
        out.push_str(&format!("\n- {f}"));
    }
    out
}

fn walk_files(root: &Path, dir: &Path, out: &mut Vec<String>, cap: usize) {
    if out.len() >= cap {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if out.len() >= cap {
            return;
        }
        let path = entry.path();
        if path.is_dir() {
            walk_files(root, &path, out, cap);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

/// Build the critic policy from configuration with the default
/// expected-failure predicate.
pub fn critic_policy_from(config: &OverseerConfig) -> CriticPolicy {
    CriticPolicy {
        max_loops: config.max_loops,
        max_web_searches: config.max_web_searches,
        web_search_enabled: config.web_search_enabled,
        stderr_tail_bytes: config.stderr_tail_bytes,
        expected_failure: crate::core::critic::default_expected_failure,
    }
}
