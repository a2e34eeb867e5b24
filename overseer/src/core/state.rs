//! Shared task-state types.
//!
//! These types define stable contracts between stages. They are plain data:
//! serializable, deterministic, and free of I/O handles, so turn records can
//! be dumped as JSON and stages can be tested against literal states.

use serde::{Deserialize, Serialize};

/// High-level mode of the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Chat,
    Task,
}

/// States of the stage router. `Chatting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IntentRouting,
    Planning,
    Coding,
    Executing,
    Critiquing,
    Researching,
    ResearchingWeb,
    Chatting,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::IntentRouting => "intent_routing",
            Stage::Planning => "planning",
            Stage::Coding => "coding",
            Stage::Executing => "executing",
            Stage::Critiquing => "critiquing",
            Stage::Researching => "researching",
            Stage::ResearchingWeb => "researching_web",
            Stage::Chatting => "chatting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Skipped,
    Failed,
}

/// One step of the task plan, produced once per task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: u32,
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    Overwrite,
    Append,
}

/// A whole-file change destined for the workspace.
///
/// Keyed by `file_path`: later entries for the same path replace earlier
/// ones when a batch is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePatch {
    /// Path relative to `workspace/` (a leading `workspace/` is tolerated).
    pub file_path: String,
    pub content: String,
    pub apply_mode: ApplyMode,
}

/// An ordered command batch for the sandboxed executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Directory relative to the project root (e.g. `workspace`).
    pub workdir: String,
    pub commands: Vec<String>,
}

/// Outcome of one sandboxed command.
///
/// Sentinel return codes: 124 timeout, 126 rejected by policy, 127 missing
/// executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub command: String,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn ok(&self) -> bool {
        self.returncode == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A conversation entry, tagged with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub stage: Option<String>,
}

/// Aggregate state owned by the orchestrator for the duration of one turn.
///
/// Per-turn fields (plan, counters, research context, fix instructions) are
/// reset at turn start; `applied_patches` and `exec_results` persist across
/// turns as a running log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    pub turn_id: u32,
    pub mode: Option<Mode>,
    pub goal: Option<String>,

    pub plan: Vec<PlanStep>,

    pub pending_patches: Vec<CodePatch>,
    pub applied_patches: Vec<CodePatch>,

    pub research_query: Option<String>,
    pub research_notes: Option<String>,
    pub web_results: Option<String>,
    pub web_search_count: u32,

    pub exec_request: Option<ExecRequest>,
    /// Full history across repair loops and turns.
    pub exec_results: Vec<ExecResult>,
    /// Results from the most recent executor run only.
    pub last_exec_results: Vec<ExecResult>,

    /// Explicit routing override; wins over heuristics, cleared on use.
    pub next_stage: Option<Stage>,
    pub loop_count: u32,

    /// Corrective guidance consumed by the next repair attempt.
    pub fix_instructions: Option<String>,

    /// Set when the goal text indicates a failure is the point of the task.
    pub expected_failure: bool,

    pub messages: Vec<Message>,
    pub trace: Vec<String>,
}

impl TaskState {
    pub fn add_message(&mut self, role: Role, content: impl Into<String>, stage: Option<&str>) {
        self.messages.push(Message {
            role,
            content: content.into(),
            stage: stage.map(str::to_string),
        });
    }

    pub fn log(&mut self, entry: impl Into<String>) {
        self.trace.push(entry.into());
    }

    /// Most recent user message content, trimmed. Empty if none.
    pub fn latest_user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim())
            .unwrap_or("")
    }

    /// Result of the most recent execution, preferring the last-run list.
    pub fn last_exec_result(&self) -> Option<&ExecResult> {
        self.last_exec_results
            .last()
            .or_else(|| self.exec_results.last())
    }

    /// Reset per-turn fields at the start of a user turn.
    ///
    /// Applied patches and the full exec history persist; everything scoped
    /// to a single turn goes back to a known state.
    pub fn reset_turn_fields(&mut self) {
        self.plan.clear();
        self.pending_patches.clear();
        self.research_query = None;
        self.research_notes = None;
        self.web_results = None;
        self.web_search_count = 0;
        self.exec_request = None;
        self.last_exec_results.clear();
        self.next_stage = None;
        self.loop_count = 0;
        self.fix_instructions = None;
        self.expected_failure = false;
    }

    /// Reset for a contract-retry attempt within the same turn.
    ///
    /// Like [`Self::reset_turn_fields`], but preserves the corrective
    /// `fix_instructions` that drive the retry.
    pub fn reset_for_contract_retry(&mut self) {
        let fix = self.fix_instructions.take();
        self.reset_turn_fields();
        self.fix_instructions = fix;
    }
}
