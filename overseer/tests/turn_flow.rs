//! End-to-end turn tests with a scripted completion service.
//!
//! The fake model routes on the system prompt it receives, so the tests
//! survive extra routing hops (research stages, contract retries) without
//! hand-counting completion calls.

use std::sync::Mutex;

use overseer::config::{ModelConfig, OverseerConfig};
use overseer::core::state::{Message, Mode, Role, TaskState};
use overseer::error::TransportError;
use overseer::llm::CompletionService;
use overseer::paths::ProjectPaths;
use overseer::research::Disabled;
use overseer::test_support::{FailingCompletion, TestRepo};
use overseer::turn::{critic_policy_from, TurnOutcome, TurnRunner};

/// Replies chosen by the stage that is asking, recognized from the system
/// prompt text.
struct StageScriptedCompletion {
    planner_json: String,
    coder_json: String,
    chat_text: String,
    calls: Mutex<Vec<String>>,
}

impl StageScriptedCompletion {
    fn new(planner_json: &str, coder_json: &str, chat_text: &str) -> Self {
        Self {
            planner_json: planner_json.to_string(),
            coder_json: coder_json.to_string(),
            chat_text: chat_text.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl CompletionService for StageScriptedCompletion {
    fn complete(
        &self,
        messages: &[Message],
        _model: &ModelConfig,
    ) -> Result<String, TransportError> {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let (stage, reply) = if system.contains("planning stage") {
            ("planner", self.planner_json.clone())
        } else if system.contains("coding stage") {
            ("coder", self.coder_json.clone())
        } else {
            ("chat", self.chat_text.clone())
        };
        self.calls.lock().expect("calls lock").push(stage.to_string());
        Ok(reply)
    }
}

fn test_config() -> OverseerConfig {
    OverseerConfig {
        // Keep the worktree build proof independent of a Python toolchain.
        verify: overseer::config::VerifyConfig {
            build_command: vec!["git".to_string(), "--version".to_string()],
        },
        ..OverseerConfig::default()
    }
}

fn run_one_turn(
    repo: &TestRepo,
    config: &OverseerConfig,
    completions: &dyn CompletionService,
    state: &mut TaskState,
    input: &str,
) -> overseer::turn::TurnReport {
    let paths = ProjectPaths::new(repo.root());
    paths.ensure_workspace().expect("workspace");
    let runner = TurnRunner {
        config,
        paths: &paths,
        completions,
        repo_research: &Disabled,
        web_search: &Disabled,
        critic_policy: critic_policy_from(config),
    };
    runner.run_turn(state, input)
}

const PLANNER_JSON: &str = r#"{"plan": [
    {"id": 1, "description": "Write the file into workspace/"},
    {"id": 2, "description": "Run a verification command"}
]}"#;

/// A goal that writes a workspace file and runs a safe command resolves
/// with SUCCESS and the file on disk.
#[test]
fn task_turn_writes_artifact_and_succeeds() {
    let repo = TestRepo::new().expect("repo");
    let config = test_config();

    let coder_json = r#"{
        "patches": [
            {"file_path": "hello.py", "content": "print('Hi')\n", "apply_mode": "overwrite"}
        ],
        "exec": {"workdir": "workspace", "commands": ["git status"]}
    }"#;
    let completions =
        StageScriptedCompletion::new(PLANNER_JSON, coder_json, "Wrote workspace/hello.py.");

    let mut state = TaskState::default();
    let report = run_one_turn(
        &repo,
        &config,
        &completions,
        &mut state,
        "task: create workspace/hello.py that prints Hi",
    );

    assert_eq!(report.outcome, TurnOutcome::Success, "summary: {}", report.summary);
    assert!(report.summary.contains("SUCCESS"));
    assert_eq!(report.attempts, 1);
    assert!(repo.root().join("workspace/hello.py").exists());
    assert_eq!(
        std::fs::read_to_string(repo.root().join("workspace/hello.py")).expect("read"),
        "print('Hi')\n"
    );

    assert_eq!(state.mode, Some(Mode::Task));
    assert_eq!(state.plan.len(), 2);
    let last = state.last_exec_results.last().expect("exec result");
    assert_eq!(last.returncode, 0);
    assert!(report.assistant_reply.is_some());

    let calls = completions.calls.lock().expect("calls");
    assert!(calls.contains(&"planner".to_string()));
    assert!(calls.contains(&"coder".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("chat"));
}

/// A patch task whose diff only references invented files retries with a
/// corrective instruction and then reports a contract failure, leaving
/// tracked files untouched.
#[test]
fn hallucinated_patch_fails_contract_after_retries() {
    let repo = TestRepo::new().expect("repo");
    repo.commit_file("src/app.py", "value = 1\n").expect("commit");
    let config = test_config();

    let bogus_patch = "diff --git a/made_up.py b/made_up.py\n\
                       --- a/made_up.py\n\
                       +++ b/made_up.py\n\
                       @@ -1 +1 @@\n\
                       -old\n\
                       +new\n";
    let coder_json = serde_json::json!({
        "patches": [
            {"file_path": "IMPROVEMENTS.patch", "content": bogus_patch, "apply_mode": "overwrite"},
            {
                "file_path": "IMPROVEMENTS.md",
                "content": "## Root cause\nx\n## Verification\n```\nmade_up.py\n```\nTouches made_up.py.\n",
                "apply_mode": "overwrite"
            }
        ],
        "exec": null
    })
    .to_string();
    let completions = StageScriptedCompletion::new(
        PLANNER_JSON,
        &coder_json,
        "Patch artifacts are in workspace/.",
    );

    let readme_before = std::fs::read(repo.root().join("README.md")).expect("read");
    let app_before = std::fs::read(repo.root().join("src/app.py")).expect("read");

    let mut state = TaskState::default();
    let report = run_one_turn(
        &repo,
        &config,
        &completions,
        &mut state,
        "task: do not modify tracked files or repo code; create workspace/IMPROVEMENTS.patch \
         (unified diff) and workspace/IMPROVEMENTS.md",
    );

    assert_eq!(report.outcome, TurnOutcome::ContractFailure, "summary: {}", report.summary);
    assert_eq!(report.attempts, config.max_contract_retries);
    assert!(
        report
            .contract_failures
            .iter()
            .any(|r| r.contains("does not touch any existing tracked files")),
        "failures: {:?}",
        report.contract_failures
    );

    // The corrective instruction was injected between attempts.
    assert!(state
        .messages
        .iter()
        .any(|m| m.content.contains("CONTRACT VIOLATION")));

    // Nothing outside workspace/ changed.
    assert_eq!(std::fs::read(repo.root().join("README.md")).expect("read"), readme_before);
    assert_eq!(std::fs::read(repo.root().join("src/app.py")).expect("read"), app_before);
    assert!(!repo.root().join("made_up.py").exists());
}

/// A goal that declares the failure intentional finishes as an expected
/// failure instead of looping on repairs.
#[test]
fn expected_failure_goal_finishes_without_repair_loop() {
    let repo = TestRepo::new().expect("repo");
    let config = test_config();

    let coder_json = r#"{
        "patches": [],
        "exec": {"workdir": "workspace", "commands": ["git apply --check missing.patch"]}
    }"#;
    let completions = StageScriptedCompletion::new(
        PLANNER_JSON,
        coder_json,
        "The check failed as expected.",
    );

    let mut state = TaskState::default();
    let report = run_one_turn(
        &repo,
        &config,
        &completions,
        &mut state,
        "task: run git apply --check against a patch file that does not exist; it should fail",
    );

    assert_eq!(
        report.outcome,
        TurnOutcome::ExpectedFailure,
        "summary: {}",
        report.summary
    );
    assert_eq!(state.loop_count, 0, "no repair iterations for expected failures");
    let last = state.last_exec_results.last().expect("exec result");
    assert_ne!(last.returncode, 0);
}

/// A plain chat turn with a dead model backend still resolves with a
/// deterministic reply.
#[test]
fn chat_turn_survives_transport_failure() {
    let repo = TestRepo::new().expect("repo");
    let config = test_config();

    let mut state = TaskState::default();
    let report = run_one_turn(&repo, &config, &FailingCompletion, &mut state, "hello there");

    assert_eq!(report.outcome, TurnOutcome::Success);
    let reply = report.assistant_reply.expect("reply");
    assert!(reply.contains("could not reach the model backend"), "reply: {reply}");
}

/// A destructive command reaches the executor, is rejected with the 126
/// sentinel, and the critic schedules a repair with different guidance —
/// never an identical retry.
#[test]
fn rejected_command_yields_sentinel_and_repair_routing() {
    use overseer::core::state::{ExecRequest, Stage};
    use overseer::io::git::Git;
    use overseer::io::sandbox::Sandbox;
    use overseer::io::workspace::Workspace;
    use overseer::stages::{run_stage, StageDeps};
    use std::time::{Duration, Instant};

    let repo = TestRepo::new().expect("repo");
    let config = test_config();
    let paths = ProjectPaths::new(repo.root());
    paths.ensure_workspace().expect("workspace");

    let git = Git::new(repo.root());
    let sandbox = Sandbox::new(repo.root(), Duration::from_secs(30), 100_000);
    let workspace = Workspace::new(&paths.workspace_dir);
    let completions = FailingCompletion;
    let deps = StageDeps {
        config: &config,
        paths: &paths,
        completions: &completions,
        repo_research: &Disabled,
        web_search: &Disabled,
        sandbox: &sandbox,
        workspace: &workspace,
        git: &git,
        critic_policy: critic_policy_from(&config),
        deadline: Instant::now() + Duration::from_secs(60),
    };

    let mut state = TaskState {
        mode: Some(Mode::Task),
        goal: Some("clean everything up".to_string()),
        exec_request: Some(ExecRequest {
            workdir: "workspace".to_string(),
            commands: vec!["rm -rf /".to_string()],
        }),
        ..TaskState::default()
    };
    state.add_message(Role::User, "task: clean everything up", None);

    run_stage(Stage::Executing, &mut state, &deps).expect("executor stage");
    let last = state.last_exec_results.last().expect("result");
    assert_eq!(last.returncode, 126);
    assert!(!last.stderr.is_empty());

    run_stage(Stage::Critiquing, &mut state, &deps).expect("critic stage");
    assert_eq!(state.next_stage, Some(Stage::Coding), "policy blocks repair via coder");
    assert_eq!(state.loop_count, 1);
    let fix = state.fix_instructions.expect("fix instructions");
    assert!(fix.contains("rejected by the sandbox policy"));
    assert!(fix.contains("rm -rf /"));
}
