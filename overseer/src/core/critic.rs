//! Repair decisions after an execution round.
//!
//! Pure: the critic stage feeds in counters and the latest result, gets a
//! [`CriticDecision`] back, and applies it to state. The loop budget is
//! checked before anything else, so for any sequence of failures the
//! decision reaches `LoopLimit` within `max_loops` iterations.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::state::ExecResult;

/// Coarse classification of a failed command, used to pick a repair route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    MissingModule,
    CommandNotFound,
    Permission,
    TestAssertion,
    /// Rejected by the sandbox policy (sentinel returncode 126).
    PolicyBlock,
    Generic,
}

/// What the repair controller decided to do with the last round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriticDecision {
    /// Loop budget exhausted; finish regardless of outcome.
    LoopLimit,
    /// Nothing was executed this round; finish.
    NoResults,
    /// Execution succeeded; finish.
    Success,
    /// Execution failed but the goal says failure is the point; finish.
    ExpectedFailure,
    /// Failure looks researchable; burn one web search, then repair.
    ResearchWeb {
        query: String,
        fix_instructions: String,
    },
    /// Plain repair: send corrective instructions back to the coder.
    Repair { fix_instructions: String },
}

/// Tunables and the overridable expected-failure predicate.
///
/// Intent cannot be reliably inferred from free text, so the predicate is
/// a plain function pointer embedders can swap rather than a hardened
/// heuristic.
#[derive(Debug, Clone, Copy)]
pub struct CriticPolicy {
    pub max_loops: u32,
    pub max_web_searches: u32,
    pub web_search_enabled: bool,
    pub stderr_tail_bytes: usize,
    pub expected_failure: fn(&str) -> bool,
}

impl Default for CriticPolicy {
    fn default() -> Self {
        Self {
            max_loops: 3,
            max_web_searches: 1,
            web_search_enabled: false,
            stderr_tail_bytes: 2000,
            expected_failure: default_expected_failure,
        }
    }
}

/// Default expected-failure heuristic over the combined goal + user text.
///
/// "fix it"-style markers veto the classification: a task that asks to
/// repair a failure is not demonstrating one.
pub fn default_expected_failure(text: &str) -> bool {
    let t = text.to_lowercase();

    const FIX_MARKERS: &[&str] = &[
        "then fix",
        "fix it",
        "fix the",
        "until it succeeds",
        "rerun until",
        "and fix",
        "repair",
    ];
    if FIX_MARKERS.iter().any(|k| t.contains(k)) {
        return false;
    }

    const EXPECTED_MARKERS: &[&str] = &[
        "should fail",
        "expected to fail",
        "intentionally fail",
        "doesn't exist",
        "does not exist",
        "non-existent",
        "nonexistent",
        "module not found",
        "modulenotfounderror",
        "demonstrate error",
        "trigger an error",
    ];
    EXPECTED_MARKERS.iter().any(|k| t.contains(k))
}

pub fn classify_failure(result: &ExecResult) -> FailureClass {
    if result.returncode == 126 {
        return FailureClass::PolicyBlock;
    }
    let s = result.stderr.to_lowercase();
    if s.contains("modulenotfounderror") || s.contains("no module named") {
        return FailureClass::MissingModule;
    }
    if result.returncode == 127
        || s.contains("command not found")
        || s.contains("executable not found")
        || s.contains("no such file or directory")
    {
        return FailureClass::CommandNotFound;
    }
    if s.contains("permission denied") {
        return FailureClass::Permission;
    }
    if s.contains("assertionerror") || (s.contains("failed") && result.command.contains("pytest")) {
        return FailureClass::TestAssertion;
    }
    FailureClass::Generic
}

static MISSING_MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"No module named ['"]([^'"]+)['"]"#).expect("valid regex"));

fn extract_missing_module(stderr: &str) -> Option<&str> {
    MISSING_MODULE_RE
        .captures(stderr)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Whether external research is likely to help with this failure.
fn looks_like_needs_web(goal_text: &str, result: &ExecResult) -> bool {
    let g = goal_text.to_lowercase();
    const GOAL_MARKERS: &[&str] = &[
        "look up",
        "lookup",
        "search the web",
        "web search",
        "find documentation",
        "docs for",
        "how do i",
        "what is the correct",
    ];
    if GOAL_MARKERS.iter().any(|k| g.contains(k)) {
        return true;
    }

    match classify_failure(result) {
        FailureClass::MissingModule | FailureClass::CommandNotFound => true,
        // A policy block is deterministic: the sandbox will reject the same
        // command again, and no amount of web research changes that.
        FailureClass::PolicyBlock => false,
        _ => {
            let s = result.stderr.to_lowercase();
            s.contains("pip") && s.contains("error")
        }
    }
}

fn build_web_query(goal_text: &str, result: &ExecResult) -> String {
    if let Some(module) = extract_missing_module(&result.stderr) {
        return format!("python ModuleNotFoundError No module named {module} install");
    }
    let tail = str_tail(result.stderr.trim(), 300);
    if tail.is_empty() {
        goal_text.trim().to_string()
    } else {
        format!("{} {}", goal_text.trim(), tail)
    }
}

/// Last `n` bytes of `s`, aligned to a char boundary.
pub fn str_tail(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut start = s.len() - n;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn fix_instructions_for(result: &ExecResult, tail_bytes: usize, web: bool) -> String {
    let stderr = result.stderr.trim();
    let tail = if stderr.is_empty() {
        "(no stderr)"
    } else {
        str_tail(stderr, tail_bytes)
    };

    let mut msg = String::new();
    if web {
        msg.push_str(
            "Execution failed and may require external info.\n\
             Use the web research notes to apply the minimal fix needed so the command passes.\n\n",
        );
    } else if classify_failure(result) == FailureClass::PolicyBlock {
        msg.push_str(
            "The command was rejected by the sandbox policy and will be rejected again if \
             resubmitted unchanged.\n\
             Replace it with an allow-listed command (python/python3/pytest/ruff/mypy, or git \
             status/diff/ls-files/apply --check) with no shell operators.\n\n",
        );
    } else {
        msg.push_str("Execution failed. Apply the minimal fix needed so the command passes.\n\n");
    }
    msg.push_str(&format!(
        "Failed command: {}\nReturn code: {}\n\nStderr (tail):\n{}\n",
        result.command, result.returncode, tail
    ));
    msg
}

/// Inputs to one repair decision.
#[derive(Debug, Clone, Copy)]
pub struct CriticInput<'a> {
    pub goal_text: &'a str,
    pub last_result: Option<&'a ExecResult>,
    pub loop_count: u32,
    pub web_search_count: u32,
}

pub fn decide(policy: &CriticPolicy, input: &CriticInput<'_>) -> CriticDecision {
    if input.loop_count >= policy.max_loops {
        return CriticDecision::LoopLimit;
    }
    let Some(last) = input.last_result else {
        return CriticDecision::NoResults;
    };
    if last.ok() {
        return CriticDecision::Success;
    }
    if (policy.expected_failure)(input.goal_text) {
        return CriticDecision::ExpectedFailure;
    }

    let needs_web = policy.web_search_enabled && looks_like_needs_web(input.goal_text, last);
    if needs_web && input.web_search_count < policy.max_web_searches {
        return CriticDecision::ResearchWeb {
            query: build_web_query(input.goal_text, last),
            fix_instructions: fix_instructions_for(last, policy.stderr_tail_bytes, true),
        };
    }

    CriticDecision::Repair {
        fix_instructions: fix_instructions_for(last, policy.stderr_tail_bytes, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(command: &str, returncode: i32, stderr: &str) -> ExecResult {
        ExecResult {
            command: command.to_string(),
            returncode,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn loop_limit_wins_over_everything() {
        let policy = CriticPolicy::default();
        let result = failed("python x.py", 1, "boom");
        let input = CriticInput {
            goal_text: "should fail",
            last_result: Some(&result),
            loop_count: policy.max_loops,
            web_search_count: 0,
        };
        assert_eq!(decide(&policy, &input), CriticDecision::LoopLimit);
    }

    /// For any sequence of repeated failures the critic terminates within
    /// `max_loops` iterations: each Repair/ResearchWeb decision increments
    /// the loop counter, and the limit check precedes all other branches.
    #[test]
    fn repeated_failures_terminate_within_max_loops() {
        let policy = CriticPolicy {
            web_search_enabled: true,
            ..CriticPolicy::default()
        };
        let result = failed("python x.py", 1, "ModuleNotFoundError: No module named 'foo'");

        let mut loop_count = 0;
        let mut web_search_count = 0;
        let mut iterations = 0;
        loop {
            iterations += 1;
            let input = CriticInput {
                goal_text: "run the script",
                last_result: Some(&result),
                loop_count,
                web_search_count,
            };
            match decide(&policy, &input) {
                CriticDecision::LoopLimit => break,
                CriticDecision::ResearchWeb { .. } => {
                    loop_count += 1;
                    web_search_count += 1;
                }
                CriticDecision::Repair { .. } => loop_count += 1,
                other => panic!("unexpected decision: {other:?}"),
            }
            assert!(iterations <= policy.max_loops + 1, "critic failed to terminate");
        }
        assert_eq!(loop_count, policy.max_loops);
    }

    #[test]
    fn success_finishes() {
        let policy = CriticPolicy::default();
        let result = ExecResult {
            command: "python hello.py".to_string(),
            returncode: 0,
            stdout: "Hi\n".to_string(),
            stderr: String::new(),
        };
        let input = CriticInput {
            goal_text: "write hello.py that prints Hi",
            last_result: Some(&result),
            loop_count: 0,
            web_search_count: 0,
        };
        assert_eq!(decide(&policy, &input), CriticDecision::Success);
    }

    #[test]
    fn expected_failure_finishes_without_repair() {
        let policy = CriticPolicy::default();
        let result = failed("python missing.py", 1, "ModuleNotFoundError");
        let input = CriticInput {
            goal_text: "import a module that does not exist to demonstrate error",
            last_result: Some(&result),
            loop_count: 0,
            web_search_count: 0,
        };
        assert_eq!(decide(&policy, &input), CriticDecision::ExpectedFailure);
    }

    #[test]
    fn fix_marker_vetoes_expected_failure() {
        assert!(default_expected_failure("the import should fail"));
        assert!(!default_expected_failure("the import should fail, then fix it"));
    }

    #[test]
    fn missing_module_routes_to_web_within_budget() {
        let policy = CriticPolicy {
            web_search_enabled: true,
            ..CriticPolicy::default()
        };
        let result = failed("python x.py", 1, "No module named 'requests'");
        let input = CriticInput {
            goal_text: "run x.py",
            last_result: Some(&result),
            loop_count: 0,
            web_search_count: 0,
        };
        match decide(&policy, &input) {
            CriticDecision::ResearchWeb { query, .. } => {
                assert!(query.contains("requests"), "query: {query}");
            }
            other => panic!("expected web research, got {other:?}"),
        }

        // Budget exhausted: same failure falls back to plain repair.
        let input = CriticInput {
            web_search_count: policy.max_web_searches,
            ..input
        };
        assert!(matches!(decide(&policy, &input), CriticDecision::Repair { .. }));
    }

    #[test]
    fn policy_block_is_not_transient_and_not_retried_identically() {
        let policy = CriticPolicy {
            web_search_enabled: true,
            ..CriticPolicy::default()
        };
        let result = failed(
            "rm -rf /",
            126,
            "Blocked by safety filter (disallowed command or shell metacharacters).",
        );
        let input = CriticInput {
            goal_text: "clean everything up",
            last_result: Some(&result),
            loop_count: 0,
            web_search_count: 0,
        };
        match decide(&policy, &input) {
            CriticDecision::Repair { fix_instructions } => {
                assert!(fix_instructions.contains("rejected by the sandbox policy"));
                assert!(fix_instructions.contains("allow-listed"));
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn classifies_stderr_shapes() {
        assert_eq!(
            classify_failure(&failed("python x.py", 1, "No module named 'foo'")),
            FailureClass::MissingModule
        );
        assert_eq!(
            classify_failure(&failed("pytest", 127, "Executable not found.")),
            FailureClass::CommandNotFound
        );
        assert_eq!(
            classify_failure(&failed("python x.py", 1, "PermissionError: Permission denied")),
            FailureClass::Permission
        );
        assert_eq!(
            classify_failure(&failed("rm -rf /", 126, "Blocked by safety filter")),
            FailureClass::PolicyBlock
        );
        assert_eq!(
            classify_failure(&failed("python x.py", 1, "ValueError: bad input")),
            FailureClass::Generic
        );
    }

    #[test]
    fn str_tail_respects_char_boundaries() {
        let s = "héllo wörld";
        let tail = str_tail(s, 4);
        assert!(s.ends_with(tail));
        assert!(tail.len() <= 4);
    }
}
