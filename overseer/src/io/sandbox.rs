//! Sandboxed command executor.
//!
//! This module is the safety boundary between model-proposed commands and
//! the host. Commands are tokenized with shell-safe quoting rules and run
//! as plain subprocesses — never through a shell. Only a fixed allow-list
//! of binaries may execute, `git` is limited to read-only subcommands plus
//! `apply --check`, and a rejected command becomes a sentinel
//! [`ExecResult`] (returncode 126) instead of aborting the batch.

use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::core::state::{ExecRequest, ExecResult};
use crate::error::ConfigurationError;
use crate::io::process::run_command_with_timeout;

const ALLOWED_BINARIES: &[&str] = &["python", "python3", "pytest", "ruff", "mypy", "git"];

/// Shell operators blocked when they appear as standalone argv tokens.
/// Metacharacters inside a quoted argument (e.g. a `-c "..."` script) are
/// permitted because tokenization already isolated them.
const DISALLOWED_ARG_TOKENS: &[&str] = &["&&", "||", "|", ">", "<", "`"];

const REJECTED_STDERR: &str =
    "Blocked by safety filter (disallowed command or shell metacharacters).";

/// Executes command batches inside a confined working directory.
#[derive(Debug, Clone)]
pub struct Sandbox {
    project_root: PathBuf,
    command_timeout: Duration,
    output_limit_bytes: usize,
}

impl Sandbox {
    pub fn new(
        project_root: impl Into<PathBuf>,
        command_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            command_timeout,
            output_limit_bytes,
        }
    }

    /// Run commands sequentially, one [`ExecResult`] per executed command.
    ///
    /// `budget` optionally caps the total wall-clock time for the batch;
    /// commands that find the budget already spent report a timeout (124)
    /// without running. An unsafe `workdir` fails the whole request and
    /// runs nothing.
    #[instrument(skip_all, fields(workdir = %request.workdir, commands = request.commands.len()))]
    pub fn run(
        &self,
        request: &ExecRequest,
        budget: Option<Duration>,
    ) -> Result<Vec<ExecResult>, ConfigurationError> {
        let workdir = resolve_workdir(&self.project_root, &request.workdir)?;
        let deadline = budget.map(|b| Instant::now() + b);

        let mut results: Vec<ExecResult> = Vec::new();
        let mut prev: Option<(String, i32)> = None;

        for raw in &request.commands {
            let cmd = raw.trim();
            if cmd.is_empty() {
                continue;
            }

            if let Some(target) = diff_redirect_target(cmd) {
                let res = self.run_diff_redirect(cmd, &target, &workdir, deadline);
                prev = Some((cmd.to_string(), res.returncode));
                results.push(res);
                continue;
            }

            // Skip rule: `python3 X` right after a successful identical
            // `python X` re-proves nothing; don't rerun or record it.
            if let Some((prev_cmd, 0)) = prev.as_ref().map(|(c, rc)| (c.as_str(), *rc)) {
                if is_python_fallback(prev_cmd, cmd) {
                    debug!(command = cmd, "skipping python3 fallback after python success");
                    continue;
                }
            }

            let Some(argv) = safe_argv(cmd) else {
                warn!(command = cmd, "rejected by safety filter");
                let res = rejected(cmd);
                prev = Some((cmd.to_string(), res.returncode));
                results.push(res);
                continue;
            };

            let res = self.execute(cmd, &argv, &workdir, deadline);
            prev = Some((cmd.to_string(), res.returncode));
            results.push(res);
        }

        Ok(results)
    }

    fn timeout_for(&self, deadline: Option<Instant>) -> Option<Duration> {
        match deadline {
            None => Some(self.command_timeout),
            Some(deadline) => {
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .filter(|d| !d.is_zero())?;
                Some(self.command_timeout.min(remaining))
            }
        }
    }

    fn execute(
        &self,
        cmd: &str,
        argv: &[String],
        workdir: &Path,
        deadline: Option<Instant>,
    ) -> ExecResult {
        let Some(timeout) = self.timeout_for(deadline) else {
            return timed_out(cmd);
        };

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(workdir);

        match run_command_with_timeout(command, timeout, self.output_limit_bytes) {
            Ok(out) if out.timed_out => timed_out(cmd),
            Ok(out) => ExecResult {
                command: cmd.to_string(),
                returncode: out.status.code().unwrap_or(1),
                stdout: out.stdout_lossy(),
                stderr: out.stderr_lossy(),
            },
            Err(err) => {
                let not_found = err
                    .root_cause()
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
                if not_found {
                    ExecResult {
                        command: cmd.to_string(),
                        returncode: 127,
                        stdout: String::new(),
                        stderr: "Executable not found.".to_string(),
                    }
                } else {
                    ExecResult {
                        command: cmd.to_string(),
                        returncode: 1,
                        stdout: String::new(),
                        stderr: format!("Executor error: {err:#}"),
                    }
                }
            }
        }
    }

    /// Emulate `git diff --no-color > <path>` without granting real shell
    /// redirection: run the diff, write captured stdout to the target.
    fn run_diff_redirect(
        &self,
        cmd: &str,
        target: &str,
        workdir: &Path,
        deadline: Option<Instant>,
    ) -> ExecResult {
        let Some(target_abs) = resolve_in_root(&self.project_root, target) else {
            warn!(target, "diff redirect target escapes project root");
            return rejected(cmd);
        };
        let Some(timeout) = self.timeout_for(deadline) else {
            return timed_out(cmd);
        };

        let mut command = Command::new("git");
        command.args(["diff", "--no-color"]).current_dir(workdir);

        match run_command_with_timeout(command, timeout, self.output_limit_bytes) {
            Ok(out) if out.timed_out => timed_out(cmd),
            Ok(out) => {
                let returncode = out.status.code().unwrap_or(1);
                if returncode == 0 {
                    if let Some(parent) = target_abs.parent() {
                        if let Err(err) = std::fs::create_dir_all(parent) {
                            return write_failed(cmd, &err.to_string());
                        }
                    }
                    if let Err(err) = std::fs::write(&target_abs, &out.stdout) {
                        return write_failed(cmd, &err.to_string());
                    }
                }
                ExecResult {
                    command: cmd.to_string(),
                    returncode,
                    stdout: format!("Wrote git diff output to {target}"),
                    stderr: out.stderr_lossy(),
                }
            }
            Err(err) => write_failed(cmd, &format!("{err:#}")),
        }
    }
}

fn rejected(cmd: &str) -> ExecResult {
    ExecResult {
        command: cmd.to_string(),
        returncode: 126,
        stdout: String::new(),
        stderr: REJECTED_STDERR.to_string(),
    }
}

fn timed_out(cmd: &str) -> ExecResult {
    ExecResult {
        command: cmd.to_string(),
        returncode: 124,
        stdout: String::new(),
        stderr: "Command timed out.".to_string(),
    }
}

fn write_failed(cmd: &str, detail: &str) -> ExecResult {
    ExecResult {
        command: cmd.to_string(),
        returncode: 1,
        stdout: String::new(),
        stderr: format!("git diff redirect failed: {detail}"),
    }
}

/// Tokenize and vet a command. `None` means rejection: empty input,
/// unquotable text, a standalone shell operator, a binary off the
/// allow-list, or a disallowed git invocation.
fn safe_argv(cmd: &str) -> Option<Vec<String>> {
    let argv = shlex::split(cmd)?;
    if argv.is_empty() {
        return None;
    }
    if argv
        .iter()
        .any(|token| DISALLOWED_ARG_TOKENS.contains(&token.as_str()))
    {
        return None;
    }

    let exe = argv[0].as_str();
    if exe == "git" {
        return git_invocation_allowed(&argv).then_some(argv);
    }
    ALLOWED_BINARIES.contains(&exe).then_some(argv)
}

/// `git` is limited to `status`, `diff`, `ls-files`, and `apply --check`.
/// `apply` without `--check` would mutate the tree; `--reject` and
/// `--unsafe-paths` can write outside it.
fn git_invocation_allowed(argv: &[String]) -> bool {
    let Some(sub) = argv.get(1) else {
        return false;
    };
    match sub.as_str() {
        "status" | "diff" | "ls-files" => true,
        "apply" => {
            argv.iter().any(|a| a == "--check")
                && !argv.iter().any(|a| a == "--reject" || a == "--unsafe-paths")
        }
        _ => false,
    }
}

/// Whether a command would pass the sandbox policy. Used by the coder to
/// filter model-proposed commands before they ever reach the executor.
pub fn is_safe_command(cmd: &str) -> bool {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return false;
    }
    diff_redirect_target(trimmed).is_some() || safe_argv(trimmed).is_some()
}

/// Keep only commands that pass the sandbox policy, deduplicated.
pub fn filter_safe_commands(commands: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for cmd in commands {
        let cmd = cmd.trim();
        if !cmd.is_empty() && is_safe_command(cmd) && !out.iter().any(|c| c == cmd) {
            out.push(cmd.to_string());
        }
    }
    out
}

/// Detect the one permitted redirect shape: `git diff --no-color > <path>`.
/// Returns the target path when matched.
fn diff_redirect_target(cmd: &str) -> Option<String> {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    if parts.len() == 5 && parts[..4] == ["git", "diff", "--no-color", ">"] {
        return Some(parts[4].to_string());
    }
    None
}

/// Exact argv match except for the python/python3 interpreter name.
pub fn is_python_fallback(prev_cmd: &str, next_cmd: &str) -> bool {
    let (Some(a), Some(b)) = (shlex::split(prev_cmd), shlex::split(next_cmd)) else {
        return false;
    };
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a[0] == "python" && b[0] == "python3" && a[1..] == b[1..]
}

/// Resolve `workdir` inside the project root. Any path escaping the root
/// (absolute elsewhere, or via `..`) is a configuration error and nothing
/// runs.
fn resolve_workdir(root: &Path, workdir: &str) -> Result<PathBuf, ConfigurationError> {
    let resolved = resolve_in_root(root, workdir).ok_or_else(|| {
        ConfigurationError(format!("unsafe workdir escapes project root: {workdir:?}"))
    })?;
    if !resolved.is_dir() {
        return Err(ConfigurationError(format!(
            "workdir does not exist: {}",
            resolved.display()
        )));
    }
    Ok(resolved)
}

/// Lexically resolve `rel` against `root`, returning `None` if the result
/// would land outside `root`.
fn resolve_in_root(root: &Path, rel: &str) -> Option<PathBuf> {
    let candidate = Path::new(rel);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    normalized.starts_with(root).then_some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(root: &Path) -> Sandbox {
        Sandbox::new(root, Duration::from_secs(30), 100_000)
    }

    fn request(workdir: &str, commands: &[&str]) -> ExecRequest {
        ExecRequest {
            workdir: workdir.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn allow_list_verdicts() {
        assert!(is_safe_command("python hello.py"));
        assert!(is_safe_command("pytest -q"));
        assert!(is_safe_command("ruff check ."));
        assert!(is_safe_command("git status"));
        assert!(is_safe_command("git apply --check ../x.patch"));

        assert!(!is_safe_command("rm -rf /"));
        assert!(!is_safe_command("bash -c 'echo hi'"));
        assert!(!is_safe_command("git push origin main"));
        assert!(!is_safe_command("git apply ../x.patch"));
        assert!(!is_safe_command("git apply --check --reject ../x.patch"));
        assert!(!is_safe_command("git apply --check --unsafe-paths ../x.patch"));
        assert!(!is_safe_command("git"));
        assert!(!is_safe_command(""));
    }

    #[test]
    fn standalone_metacharacters_rejected_quoted_allowed() {
        assert!(!is_safe_command("python a.py && python b.py"));
        assert!(!is_safe_command("python a.py | git status"));
        assert!(!is_safe_command("python a.py > out.txt"));
        // Metacharacters inside a quoted -c script are isolated by
        // tokenization and therefore fine.
        assert!(is_safe_command("python -c \"print(1 > 0 and 2 | 1)\""));
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(!is_safe_command("python -c \"print(1)"));
    }

    #[test]
    fn python_fallback_detection() {
        assert!(is_python_fallback("python x.py --flag", "python3 x.py --flag"));
        assert!(!is_python_fallback("python x.py", "python3 y.py"));
        assert!(!is_python_fallback("python3 x.py", "python x.py"));
        assert!(!is_python_fallback("pytest", "python3"));
    }

    #[test]
    fn diff_redirect_shape() {
        assert_eq!(
            diff_redirect_target("git diff --no-color > workspace/IMPROVEMENTS.patch"),
            Some("workspace/IMPROVEMENTS.patch".to_string())
        );
        assert_eq!(
            diff_redirect_target("  git   diff --no-color  >  workspace/x.patch "),
            Some("workspace/x.patch".to_string())
        );
        assert_eq!(diff_redirect_target("git diff --no-color"), None);
        assert_eq!(diff_redirect_target("git diff > x.patch"), None);
    }

    #[test]
    fn filter_dedupes_and_drops_unsafe() {
        let input = vec![
            "python a.py".to_string(),
            "rm -rf /".to_string(),
            "python a.py".to_string(),
            "git status".to_string(),
        ];
        assert_eq!(
            filter_safe_commands(&input),
            vec!["python a.py".to_string(), "git status".to_string()]
        );
    }

    #[test]
    fn workdir_escape_fails_whole_request_and_runs_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sb = sandbox(temp.path());

        let err = sb
            .run(&request("../outside", &["git status"]), None)
            .expect_err("escaping workdir must fail");
        assert!(err.to_string().contains("workdir"));

        let err = sb
            .run(&request("/etc", &["git status"]), None)
            .expect_err("absolute outside workdir must fail");
        assert!(err.to_string().contains("workdir"));
    }

    #[test]
    fn rejected_commands_are_sentinels_and_batch_continues() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("workspace")).expect("mkdir");
        let sb = sandbox(temp.path());

        let results = sb
            .run(
                &request("workspace", &["rm -rf /", "curl http://example.com"]),
                None,
            )
            .expect("run");
        assert_eq!(results.len(), 2);
        for res in &results {
            assert_eq!(res.returncode, 126);
            assert!(!res.stderr.is_empty());
        }
    }

    #[test]
    fn empty_commands_are_skipped_without_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("workspace")).expect("mkdir");
        let sb = sandbox(temp.path());

        let results = sb.run(&request("workspace", &["", "   "]), None).expect("run");
        assert!(results.is_empty());
    }

    #[test]
    fn exhausted_budget_reports_timeout_without_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("workspace")).expect("mkdir");
        let sb = sandbox(temp.path());

        let results = sb
            .run(
                &request("workspace", &["git status"]),
                Some(Duration::from_secs(0)),
            )
            .expect("run");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].returncode, 124);
        assert_eq!(results[0].stderr, "Command timed out.");
    }

    #[test]
    fn redirect_target_escaping_root_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("workspace")).expect("mkdir");
        let sb = sandbox(temp.path());

        let results = sb
            .run(
                &request("workspace", &["git diff --no-color > ../../outside.patch"]),
                None,
            )
            .expect("run");
        assert_eq!(results[0].returncode, 126);
    }
}
