//! Contract verification.
//!
//! The sole safety-critical check standing between a hallucinated result
//! and a reported success. Runs independently of whatever the generation
//! stages claim: required files must exist on disk, tracked files must not
//! have changed when the request forbids it, and a requested patch must
//! prove itself against a disposable worktree before the turn may report
//! success. All checks are evaluated; failures accumulate so the
//! corrective prompt is maximally informative.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::contract::{
    explanation_grounding_failures, extract_required_workspace_paths, patch_has_substantive_changes,
    patch_touched_files, patch_touches_tracked_files, requests_no_tracked_changes, requests_patch,
    ContractFailure,
};
use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;
use crate::paths::ProjectPaths;

/// Sample size of allowed patch targets quoted in corrective instructions.
const TRACKED_SAMPLE: usize = 60;

/// Verifies a turn's output against the contract implied by the request.
pub struct Verifier<'a> {
    paths: &'a ProjectPaths,
    git: &'a Git,
    /// Command proving the patched tree still builds, run in the worktree.
    build_command: &'a [String],
    build_timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a> Verifier<'a> {
    pub fn new(
        paths: &'a ProjectPaths,
        git: &'a Git,
        build_command: &'a [String],
        build_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            paths,
            git,
            build_command,
            build_timeout,
            output_limit_bytes,
        }
    }

    /// Evaluate every contract check for this turn.
    ///
    /// `baseline_dirty` is the pre-turn set of dirty tracked paths outside
    /// the workspace; only paths newly dirtied this turn count against the
    /// no-tracked-changes rule. Never mutates the live working tree.
    #[instrument(skip_all)]
    pub fn validate_turn(
        &self,
        user_text: &str,
        baseline_dirty: &BTreeSet<String>,
    ) -> ContractFailure {
        let mut failure = ContractFailure::default();

        let required = extract_required_workspace_paths(user_text);
        for rel in &required {
            let abs = self.paths.abs_repo_path(rel);
            if !abs.exists() {
                failure.reasons.push(format!("Missing required file: {rel}"));
            }
        }

        if requests_no_tracked_changes(user_text) {
            let after = self.git.dirty_outside_workspace();
            let newly: Vec<String> = after.difference(baseline_dirty).cloned().collect();
            if !newly.is_empty() {
                failure.reasons.push(format!(
                    "Modified tracked files unexpectedly (new this turn):\n{}",
                    newly.join("\n")
                ));
                failure.newly_dirty = newly;
            }
        }

        if requests_patch(user_text) {
            self.check_patch_contract(&required, &mut failure);
        }

        if failure.is_empty() {
            debug!("contract satisfied");
        } else {
            warn!(reasons = failure.reasons.len(), "contract violated");
        }
        failure
    }

    fn check_patch_contract(&self, required: &[String], failure: &mut ContractFailure) {
        let patch_rel = required
            .iter()
            .find(|p| p.to_lowercase().ends_with(".patch"))
            .cloned()
            .unwrap_or_else(|| "workspace/IMPROVEMENTS.patch".to_string());
        let patch_abs = self.paths.abs_repo_path(&patch_rel);

        if !patch_abs.exists() {
            failure
                .reasons
                .push(format!("Patch file not created: {patch_rel}"));
            return;
        }

        let patch_text = std::fs::read_to_string(&patch_abs).unwrap_or_default();
        let tracked: HashSet<String> = self.git.ls_files().into_iter().collect();

        if !tracked.is_empty() && !patch_touches_tracked_files(&patch_text, &tracked) {
            failure.reasons.push(format!(
                "Patch does not touch any existing tracked files (likely hallucinated / \
                 irrelevant). Regenerate {patch_rel} to modify real files from git ls-files."
            ));
        }

        if !patch_has_substantive_changes(&patch_text) {
            failure.reasons.push(
                "Patch contains no substantive (+/-) changes (looks whitespace-only or \
                 metadata-only)."
                    .to_string(),
            );
        }

        match self.check_patch_in_clean_worktree(&patch_abs) {
            Ok(()) => {}
            Err(detail) => {
                failure
                    .reasons
                    .push(format!("Patch failed clean-worktree verification:\n{detail}"));
            }
        }

        let touched = patch_touched_files(&patch_text);
        let md_rel = required
            .iter()
            .find(|p| p.to_lowercase().ends_with(".md"))
            .cloned()
            .unwrap_or_else(|| "workspace/IMPROVEMENTS.md".to_string());
        let md_abs = self.paths.abs_repo_path(&md_rel);
        if !md_abs.exists() {
            failure
                .reasons
                .push(format!("Missing required file: {md_rel}"));
        } else {
            let md_text = std::fs::read_to_string(&md_abs).unwrap_or_default();
            failure
                .reasons
                .extend(explanation_grounding_failures(&md_rel, &md_text, &touched));
        }
    }

    /// Prove the patch applies cleanly to HEAD and the resulting tree
    /// builds — inside a disposable worktree created solely for this check
    /// and removed afterwards unconditionally. The live checkout is never
    /// mutated.
    fn check_patch_in_clean_worktree(&self, patch_abs: &Path) -> Result<(), String> {
        if self.paths.ensure_workspace().is_err() {
            return Err("workspace directory could not be created".to_string());
        }

        let base = self.unique_check_dir();
        let wt_dir = base.join("wt"); // must NOT exist before `git worktree add`
        if let Err(err) = std::fs::create_dir_all(&base) {
            return Err(format!("create verification dir: {err}"));
        }

        let result = self.run_worktree_proof(&wt_dir, patch_abs);

        self.git.worktree_remove(&wt_dir);
        if let Err(err) = std::fs::remove_dir_all(&base) {
            debug!(err = %err, "verification dir cleanup failed");
        }

        result
    }

    fn run_worktree_proof(&self, wt_dir: &Path, patch_abs: &Path) -> Result<(), String> {
        self.git
            .worktree_add(wt_dir)
            .map_err(|err| format!("{err:#}"))?;

        let check = self.git.apply_check_in(wt_dir, patch_abs);
        if !check.ok() {
            return Err(format!("git apply --check failed:\n{}", check.detail()));
        }

        let apply = self.git.apply_in(wt_dir, patch_abs);
        if !apply.ok() {
            return Err(format!("git apply failed in worktree:\n{}", apply.detail()));
        }

        let mut cmd = Command::new(&self.build_command[0]);
        cmd.args(&self.build_command[1..]).current_dir(wt_dir);
        match run_command_with_timeout(cmd, self.build_timeout, self.output_limit_bytes) {
            Ok(out) if out.timed_out => Err("build command timed out in worktree".to_string()),
            Ok(out) if !out.status.success() => {
                let detail = if out.stderr.is_empty() {
                    out.stdout_lossy()
                } else {
                    out.stderr_lossy()
                };
                Err(format!("build command failed in worktree:\n{detail}"))
            }
            Ok(_) => Ok(()),
            Err(err) => Err(format!("build command failed to start: {err:#}")),
        }
    }

    fn unique_check_dir(&self) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        self.paths
            .workspace_dir
            .join(format!(".applycheck-{}-{nanos}", std::process::id()))
    }

    /// Best-effort restore of paths dirtied by a failed attempt.
    pub fn revert_newly_dirty(&self, failure: &ContractFailure) {
        if failure.newly_dirty.is_empty() {
            return;
        }
        let files: BTreeSet<String> = failure.newly_dirty.iter().cloned().collect();
        self.git.restore_paths(&files);
    }

    /// Corrective instruction for the next attempt: every failure, plus a
    /// sample of real patch targets when the patch itself was the problem.
    pub fn corrective_instruction(&self, failure: &ContractFailure) -> String {
        let mut msg = String::from(
            "CONTRACT VIOLATION.\n\
             You MUST fix the failures below, using ONLY workspace/ outputs.\n\
             Do NOT claim success until all are satisfied.\n\nFailures:\n",
        );
        for reason in &failure.reasons {
            msg.push_str(&format!("- {reason}\n"));
        }

        let patch_related = failure
            .reasons
            .iter()
            .any(|r| r.contains("Patch does not touch") || r.contains("Patch failed"));
        if patch_related {
            let sample: Vec<String> = self
                .git
                .ls_files()
                .into_iter()
                .filter(|p| !p.starts_with("workspace/") && !p.starts_with(".venv/"))
                .filter(|p| {
                    !p.ends_with(".bin") && !p.ends_with(".sqlite3") && !p.ends_with(".db")
                })
                .take(TRACKED_SAMPLE)
                .collect();
            if !sample.is_empty() {
                msg.push_str("\nAllowed patch targets (git ls-files, filtered):\n");
                for p in sample {
                    msg.push_str(&format!("- {p}\n"));
                }
            }
        }

        msg.push_str(
            "\nNow regenerate the required artifacts.\n\
             - If a unified diff was requested, it MUST modify existing git-tracked files.\n\
             - The patch must apply cleanly to HEAD (git apply --check) and build cleanly.\n\
             - The explanation document must cite the exact files changed and include code \
             excerpts.\n",
        );
        msg
    }
}
