//! Deterministic contract checks over request text and patch artifacts.
//!
//! The verifier in [`crate::verify`] combines these with git state; the
//! functions here are pure so every rule is testable against literal
//! strings.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static WS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(workspace/[A-Za-z0-9._/-]+)").expect("valid regex"));

static DIFF_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^diff --git a/(.+?) b/(.+?)$").expect("valid regex")
});

/// Reasons a turn's output is unacceptable, plus the tracked paths that
/// became unexpectedly dirty. Failures accumulate rather than
/// short-circuiting so the corrective prompt is maximally informative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractFailure {
    pub reasons: Vec<String>,
    pub newly_dirty: Vec<String>,
}

impl ContractFailure {
    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Any explicit `workspace/...` path in the request text is a required
/// deliverable. Order-preserving, deduplicated, trailing periods stripped.
pub fn extract_required_workspace_paths(user_text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for m in WS_PATH_RE.find_iter(user_text) {
        let p = m.as_str().trim().trim_end_matches('.').to_string();
        if !p.is_empty() && seen.insert(p.clone()) {
            out.push(p);
        }
    }
    out
}

/// Whether the request implies a unified-diff/patch artifact.
pub fn requests_patch(user_text: &str) -> bool {
    let s = user_text.to_lowercase();
    s.contains("improvements.patch")
        || s.contains("unified diff")
        || s.contains("git style")
        || (s.contains("create workspace/") && s.contains(".patch"))
}

/// Whether the request implies tracked files must not change.
pub fn requests_no_tracked_changes(user_text: &str) -> bool {
    let s = user_text.to_lowercase();
    s.contains("do not modify") && (s.contains("tracked file") || s.contains("repo code"))
}

/// Files referenced by `diff --git` headers, `a/`-side, deduplicated.
pub fn patch_touched_files(patch_text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for caps in DIFF_FILE_RE.captures_iter(patch_text) {
        let a = caps[1].trim().to_string();
        if !a.is_empty() && a != "/dev/null" && seen.insert(a.clone()) {
            out.push(a);
        }
    }
    out
}

/// At least one added/removed line with actual content (not just headers).
pub fn patch_has_substantive_changes(patch_text: &str) -> bool {
    for line in patch_text.lines() {
        if line.starts_with("diff --git ")
            || line.starts_with("index ")
            || line.starts_with("--- ")
            || line.starts_with("+++ ")
            || line.starts_with("@@")
        {
            continue;
        }
        if (line.starts_with('+') || line.starts_with('-')) && !line[1..].trim().is_empty() {
            return true;
        }
    }
    false
}

/// Whether any `diff --git` header references a genuinely tracked path.
/// Rejects patches made of invented filenames.
pub fn patch_touches_tracked_files(patch_text: &str, tracked: &HashSet<String>) -> bool {
    for caps in DIFF_FILE_RE.captures_iter(patch_text) {
        let a = caps[1].trim();
        let b = caps[2].trim();
        if tracked.contains(a) || tracked.contains(b) {
            return true;
        }
    }
    false
}

/// Grounding checks for the explanation document accompanying a patch.
///
/// The document must exist (checked by the caller), contain a "root cause"
/// section, a verification-labeled section, at least one fenced code
/// excerpt, and name every file the patch touches.
pub fn explanation_grounding_failures(
    doc_rel: &str,
    doc_text: &str,
    touched_files: &[String],
) -> Vec<String> {
    let mut fails = Vec::new();
    let low = doc_text.to_lowercase();

    if !low.contains("root cause") {
        fails.push(format!("{doc_rel} must include a Root Cause section."));
    }
    if !low.contains("verif") {
        fails.push(format!("{doc_rel} must include Verification steps."));
    }
    if !doc_text.contains("```") {
        fails.push(format!(
            "{doc_rel} must include at least one fenced code block with an excerpt."
        ));
    }
    for fp in touched_files {
        if !doc_text.contains(fp.as_str()) {
            fails.push(format!("{doc_rel} must mention touched file path: {fp}"));
        }
    }
    fails
}
