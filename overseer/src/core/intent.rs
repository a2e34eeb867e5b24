//! Deterministic intent classification for the latest user message.
//!
//! The router consumes the classification; nothing here touches I/O or the
//! model. Explicit prefixes always win over keyword heuristics.

/// What the user's message asks the orchestrator to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Chat,
    /// Produce artifacts / run commands toward this goal.
    Task { goal: String },
    /// Query the repository index.
    Research { query: String },
    /// Query the web.
    ResearchWeb { query: String },
}

/// Users sometimes paste prompts like `you> task: ...`. Strip any leading
/// console prompt tokens so routing behaves consistently.
pub fn strip_console_prefix(text: &str) -> &str {
    let mut s = text.trim();
    while s
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("you>"))
    {
        s = s[4..].trim_start();
    }
    s
}

pub fn classify(raw: &str) -> Intent {
    let text = strip_console_prefix(raw);
    let lower = text.to_lowercase();

    if let Some(query) = explicit_query(text, &["web:", "search:"]) {
        return Intent::ResearchWeb { query };
    }
    if lower.starts_with("research:") || lower.starts_with("reindex:") {
        // Keep the prefix: the research stage parses reindex vs research.
        return Intent::Research {
            query: text.to_string(),
        };
    }
    if lower.starts_with("task:") || lower.starts_with("task ") {
        return Intent::Task {
            goal: extract_task_goal(text),
        };
    }
    if looks_like_task(&lower) {
        return Intent::Task {
            goal: text.to_string(),
        };
    }
    Intent::Chat
}

fn explicit_query(text: &str, prefixes: &[&str]) -> Option<String> {
    let lower = text.to_lowercase();
    for prefix in prefixes {
        if lower.starts_with(prefix) {
            return Some(text[prefix.len()..].trim().to_string());
        }
    }
    None
}

fn extract_task_goal(text: &str) -> String {
    let goal = text[5..].trim();
    if goal.is_empty() {
        "(unspecified task goal)".to_string()
    } else {
        goal.to_string()
    }
}

fn looks_like_task(lower: &str) -> bool {
    if matches!(lower, "hi" | "hey" | "hello" | "yo" | "sup") {
        return false;
    }

    const VERB_KEYWORDS: &[&str] = &[
        "write a ",
        "write an ",
        "write the ",
        "write some code",
        "write code",
        "write a script",
        "build a ",
        "build an ",
        "build the ",
        "create a ",
        "create an ",
        "generate code",
        "implement ",
        "make a script",
        "make a program",
        "fix this code",
        "fix the code",
        "refactor this",
    ];
    const OBJECT_KEYWORDS: &[&str] = &[
        "script",
        "program",
        "function",
        "module",
        "tool",
        "bot",
        "cli",
        "python script",
        "python program",
    ];

    if VERB_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return true;
    }
    lower.contains("python") && OBJECT_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Heuristic for routing plain questions about the repo to the research
/// stage: the message must name the codebase and ask about its contents.
pub fn looks_like_repo_research(raw: &str) -> bool {
    let t = strip_console_prefix(raw).to_lowercase();
    if t.starts_with("research:") || t.starts_with("reindex:") {
        return true;
    }
    const SUBJECTS: &[&str] = &[
        "workspace",
        "repo",
        "repository",
        "project files",
        "codebase",
        "in this folder",
    ];
    const QUESTIONS: &[&str] = &[
        "what files",
        "list files",
        "show files",
        "summarize files",
        "what does this do",
        "explain this project",
    ];
    SUBJECTS.iter().any(|s| t.contains(s)) && QUESTIONS.iter().any(|q| t.contains(q))
}

/// Goals that likely need external facts before planning ("look up",
/// version questions, docs). Conservative on purpose: pointless web hits
/// cost a bounded budget.
pub fn needs_web_research(goal: &str) -> bool {
    let t = goal.trim().to_lowercase();
    if t.is_empty() {
        return false;
    }
    const TRIGGERS: &[&str] = &[
        "look up",
        "lookup",
        "search for",
        "search the web",
        "find documentation",
        "docs",
        "documentation",
        "api",
        "query parameter",
        "how do i",
        "how to",
        "what is the correct",
        "latest",
        "current",
        "version",
        "release notes",
    ];
    TRIGGERS.iter().any(|k| t.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_console_prompt_tokens() {
        assert_eq!(strip_console_prefix("you> you> hello"), "hello");
        assert_eq!(strip_console_prefix("  task: x"), "task: x");
    }

    #[test]
    fn explicit_task_prefix_wins() {
        let intent = classify("task: write hello.py that prints Hi");
        assert_eq!(
            intent,
            Intent::Task {
                goal: "write hello.py that prints Hi".to_string()
            }
        );
    }

    #[test]
    fn empty_task_goal_gets_placeholder() {
        assert_eq!(
            classify("task: "),
            Intent::Task {
                goal: "(unspecified task goal)".to_string()
            }
        );
    }

    #[test]
    fn greetings_are_chat() {
        assert_eq!(classify("hello"), Intent::Chat);
        assert_eq!(classify("sup"), Intent::Chat);
    }

    #[test]
    fn heuristic_detects_code_requests() {
        assert!(matches!(
            classify("write a script that sorts numbers"),
            Intent::Task { .. }
        ));
        assert!(matches!(
            classify("please implement the parser in python"),
            Intent::Task { .. }
        ));
        assert_eq!(classify("what's the weather like"), Intent::Chat);
    }

    #[test]
    fn web_and_research_prefixes() {
        assert_eq!(
            classify("web: rust wait-timeout crate"),
            Intent::ResearchWeb {
                query: "rust wait-timeout crate".to_string()
            }
        );
        assert!(matches!(
            classify("research: how is retry handled"),
            Intent::Research { .. }
        ));
    }

    #[test]
    fn repo_research_requires_subject_and_question() {
        assert!(looks_like_repo_research("what files are in this repo?"));
        assert!(!looks_like_repo_research("what files do I need for taxes"));
        assert!(!looks_like_repo_research("tell me about the repo"));
    }

    #[test]
    fn web_research_triggers() {
        assert!(needs_web_research("look up the latest pytest version"));
        assert!(!needs_web_research("write hello.py that prints Hi"));
    }
}
