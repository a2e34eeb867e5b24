//! Executing stage: run the pending command batch through the sandbox.

use anyhow::Result;

use crate::core::critic::str_tail;
use crate::core::state::{Role, TaskState};
use crate::stages::StageDeps;

const STAGE: &str = "executor";
const STDOUT_TAIL: usize = 1200;
const STDERR_TAIL: usize = 2000;

pub fn run(state: &mut TaskState, deps: &StageDeps<'_>) -> Result<()> {
    state.log(format!("[{STAGE}] starting"));
    state.last_exec_results.clear();

    let Some(request) = state.exec_request.clone() else {
        state.log(format!("[{STAGE}] no exec request; nothing to run"));
        return Ok(());
    };
    if request.commands.is_empty() {
        state.log(format!("[{STAGE}] empty command list; nothing to run"));
        return Ok(());
    }

    let results = match deps.sandbox.run(&request, deps.remaining()) {
        Ok(results) => results,
        Err(err) => {
            // Fatal to the request, no partial effect: nothing ran.
            state.add_message(
                Role::System,
                format!("[executor] {err}"),
                Some(STAGE),
            );
            state.log(format!("[{STAGE}] {err}"));
            return Ok(());
        }
    };

    let mut lines = vec![
        format!("[executor] workdir={}", request.workdir),
        "[executor] commands:".to_string(),
    ];
    for r in &results {
        let status = if r.ok() {
            "OK".to_string()
        } else {
            format!("FAILED ({})", r.returncode)
        };
        lines.push(format!("- {} -> {status}", r.command));

        let out_tail = str_tail(r.stdout.trim(), STDOUT_TAIL).trim();
        let err_tail = str_tail(r.stderr.trim(), STDERR_TAIL).trim();
        if !out_tail.is_empty() {
            lines.push("  stdout (tail):".to_string());
            for line in out_tail.lines() {
                lines.push(format!("    {line}"));
            }
        }
        if !err_tail.is_empty() {
            lines.push("  stderr (tail):".to_string());
            for line in err_tail.lines() {
                lines.push(format!("    {line}"));
            }
        }
    }

    state.log(format!("[{STAGE}] ran {} commands", results.len()));
    state.exec_results.extend(results.iter().cloned());
    state.last_exec_results = results;
    state.add_message(Role::System, lines.join("\n"), Some(STAGE));
    Ok(())
}
