//! Overseer CLI: a thin console over the turn runner.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use overseer::config::{load_config, OverseerConfig};
use overseer::core::state::{Mode, TaskState};
use overseer::exit_codes;
use overseer::llm::ClientPool;
use overseer::paths::ProjectPaths;
use overseer::research::Disabled;
use overseer::turn::{critic_policy_from, TurnOutcome, TurnReport, TurnRunner};

#[derive(Parser)]
#[command(
    name = "overseer",
    version,
    about = "Autonomous task-execution orchestrator"
)]
struct Cli {
    /// Project root the orchestrator operates on.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to the TOML configuration (missing file means defaults).
    #[arg(long, default_value = "overseer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Interactive console; one turn per input line.
    Repl,
    /// Resolve a single turn and exit.
    Turn {
        /// The user message (e.g. "task: write hello.py that prints Hi").
        text: Vec<String>,
    },
    /// Validate the configuration file and exit.
    CheckConfig,
}

fn main() {
    overseer::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        CliCommand::CheckConfig => {
            println!("configuration ok");
            Ok(exit_codes::OK)
        }
        CliCommand::Turn { text } => {
            let input = text.join(" ");
            if input.trim().is_empty() {
                anyhow::bail!("empty turn text");
            }
            let (mut state, runner_parts) = build_runner_parts(&cli.root, &config)?;
            let runner = runner_parts.runner(&config);
            let report = runner.run_turn(&mut state, &input);
            print_report(&state, &report);
            Ok(outcome_code(report.outcome))
        }
        CliCommand::Repl => {
            let (mut state, runner_parts) = build_runner_parts(&cli.root, &config)?;
            let runner = runner_parts.runner(&config);

            println!("overseer interactive console. Type 'exit' to quit.");
            println!("Tips:");
            println!("  - Normal message: chat mode");
            println!(
                "  - 'task: build me X': planner, coder (writes into workspace/), executor, chat.\n"
            );

            let stdin = std::io::stdin();
            loop {
                print!("you> ");
                std::io::stdout().flush().ok();
                let mut line = String::new();
                if stdin.lock().read_line(&mut line).context("read input")? == 0 {
                    println!("\nBye.");
                    return Ok(exit_codes::OK);
                }
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if matches!(input.to_lowercase().as_str(), "exit" | "quit") {
                    println!("Bye.");
                    return Ok(exit_codes::OK);
                }

                let report = runner.run_turn(&mut state, input);
                print_report(&state, &report);
            }
        }
    }
}

/// Owns the long-lived dependencies so the runner can borrow them.
struct RunnerParts {
    paths: ProjectPaths,
    pool: ClientPool,
    repo_research: Disabled,
    web_search: Disabled,
}

impl RunnerParts {
    fn runner<'a>(&'a self, config: &'a OverseerConfig) -> TurnRunner<'a> {
        TurnRunner {
            config,
            paths: &self.paths,
            completions: &self.pool,
            repo_research: &self.repo_research,
            web_search: &self.web_search,
            critic_policy: critic_policy_from(config),
        }
    }
}

fn build_runner_parts(
    root: &PathBuf,
    config: &OverseerConfig,
) -> Result<(TaskState, RunnerParts)> {
    let root = std::fs::canonicalize(root)
        .with_context(|| format!("resolve project root {}", root.display()))?;
    let paths = ProjectPaths::new(root);
    paths.ensure_workspace()?;
    let pool = ClientPool::new(config).context("build completion client pool")?;
    Ok((
        TaskState::default(),
        RunnerParts {
            paths,
            pool,
            repo_research: Disabled,
            web_search: Disabled,
        },
    ))
}

fn outcome_code(outcome: TurnOutcome) -> i32 {
    match outcome {
        TurnOutcome::Success | TurnOutcome::ExpectedFailure => exit_codes::OK,
        TurnOutcome::ContractFailure => exit_codes::CONTRACT_FAILED,
        TurnOutcome::TimedOut => exit_codes::TIMED_OUT,
    }
}

fn print_report(state: &TaskState, report: &TurnReport) {
    match &report.assistant_reply {
        Some(reply) => println!("overseer> {reply}\n"),
        None => println!("overseer> [no assistant reply produced]\n"),
    }

    if state.mode == Some(Mode::Task) {
        if !state.plan.is_empty() {
            println!("  [plan]");
            for step in &state.plan {
                println!("   - ({}) [{:?}] {}", step.id, step.status, step.description);
            }
        }
        if !state.last_exec_results.is_empty() {
            println!("  [exec results]");
            for r in &state.last_exec_results {
                let status = if r.ok() {
                    "OK".to_string()
                } else {
                    format!("FAILED ({})", r.returncode)
                };
                println!("   - {} -> {status}", r.command);
            }
        }
    }

    println!("  [outcome] {}", report.summary);
    if !report.contract_failures.is_empty() {
        println!("  [contract]");
        for reason in &report.contract_failures {
            println!("   - {reason}");
        }
    }
    println!();
}
