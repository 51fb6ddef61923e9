//! Fractal task orchestrator.
//!
//! Splits a spec into a tree of tasks with a planner, runs the leaves as bounded
//! parallel agent workers, and retries or escalates failures. State lives under
//! `.fractal/` so an interrupted run can be resumed.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fractal::exit_codes;
use fractal::io::config::BackendKind;
use fractal::io::init::{InitOptions, init_fractal};
use fractal::io::platform::install_interrupt_handler;
use fractal::logging;
use fractal::orchestrator::RunStop;
use fractal::session::{Overrides, RunOptions, resolve_task, run_fractal, run_status};

#[derive(Parser)]
#[command(
    name = "fractal",
    version,
    about = "Recursive task orchestrator for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.fractal/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a run from a spec file, or resume the unfinished one.
    Run {
        /// Spec file describing the root task.
        #[arg(long)]
        spec: Option<PathBuf>,
        #[arg(long)]
        max_depth: Option<u32>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        max_workers: Option<usize>,
        /// Task store backend.
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,
    },
    /// Summarize the current run.
    Status,
    /// Hand a task waiting on a human back to the scheduler.
    Resolve {
        task_id: String,
        /// Guidance passed to the next attempt.
        #[arg(long)]
        note: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => {
            let paths = init_fractal(&root, &InitOptions { force })?;
            println!("initialized {}", paths.fractal_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            spec,
            max_depth,
            max_attempts,
            max_workers,
            backend,
        } => cmd_run(
            &root,
            RunOptions {
                spec,
                overrides: Overrides {
                    max_depth,
                    max_attempts,
                    max_workers,
                    backend,
                },
            },
        ),
        Command::Status => {
            let summary = run_status(&root)?;
            print!("{summary}");
            Ok(stop_code(summary.stop()))
        }
        Command::Resolve { task_id, note } => {
            resolve_task(&root, &task_id, &note)?;
            println!("{task_id} re-queued");
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(root: &Path, options: RunOptions) -> Result<i32> {
    install_interrupt_handler()?;
    let outcome = run_fractal(root, &options)?;
    print!("{}", outcome.summary);
    if outcome.stop == RunStop::Interrupted {
        println!("interrupted; run `fractal run` to resume");
    }
    Ok(stop_code(outcome.stop))
}

fn stop_code(stop: RunStop) -> i32 {
    match stop {
        RunStop::Complete => exit_codes::OK,
        RunStop::NeedsHuman => exit_codes::NEEDS_HUMAN,
        RunStop::Incomplete | RunStop::Interrupted => exit_codes::INCOMPLETE,
    }
}
