//! Command-level orchestration: start or resume a run, report status, feed human input.
//!
//! A run is identified by `.fractal/run.json`, which names the root task. `fractal run`
//! resumes that run when it exists and has not completed; otherwise it needs a spec
//! file to create a new root task from.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::agents::Strategies;
use crate::core::retry::resolve_human;
use crate::io::config::{BackendKind, FractalConfig, load_config};
use crate::io::init::FractalPaths;
use crate::io::run_state::{RunState, load_run_state, write_run_state};
use crate::io::store::{BdCli, FileStore, StateStore, TrackerStore};
use crate::io::worker::ProcessBackend;
use crate::orchestrator::{Orchestrator, RunStop, RunSummary, Settings};
use crate::task::now_rfc3339;

const TITLE_LIMIT: usize = 80;

/// CLI flags that take precedence over `.fractal/config.toml`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_depth: Option<u32>,
    pub max_attempts: Option<u32>,
    pub max_workers: Option<usize>,
    pub backend: Option<BackendKind>,
}

impl Overrides {
    pub fn apply(&self, config: &mut FractalConfig) {
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(backend) = self.backend {
            config.store.backend = backend;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Spec file for a new run. Ignored when an unfinished run exists.
    pub spec: Option<PathBuf>,
    pub overrides: Overrides,
}

/// Outcome of `fractal run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub root_id: String,
    pub resumed: bool,
    pub stop: RunStop,
    pub summary: RunSummary,
}

/// Load the config for `root` with `overrides` applied.
pub fn load_effective_config(paths: &FractalPaths, overrides: &Overrides) -> Result<FractalConfig> {
    let mut config = load_config(&paths.config_path)?;
    overrides.apply(&mut config);
    config
        .validate()
        .context("invalid configuration after command-line overrides")?;
    Ok(config)
}

/// Open the configured task store.
pub fn open_store(config: &FractalConfig, paths: &FractalPaths) -> Result<Box<dyn StateStore>> {
    match config.store.backend {
        BackendKind::File => {
            let dir = paths.resolve(&config.store.dir);
            Ok(Box::new(FileStore::open(&dir)?))
        }
        BackendKind::Tracker => {
            let client = BdCli::new(
                config.store.tracker_command.clone(),
                paths.root.clone(),
                Duration::from_secs(config.store.tracker_timeout_secs),
            );
            Ok(Box::new(TrackerStore::new(client)))
        }
    }
}

/// Start a new run from a spec file, or resume the unfinished one.
pub fn run_fractal(root: &Path, options: &RunOptions) -> Result<RunOutcome> {
    let paths = FractalPaths::new(root);
    let config = load_effective_config(&paths, &options.overrides)?;
    let store = open_store(&config, &paths)?;
    let backend = ProcessBackend::new(
        config.worker.command.clone(),
        &paths.root,
        paths.resolve(&config.worker.log_dir),
        config.pricing,
    )
    .with_git_artifacts(config.worker.collect_git_artifacts);
    let mut orchestrator = Orchestrator::new(
        store,
        Strategies::from_config(&config, &paths),
        Box::new(backend),
        Settings::from_config(&config),
    );

    let existing = load_run_state(&paths.run_state_path)?;
    let (mut state, resumed) = match existing {
        Some(state) if state.completed_at.is_none() => {
            if options.spec.is_some() {
                warn!(root_id = %state.root_id, "an unfinished run exists; resuming it and ignoring --spec");
            }
            info!(root_id = %state.root_id, "resuming run");
            orchestrator.recover(&state.root_id)?;
            (state, true)
        }
        _ => {
            let spec_path = options
                .spec
                .as_deref()
                .ok_or_else(|| {
                    anyhow!(
                        "no unfinished run in {}; pass --spec FILE to start one",
                        paths.fractal_dir.display()
                    )
                })?;
            let description = fs::read_to_string(spec_path)
                .with_context(|| format!("read spec {}", spec_path.display()))?;
            let root_id = orchestrator.create_root(&spec_title(&description), &description)?;
            let state = RunState {
                root_id,
                spec_path: Some(spec_path.display().to_string()),
                started_at: now_rfc3339(),
                completed_at: None,
            };
            write_run_state(&paths.run_state_path, &state)?;
            orchestrator.plan_root()?;
            (state, false)
        }
    };

    let stop = orchestrator.run(config.check_interval())?;
    if stop == RunStop::Complete {
        state.completed_at = Some(now_rfc3339());
        write_run_state(&paths.run_state_path, &state)?;
    }
    Ok(RunOutcome {
        root_id: state.root_id,
        resumed,
        stop,
        summary: orchestrator.summary(),
    })
}

/// Summarize the current (or last) run from the store.
pub fn run_status(root: &Path) -> Result<RunSummary> {
    let paths = FractalPaths::new(root);
    let config = load_effective_config(&paths, &Overrides::default())?;
    let state = load_run_state(&paths.run_state_path)?
        .ok_or_else(|| anyhow!("no run found in {}", paths.fractal_dir.display()))?;
    let store = open_store(&config, &paths)?;
    let tasks = store.load_tasks()?;
    Ok(RunSummary::from_tasks(&state.root_id, &tasks))
}

/// Record human input for a task in `needs_human`. The next `fractal run` picks it up.
pub fn resolve_task(root: &Path, task_id: &str, note: &str) -> Result<()> {
    let paths = FractalPaths::new(root);
    let config = load_effective_config(&paths, &Overrides::default())?;
    let store = open_store(&config, &paths)?;
    let mut task = store
        .get_task(task_id)?
        .ok_or_else(|| anyhow!("unknown task {task_id}"))?;
    resolve_human(&mut task, note)?;
    task.updated_at = now_rfc3339();
    store.put_task(&task)?;
    info!(task_id, "task re-queued with human input");
    Ok(())
}

/// Title for a root task: the first markdown heading, else the first non-empty line.
pub fn spec_title(spec: &str) -> String {
    let mut lines = spec.lines().map(str::trim).filter(|line| !line.is_empty());
    let first = lines.clone().next().unwrap_or("untitled");
    let title = lines
        .find_map(|line| line.strip_prefix('#').map(|h| h.trim_start_matches('#').trim()))
        .filter(|heading| !heading.is_empty())
        .unwrap_or(first);
    if title.chars().count() <= TITLE_LIMIT {
        return title.to_string();
    }
    let cut: String = title.chars().take(TITLE_LIMIT - 1).collect();
    format!("{}…", cut.trim_end())
}
