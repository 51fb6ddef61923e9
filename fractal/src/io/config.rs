//! Orchestrator configuration stored at `.fractal/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;
use crate::core::metrics::Pricing;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FractalConfig {
    /// Deepest allowed split (root is depth 0).
    pub max_depth: u32,
    /// Attempts per leaf per round before escalation.
    pub max_attempts: u32,
    /// Concurrent worker processes.
    pub max_workers: usize,
    /// Fixer rounds a task may receive before it is handed to a human.
    pub max_escalations: u32,
    /// Control loop interval.
    pub check_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL when cancelling a worker.
    pub cancel_grace_secs: u64,
    /// Cancel attempts that run longer than this. Unset means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_secs: Option<u64>,
    /// Warn once about attempts running longer than this.
    pub stall_warning_secs: u64,

    pub worker: WorkerConfig,
    pub planner: DecisionConfig,
    pub validator: DecisionConfig,
    pub escalator: DecisionConfig,
    pub store: StoreConfig,
    pub pricing: Pricing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Agent command; the prompt is written to its stdin.
    pub command: Vec<String>,
    /// Attempt logs, relative to the project root.
    pub log_dir: String,
    /// Collect changed files and HEAD from git after each attempt.
    pub collect_git_artifacts: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            log_dir: ".fractal/logs".to_string(),
            collect_git_artifacts: true,
        }
    }
}

/// External decision command. An empty command selects the built-in strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecisionConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

impl DecisionConfig {
    pub fn is_builtin(&self) -> bool {
        self.command.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One JSON file per task under the state directory.
    File,
    /// Issue tracker CLI (`bd`); the task record lives in the issue notes.
    Tracker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// File backend directory, relative to the project root.
    pub dir: String,
    /// Tracker CLI executable.
    pub tracker_command: String,
    pub tracker_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::File,
            dir: ".fractal/state".to_string(),
            tracker_command: "bd".to_string(),
            tracker_timeout_secs: 60,
        }
    }
}

impl Default for FractalConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_attempts: 3,
            max_workers: 3,
            max_escalations: 1,
            check_interval_ms: 2_000,
            cancel_grace_secs: 5,
            attempt_timeout_secs: None,
            stall_warning_secs: 30 * 60,
            worker: WorkerConfig::default(),
            planner: DecisionConfig::default(),
            validator: DecisionConfig::default(),
            escalator: DecisionConfig::default(),
            store: StoreConfig::default(),
            pricing: Pricing::default(),
        }
    }
}

impl FractalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.check_interval_ms == 0 {
            return Err(anyhow!("check_interval_ms must be > 0"));
        }
        if self.attempt_timeout_secs == Some(0) {
            return Err(anyhow!("attempt_timeout_secs must be > 0 when set"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        for (name, decision) in [
            ("planner", &self.planner),
            ("validator", &self.validator),
            ("escalator", &self.escalator),
        ] {
            if !decision.is_builtin() && decision.command[0].trim().is_empty() {
                return Err(anyhow!("{name}.command must not start with an empty program"));
            }
            if decision.timeout_secs == 0 {
                return Err(anyhow!("{name}.timeout_secs must be > 0"));
            }
        }
        if self.store.backend == BackendKind::Tracker && self.store.tracker_command.trim().is_empty()
        {
            return Err(anyhow!("store.tracker_command must be set for the tracker backend"));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FractalConfig::default()`.
pub fn load_config(path: &Path) -> Result<FractalConfig> {
    if !path.exists() {
        let cfg = FractalConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FractalConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &FractalConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
