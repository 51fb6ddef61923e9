//! Run bookkeeping (`.fractal/run.json`): which root task the current run drives.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub root_id: String,
    /// Spec file the root task was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Load run state, or `None` when no run has been started.
pub fn load_run_state(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    Ok(Some(state))
}

pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), root_id = %state.root_id, "writing run state");
    write_json_atomic(path, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies write then load preserves all fields.
    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        let state = RunState {
            root_id: "task-0001".to_string(),
            spec_path: Some("spec.md".to_string()),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: None,
        };

        write_run_state(&path, &state).expect("write");
        assert_eq!(load_run_state(&path).expect("load"), Some(state));
    }

    #[test]
    fn missing_run_state_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            load_run_state(&temp.path().join("run.json")).expect("load"),
            None
        );
    }
}
