//! JSON file store: `tasks/<id>.json` and `attempts/<id>/<seq>.json` under one directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::StateStore;
use crate::io::atomic::write_json_atomic;
use crate::task::{AttemptRecord, Task, TaskDraft, new_task_id, now_rfc3339};

#[derive(Debug, Clone)]
pub struct FileStore {
    tasks_dir: PathBuf,
    attempts_dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let store = Self {
            tasks_dir: dir.join("tasks"),
            attempts_dir: dir.join("attempts"),
        };
        for sub in [&store.tasks_dir, &store.attempts_dir] {
            fs::create_dir_all(sub).with_context(|| format!("create directory {}", sub.display()))?;
        }
        Ok(store)
    }

    pub fn task_path(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    fn attempt_dir(&self, task_id: &str) -> PathBuf {
        self.attempts_dir.join(task_id)
    }
}

impl StateStore for FileStore {
    #[instrument(skip_all, fields(title = %draft.title))]
    fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        let mut id = new_task_id();
        while self.task_path(&id).exists() {
            id = new_task_id();
        }
        let task = draft.into_task(id, &now_rfc3339());
        self.put_task(&task)?;
        debug!(task_id = %task.id, "task created");
        Ok(task)
    }

    fn put_task(&self, task: &Task) -> Result<()> {
        write_json_atomic(&self.task_path(&task.id), task)
            .with_context(|| format!("persist task {}", task.id))
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let path = self.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn load_tasks(&self) -> Result<Vec<Task>> {
        json_files(&self.tasks_dir)?
            .iter()
            .map(|path| read_json(path))
            .collect()
    }

    fn record_attempt(&self, record: &AttemptRecord) -> Result<()> {
        let dir = self.attempt_dir(&record.task_id);
        let seq = if dir.exists() {
            attempt_files(&dir)?.last().map_or(1, |(seq, _)| seq + 1)
        } else {
            1
        };
        let path = dir.join(format!("{seq:04}.json"));
        write_json_atomic(&path, record)
            .with_context(|| format!("persist attempt {} of {}", record.attempt, record.task_id))
    }

    fn attempts(&self, task_id: &str) -> Result<Vec<AttemptRecord>> {
        let dir = self.attempt_dir(task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        attempt_files(&dir)?
            .iter()
            .map(|(_, path)| read_json(path))
            .collect()
    }
}

/// Attempt files in `dir` with their sequence numbers, in numeric order.
fn attempt_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files: Vec<(u64, PathBuf)> = json_files(dir)?
        .into_iter()
        .filter_map(|path| {
            let seq = path.file_stem()?.to_str()?.parse().ok();
            if seq.is_none() {
                warn!(path = %path.display(), "ignoring unnumbered attempt file");
            }
            Some((seq?, path))
        })
        .collect();
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

/// `*.json` files in `dir`, sorted by name. Leftover `*.json.tmp` files are skipped.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read directory entry in {}", dir.display()))?
            .path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => files.push(path),
            Some("tmp") => warn!(path = %path.display(), "ignoring interrupted write"),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metrics::Metrics;
    use crate::io::atomic::tmp_path;
    use crate::task::TaskStatus;

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            parent_id: None,
            title: title.to_string(),
            description: format!("{title} description"),
            size: None,
            max_attempts: 3,
            depends_on: Vec::new(),
        }
    }

    fn attempt(task_id: &str, n: u32, passed: bool) -> AttemptRecord {
        AttemptRecord {
            task_id: task_id.to_string(),
            attempt: n,
            round: 0,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: "2026-01-01T00:01:00Z".to_string(),
            passed,
            error: (!passed).then(|| format!("failure {n}")),
            summary: String::new(),
            metrics: Metrics::default(),
            log_path: None,
        }
    }

    #[test]
    fn tasks_survive_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path()).expect("open");
        let mut task = store.create_task(draft("a")).expect("create");
        task.status = TaskStatus::InProgress;
        task.attempts = 1;
        store.put_task(&task).expect("put");

        let reopened = FileStore::open(temp.path()).expect("reopen");
        assert_eq!(reopened.get_task(&task.id).expect("get"), Some(task.clone()));
        assert_eq!(reopened.load_tasks().expect("load"), vec![task]);
        assert_eq!(reopened.get_task("task-missing").expect("get"), None);
    }

    /// Verifies a write torn at any byte offset leaves the previous record readable.
    ///
    /// Simulates a crash after the temp file was partially written but before the
    /// rename, for every prefix length of the new record.
    #[test]
    fn torn_write_keeps_previous_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path()).expect("open");
        let task = store.create_task(draft("a")).expect("create");

        let mut next = task.clone();
        next.status = TaskStatus::Completed;
        next.last_error = "x".repeat(64);
        let bytes = serde_json::to_vec_pretty(&next).expect("serialize");
        let tmp = tmp_path(&store.task_path(&task.id));

        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            fs::write(&tmp, &bytes[..cut]).expect("torn write");
            let reopened = FileStore::open(temp.path()).expect("reopen");
            assert_eq!(reopened.get_task(&task.id).expect("get"), Some(task.clone()));
            assert_eq!(reopened.load_tasks().expect("load").len(), 1);
        }

        store.put_task(&next).expect("put");
        assert_eq!(store.get_task(&task.id).expect("get"), Some(next));
        assert!(!tmp.exists());
    }

    #[test]
    fn attempts_are_kept_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path()).expect("open");
        assert!(store.attempts("task-1").expect("empty").is_empty());
        for n in 1..=3 {
            store
                .record_attempt(&attempt("task-1", n, n == 3))
                .expect("record");
        }
        let history = store.attempts("task-1").expect("history");
        let numbers: Vec<u32> = history.iter().map(|a| a.attempt).collect();
        assert_eq!(numbers, [1, 2, 3]);
        assert_eq!(history[0].error.as_deref(), Some("failure 1"));
        assert!(history[2].passed);
    }

    /// Verifies sequence numbers continue from the highest on disk, past the
    /// four-digit width, and a gap never causes an overwrite.
    #[test]
    fn attempt_sequence_is_numeric_and_survives_gaps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path()).expect("open");
        let dir = store.attempt_dir("task-1");
        fs::create_dir_all(&dir).expect("attempt dir");
        for (seq, n) in [(2, 1), (9_999, 2)] {
            let bytes = serde_json::to_vec(&attempt("task-1", n, false)).expect("serialize");
            fs::write(dir.join(format!("{seq:04}.json")), bytes).expect("seed");
        }

        store
            .record_attempt(&attempt("task-1", 3, true))
            .expect("record");
        assert!(dir.join("10000.json").is_file());
        let numbers: Vec<u32> = store
            .attempts("task-1")
            .expect("history")
            .iter()
            .map(|a| a.attempt)
            .collect();
        assert_eq!(numbers, [1, 2, 3]);
    }
}
