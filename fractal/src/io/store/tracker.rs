//! Issue tracker backend.
//!
//! The tracker only offers status and free-text notes per issue, and no
//! multi-field transaction. Each issue's notes therefore carry the whole record
//! (task plus attempt history) as one JSON document, so every mutation is a
//! single notes write. The tracker status is a projection written afterwards for
//! humans browsing the tracker; the notes are authoritative.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::StateStore;
use crate::io::process::run_command_with_timeout;
use crate::task::{AttemptRecord, Task, TaskDraft, TaskStatus, now_rfc3339};

const RECORD_VERSION: u32 = 1;
const OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// An issue as seen through the tracker client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub notes: String,
}

/// The narrow surface the store needs from a tracker.
pub trait TrackerClient {
    /// Create an issue and return its id.
    fn create(&self, title: &str, description: &str) -> Result<String>;

    fn show(&self, id: &str) -> Result<Option<TrackerIssue>>;

    fn list(&self) -> Result<Vec<TrackerIssue>>;

    fn set_notes(&self, id: &str, notes: &str) -> Result<()>;

    fn set_status(&self, id: &str, status: &str) -> Result<()>;
}

/// Tracker status shown for a task status.
pub fn tracker_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "open",
        TaskStatus::InProgress | TaskStatus::Escalated => "in_progress",
        TaskStatus::Completed => "closed",
        TaskStatus::Failed | TaskStatus::NeedsHuman => "blocked",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackerRecord {
    fractal: u32,
    task: Task,
    #[serde(default)]
    attempts: Vec<AttemptRecord>,
}

impl TrackerRecord {
    fn parse(notes: &str) -> Option<Self> {
        let record: Self = serde_json::from_str(notes.trim()).ok()?;
        (record.fractal == RECORD_VERSION).then_some(record)
    }
}

pub struct TrackerStore<C: TrackerClient> {
    client: C,
}

impl<C: TrackerClient> TrackerStore<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn read_record(&self, id: &str) -> Result<Option<(TrackerIssue, TrackerRecord)>> {
        let Some(issue) = self.client.show(id)? else {
            return Ok(None);
        };
        match TrackerRecord::parse(&issue.notes) {
            Some(record) => Ok(Some((issue, record))),
            None => Ok(None),
        }
    }

    fn write_record(&self, record: &TrackerRecord, current_status: Option<&str>) -> Result<()> {
        let notes = serde_json::to_string(record).context("serialize tracker record")?;
        self.client
            .set_notes(&record.task.id, &notes)
            .with_context(|| format!("write notes for {}", record.task.id))?;
        let status = tracker_status(record.task.status);
        if current_status != Some(status) {
            self.client
                .set_status(&record.task.id, status)
                .with_context(|| format!("set tracker status for {}", record.task.id))?;
        }
        Ok(())
    }
}

impl<C: TrackerClient> StateStore for TrackerStore<C> {
    #[instrument(skip_all, fields(title = %draft.title))]
    fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        let id = self
            .client
            .create(&draft.title, &draft.description)
            .context("create tracker issue")?;
        let task = draft.into_task(id, &now_rfc3339());
        let record = TrackerRecord {
            fractal: RECORD_VERSION,
            task: task.clone(),
            attempts: Vec::new(),
        };
        self.write_record(&record, None)?;
        debug!(task_id = %task.id, "tracker issue created");
        Ok(task)
    }

    fn put_task(&self, task: &Task) -> Result<()> {
        let (status, attempts) = match self.read_record(&task.id)? {
            Some((issue, record)) => (Some(issue.status), record.attempts),
            None => (None, Vec::new()),
        };
        let record = TrackerRecord {
            fractal: RECORD_VERSION,
            task: task.clone(),
            attempts,
        };
        self.write_record(&record, status.as_deref())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.read_record(id)?.map(|(_, record)| record.task))
    }

    fn load_tasks(&self) -> Result<Vec<Task>> {
        let issues = self.client.list().context("list tracker issues")?;
        Ok(issues
            .iter()
            .filter_map(|issue| TrackerRecord::parse(&issue.notes))
            .map(|record| record.task)
            .collect())
    }

    fn record_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        let Some((issue, mut record)) = self.read_record(&attempt.task_id)? else {
            bail!("no tracker record for {}", attempt.task_id);
        };
        record.attempts.push(attempt.clone());
        self.write_record(&record, Some(&issue.status))
    }

    fn attempts(&self, task_id: &str) -> Result<Vec<AttemptRecord>> {
        Ok(self
            .read_record(task_id)?
            .map(|(_, record)| record.attempts)
            .unwrap_or_default())
    }
}

static CREATED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)Created issue:\s*([A-Za-z0-9][A-Za-z0-9._-]*)").expect("valid created-id regex")
});

/// `bd` (beads) command-line client.
#[derive(Debug, Clone)]
pub struct BdCli {
    program: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl BdCli {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.into(),
            timeout,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let label = format!("{} {}", self.program, args.first().copied().unwrap_or_default());
        let mut cmd = Command::new(&self.program);
        cmd.args(args).current_dir(&self.workdir);
        let out = run_command_with_timeout(cmd, None, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {label}"))?;
        out.ensure_success(&label)?;
        Ok(out.stdout_text())
    }
}

impl TrackerClient for BdCli {
    fn create(&self, title: &str, description: &str) -> Result<String> {
        let stdout = self.run(&["create", title, "--description", description, "--json"])?;
        parse_created_id(&stdout)
    }

    fn show(&self, id: &str) -> Result<Option<TrackerIssue>> {
        let label = format!("{} show", self.program);
        let mut cmd = Command::new(&self.program);
        cmd.args(["show", id, "--json"]).current_dir(&self.workdir);
        let out = run_command_with_timeout(cmd, None, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {label}"))?;
        if !out.timed_out && !out.status.success() && out.stderr_text().contains("not found") {
            return Ok(None);
        }
        out.ensure_success(&label)?;
        parse_issues(&out.stdout_text()).map(|issues| issues.into_iter().next())
    }

    fn list(&self) -> Result<Vec<TrackerIssue>> {
        let stdout = self.run(&["list", "--json"])?;
        parse_issues(&stdout)
    }

    fn set_notes(&self, id: &str, notes: &str) -> Result<()> {
        self.run(&["update", id, "--notes", notes]).map(|_| ())
    }

    fn set_status(&self, id: &str, status: &str) -> Result<()> {
        let flag = format!("--status={status}");
        self.run(&["update", id, &flag]).map(|_| ())
    }
}

/// Issue id from `bd create` output: a JSON object with `id`, or the human
/// "Created issue: <id>" line.
fn parse_created_id(stdout: &str) -> Result<String> {
    if let Ok(value) = serde_json::from_str::<Value>(stdout.trim())
        && let Some(id) = value.get("id").and_then(Value::as_str)
    {
        return Ok(id.to_string());
    }
    CREATED_ID
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("could not find issue id in tracker output: {}", stdout.trim()))
}

/// `--json` output is either one issue object or an array of them.
fn parse_issues(stdout: &str) -> Result<Vec<TrackerIssue>> {
    let value: Value = serde_json::from_str(stdout.trim()).context("parse tracker json")?;
    let issues = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    let mut parsed = Vec::with_capacity(issues.len());
    for issue in issues {
        match serde_json::from_value::<TrackerIssue>(issue) {
            Ok(issue) => parsed.push(issue),
            Err(err) => warn!(err = %err, "skipping malformed tracker issue"),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTracker;

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            parent_id: None,
            title: title.to_string(),
            description: "d".to_string(),
            size: None,
            max_attempts: 3,
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn parses_created_id_from_json_or_text() {
        assert_eq!(
            parse_created_id(r#"{"id":"bd-a1b2","title":"x"}"#).expect("json"),
            "bd-a1b2"
        );
        assert_eq!(
            parse_created_id("✓ Created issue: nova-42\n  Title: x\n").expect("text"),
            "nova-42"
        );
        assert!(parse_created_id("nothing useful").is_err());
    }

    #[test]
    fn parses_single_and_listed_issues() {
        let one = parse_issues(r#"{"id":"a","status":"open","notes":""}"#).expect("one");
        assert_eq!(one.len(), 1);
        let many = parse_issues(r#"[{"id":"a"},{"id":"b","status":"closed"},{"bogus":1}]"#)
            .expect("many");
        let ids: Vec<&str> = many.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn task_round_trips_through_notes() {
        let store = TrackerStore::new(FakeTracker::default());
        let mut task = store.create_task(draft("a")).expect("create");
        assert_eq!(store.client().issue(&task.id).status, "open");

        task.status = TaskStatus::NeedsHuman;
        task.last_error = "stuck".to_string();
        store.put_task(&task).expect("put");

        assert_eq!(store.get_task(&task.id).expect("get"), Some(task.clone()));
        assert_eq!(store.client().issue(&task.id).status, "blocked");
        assert_eq!(store.load_tasks().expect("load"), vec![task]);
    }

    #[test]
    fn attempts_share_the_record_and_survive_task_updates() {
        let store = TrackerStore::new(FakeTracker::default());
        let task = store.create_task(draft("a")).expect("create");
        let attempt = AttemptRecord {
            task_id: task.id.clone(),
            attempt: 1,
            round: 0,
            started_at: "s".into(),
            finished_at: "f".into(),
            passed: false,
            error: Some("boom".into()),
            summary: String::new(),
            metrics: Default::default(),
            log_path: None,
        };
        store.record_attempt(&attempt).expect("record");
        store.put_task(&task).expect("put");
        assert_eq!(store.attempts(&task.id).expect("attempts"), vec![attempt]);
    }

    #[test]
    fn foreign_issues_are_ignored() {
        let tracker = FakeTracker::default();
        let id = tracker.create("hand-written", "").expect("create");
        tracker.set_notes(&id, "remember the milk").expect("notes");
        let store = TrackerStore::new(tracker);
        assert!(store.load_tasks().expect("load").is_empty());
        assert_eq!(store.get_task(&id).expect("get"), None);
    }
}
