//! Worker processes: one supervised agent run per leaf attempt.
//!
//! The orchestrator only sees the [`WorkerBackend`] / [`WorkerHandle`] traits.
//! [`ProcessBackend`] is the production implementation: it starts the agent
//! command in its own process group, streams stdout and stderr into a per-attempt
//! log file, and turns the exit into a [`WorkerOutcome`].

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use super::git::Git;
use super::platform;
use super::process::{describe_status, tail};
use crate::core::agent_output::parse_agent_output;
use crate::core::metrics::{Metrics, Pricing, TokenUsage};
use crate::core::types::WorkerResult;
use crate::task::now_rfc3339;

/// Everything a backend needs to start one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub task_id: String,
    pub title: String,
    /// 1-based attempt number within the current round.
    pub attempt: u32,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Bookkeeping for one attempt. Owned by the pool and dropped once its metrics
/// have been folded into the task.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub task_id: String,
    pub attempt: u32,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: String,
    pub started: Instant,
    pub log_path: Option<PathBuf>,
    /// Usage for this attempt only.
    pub usage: TokenUsage,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The agent ran to completion and reported a result (which may be `success == false`).
    Finished(WorkerResult),
    /// The attempt could not produce a result: crash, non-zero exit, cancellation.
    Errored { error: String, metrics: Metrics },
}

impl WorkerOutcome {
    pub fn metrics(&self) -> Metrics {
        match self {
            Self::Finished(result) => result.metrics,
            Self::Errored { metrics, .. } => *metrics,
        }
    }

    /// Neither an execution error nor a `success == false` result.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Finished(result) if result.success)
    }
}

/// A running attempt.
pub trait WorkerHandle {
    fn pid(&self) -> Option<u32>;

    fn log_path(&self) -> Option<&Path>;

    /// Non-blocking: `Ok(None)` while the attempt is still running.
    fn try_finish(&mut self) -> Result<Option<WorkerOutcome>>;

    /// Stop the attempt (graceful signal, then a forced kill after `grace`).
    /// The outcome is always `Errored` with `reason`.
    fn cancel(&mut self, grace: Duration, reason: &str) -> Result<WorkerOutcome>;
}

/// Starts attempts.
pub trait WorkerBackend {
    fn spawn(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>>;
}

/// Runs the configured agent command as a child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    command: Vec<String>,
    workdir: PathBuf,
    log_dir: PathBuf,
    pricing: Pricing,
    collect_git_artifacts: bool,
}

impl ProcessBackend {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        pricing: Pricing,
    ) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            log_dir: log_dir.into(),
            pricing,
            collect_git_artifacts: true,
        }
    }

    pub fn with_git_artifacts(mut self, enabled: bool) -> Self {
        self.collect_git_artifacts = enabled;
        self
    }

    pub fn log_path(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.log_dir.join(format!("{task_id}.attempt-{attempt}.log"))
    }
}

impl WorkerBackend for ProcessBackend {
    #[instrument(skip_all, fields(task_id = %request.task_id, attempt = request.attempt))]
    fn spawn(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;

        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("create log dir {}", self.log_dir.display()))?;
        let log_path = self.log_path(&request.task_id, request.attempt);
        let log = File::create(&log_path)
            .with_context(|| format!("create worker log {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("clone worker log {}", log_path.display()))?;

        let git = self
            .collect_git_artifacts
            .then(|| Git::new(&self.workdir))
            .filter(Git::is_repo);
        let git_base = match &git {
            Some(git) => git.head_sha().unwrap_or_else(|err| {
                warn!(err = %err, "could not read HEAD before attempt");
                None
            }),
            None => None,
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("FRACTAL_TASK_ID", &request.task_id)
            .env("FRACTAL_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn worker {program:?}"))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin was not piped"))?;
        let prompt = request.prompt.clone().into_bytes();
        let stdin_thread = thread::spawn(move || {
            let mut stdin = stdin;
            if let Err(err) = stdin.write_all(&prompt) {
                debug!(err = %err, "worker closed stdin early");
            }
        });

        info!(pid, log = %log_path.display(), "worker started");
        Ok(Box::new(ProcessHandle {
            child,
            task_id: request.task_id.clone(),
            log_path,
            started: Instant::now(),
            stdin_thread: Some(stdin_thread),
            git,
            git_base,
            pricing: self.pricing,
            reaped: false,
        }))
    }
}

struct ProcessHandle {
    child: Child,
    task_id: String,
    log_path: PathBuf,
    started: Instant,
    stdin_thread: Option<thread::JoinHandle<()>>,
    git: Option<Git>,
    git_base: Option<String>,
    pricing: Pricing,
    /// Set once the child's exit status has been collected.
    reaped: bool,
}

impl ProcessHandle {
    fn finish(&mut self, status: ExitStatus, cancel_reason: Option<&str>) -> WorkerOutcome {
        self.reaped = true;
        if let Some(handle) = self.stdin_thread.take()
            && handle.join().is_err()
        {
            warn!(task_id = %self.task_id, "stdin writer thread panicked");
        }

        let log = match fs::read(&self.log_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                warn!(err = %err, log = %self.log_path.display(), "could not read worker log");
                String::new()
            }
        };
        let parsed = parse_agent_output(&log);
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let metrics = self.pricing.metrics(parsed.usage, duration_ms);

        if let Some(reason) = cancel_reason {
            return WorkerOutcome::Errored {
                error: reason.to_string(),
                metrics,
            };
        }
        if !status.success() {
            let detail = parsed
                .result
                .unwrap_or_else(|| tail(&log, 500).to_string());
            return WorkerOutcome::Errored {
                error: format!("worker exited with {}: {detail}", describe_status(&status)),
                metrics,
            };
        }

        let summary = parsed
            .result
            .unwrap_or_else(|| tail(&log, 2_000).to_string());
        let success = parsed.is_error != Some(true);
        let artifacts = match &self.git {
            Some(git) if success => git
                .collect_artifacts(self.git_base.as_deref(), &summary)
                .unwrap_or_else(|err| {
                    warn!(err = %err, "could not collect git artifacts");
                    Default::default()
                }),
            _ => Default::default(),
        };
        WorkerOutcome::Finished(WorkerResult {
            success,
            summary,
            metrics,
            artifacts,
        })
    }
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn log_path(&self) -> Option<&Path> {
        Some(&self.log_path)
    }

    fn try_finish(&mut self) -> Result<Option<WorkerOutcome>> {
        let status = self
            .child
            .try_wait()
            .with_context(|| format!("poll worker for {}", self.task_id))?;
        Ok(status.map(|status| {
            debug!(task_id = %self.task_id, exit_code = ?status.code(), "worker exited");
            self.finish(status, None)
        }))
    }

    #[instrument(skip_all, fields(task_id = %self.task_id, grace_secs = grace.as_secs()))]
    fn cancel(&mut self, grace: Duration, reason: &str) -> Result<WorkerOutcome> {
        let pid = self.child.id();
        if let Err(err) = platform::terminate_group(pid) {
            warn!(pid, err = %err, "SIGTERM failed");
        }
        let status = match self
            .child
            .wait_timeout(grace)
            .context("wait for cancelled worker")?
        {
            Some(status) => status,
            None => {
                warn!(pid, "worker ignored SIGTERM, killing");
                if let Err(err) = platform::kill_group(pid) {
                    warn!(pid, err = %err, "SIGKILL to process group failed");
                }
                // Covers platforms without process groups.
                let _ = self.child.kill();
                self.child.wait().context("wait for killed worker")?
            }
        };
        info!(pid, exit_code = ?status.code(), "worker cancelled");
        Ok(self.finish(status, Some(reason)))
    }
}

impl Drop for ProcessHandle {
    /// A handle dropped while its worker is still running kills the whole group.
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let pid = self.child.id();
        warn!(task_id = %self.task_id, pid, "dropping unsupervised worker, killing");
        if let Err(err) = platform::kill_group(pid) {
            warn!(pid, err = %err, "SIGKILL to process group failed");
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Fresh record for an attempt that was just spawned.
pub fn new_record(request: &WorkerRequest, handle: &dyn WorkerHandle) -> WorkerRecord {
    WorkerRecord {
        task_id: request.task_id.clone(),
        attempt: request.attempt,
        pid: handle.pid(),
        status: WorkerStatus::Running,
        started_at: now_rfc3339(),
        started: Instant::now(),
        log_path: handle.log_path().map(Path::to_path_buf),
        usage: TokenUsage::default(),
    }
}
