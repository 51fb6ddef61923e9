//! Executor abstraction for decision commands.
//!
//! The [`Executor`] trait decouples the planner, validator and escalator from
//! the process that answers them. Tests use capturing executors that write a
//! predetermined output without spawning anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::process::{CommandOutput, describe_status, run_command_with_timeout, tail};

/// Parameters for one decision-command invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the command.
    pub workdir: PathBuf,
    /// Prompt text, written to the command's stdin.
    pub prompt: String,
    /// JSON Schema the answer must satisfy.
    pub output_schema_path: PathBuf,
    /// Where the answer JSON ends up.
    pub output_path: PathBuf,
    /// Captured stdout/stderr.
    pub executor_log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over decision backends.
pub trait Executor {
    /// Run with the given request. Must leave a JSON document at `request.output_path`.
    fn exec(&self, request: &ExecRequest) -> Result<()>;
}

/// Runs a configured command with the prompt on stdin.
///
/// The command may write its answer to `$FRACTAL_OUTPUT_PATH` directly; otherwise
/// the answer is extracted from stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(program = %self.command.first().map(String::as_str).unwrap_or_default(), timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("decision command is empty"))?;
        if !request.output_schema_path.exists() {
            bail!(
                "missing output schema {}",
                request.output_schema_path.display()
            );
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        // A stale answer must not be mistaken for this run's.
        if request.output_path.exists() {
            fs::remove_file(&request.output_path)
                .with_context(|| format!("remove {}", request.output_path.display()))?;
        }
        info!(workdir = %request.workdir.display(), "running decision command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env("FRACTAL_OUTPUT_SCHEMA", &request.output_schema_path)
            .env("FRACTAL_OUTPUT_PATH", &request.output_path);
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {program}"))?;

        write_executor_log(
            &request.executor_log_path,
            &output,
            request.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "decision command timed out");
            bail!("{program} timed out after {:?}", request.timeout);
        }
        if !output.status.success() {
            warn!(status = %describe_status(&output.status), "decision command failed");
            bail!(
                "{program} exited with {}: {}",
                describe_status(&output.status),
                tail(&output.stderr_text(), 2_000)
            );
        }

        if request.output_path.exists() {
            debug!("decision command wrote its output file");
            return Ok(());
        }
        let stdout = output.stdout_text();
        let value = extract_json(&stdout).ok_or_else(|| {
            anyhow!(
                "{program} produced no JSON answer: {}",
                tail(&stdout, 2_000)
            )
        })?;
        write_json_atomic(&request.output_path, &value)
    }
}

/// Execute and load the answer as `T` after checking it against the request's schema.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn execute_and_load_json<E: Executor + ?Sized, T: DeserializeOwned>(
    executor: &E,
    request: &ExecRequest,
) -> Result<T> {
    executor.exec(request)?;
    if !request.output_path.exists() {
        bail!("missing executor output {}", request.output_path.display());
    }
    let contents = fs::read_to_string(&request.output_path)
        .with_context(|| format!("read decision output {}", request.output_path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", request.output_path.display()))?;
    let schema_raw = fs::read_to_string(&request.output_schema_path).with_context(|| {
        format!("read schema {}", request.output_schema_path.display())
    })?;
    let schema: Value = serde_json::from_str(&schema_raw).context("parse schema json")?;
    validate_schema(&value, &schema)?;
    serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", request.output_path.display()))
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
pub fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| anyhow!("invalid schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Write a bundled schema where commands can read it.
pub fn write_output_schema(path: &Path, contents: &str) -> Result<()> {
    write_atomic(path, contents.as_bytes())
        .with_context(|| format!("write schema {}", path.display()))
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n(\{.*?\})\s*```").expect("valid fenced-json regex")
});

/// Pull the answer object out of command output.
///
/// Accepts a bare object, an agent result envelope (`{"type":"result","result":"..."}`)
/// whose text holds the answer, a fenced ```json block, or the outermost `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(text) {
        return match unwrap_envelope(&object) {
            Some(inner) => extract_json(inner),
            None => Some(Value::Object(object)),
        };
    }
    // Streamed output: the last result event carries the answer.
    for line in text.lines().rev() {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(line.trim())
            && let Some(inner) = unwrap_envelope(&object)
        {
            return extract_json(inner);
        }
    }
    if let Some(caps) = FENCED_JSON.captures(text)
        && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&caps[1])
    {
        return Some(value);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn unwrap_envelope(object: &serde_json::Map<String, Value>) -> Option<&str> {
    let is_result = object.get("type").and_then(Value::as_str) == Some("result");
    if !is_result {
        return None;
    }
    object.get("result").and_then(Value::as_str)
}

fn write_executor_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    if output.stdout_truncated > 0 {
        buf.push_str(&format!("\n[stdout truncated {} bytes]", output.stdout_truncated));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    if output.stderr_truncated > 0 {
        buf.push_str(&format!("\n[stderr truncated {} bytes]", output.stderr_truncated));
    }
    if output.timed_out {
        buf.push_str("\n[timed out]\n");
    }
    if buf.len() > output_limit {
        let mut end = output_limit;
        while !buf.is_char_boundary(end) {
            end -= 1;
        }
        let dropped = buf.len() - end;
        buf.truncate(end);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }
    write_atomic(path, buf.as_bytes())
        .with_context(|| format!("write executor log {}", path.display()))
}
