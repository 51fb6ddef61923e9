//! Short-lived child processes: decision commands, the tracker CLI, git.
//!
//! Long-running worker processes are supervised separately in `io::worker`.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Error unless the command exited 0 within its timeout.
    pub fn ensure_success(&self, label: &str) -> Result<()> {
        if self.timed_out {
            bail!("{label} timed out");
        }
        if !self.status.success() {
            bail!(
                "{label} exited with {}: {}",
                describe_status(&self.status),
                tail(&self.stderr_text(), 2_000)
            );
        }
        Ok(())
    }
}

/// `code N` or `signal N`.
pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    "unknown status".to_string()
}

/// Last `max_bytes` of `text`, on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and both output pipes are drained on helper threads while the child runs.
/// `output_limit_bytes` bounds what is kept in memory; the rest is drained and counted.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || -> Result<()> {
                match child_stdin.write_all(&input) {
                    // The child may exit without reading all of its input.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    other => other.context("write stdin"),
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_feeds_stdin() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        out.ensure_success("cat").expect("success");
        assert_eq!(out.stdout_text(), "hello");
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 0123456789"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn times_out_and_kills() {
        let out = run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(out.ensure_success("sleep").is_err());
    }

    #[test]
    fn failure_reports_stderr() {
        let out = run_command_with_timeout(
            sh("echo broken >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        let err = out.ensure_success("tool").expect_err("failure");
        assert!(err.to_string().contains("code 3"));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ééé", 3), "é");
    }
}
