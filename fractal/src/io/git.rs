//! Git adapter used to attach work-product artifacts to finished attempts.
//!
//! Workers share one working tree, so attribution is best-effort: an attempt is
//! credited with everything that changed between its start and its exit.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::task::Artifacts;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Full HEAD sha, or `None` for a repo without commits.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Files committed since `base` plus anything uncommitted, sorted.
    pub fn changed_files(&self, base: Option<&str>) -> Result<Vec<String>> {
        let mut files = BTreeSet::new();
        if let Some(base) = base {
            let range = format!("{base}..HEAD");
            let out = self.run_capture(&["diff", "--name-only", &range])?;
            files.extend(out.lines().filter(|l| !l.trim().is_empty()).map(str::to_string));
        }
        files.extend(self.status_porcelain()?.into_iter().map(|entry| entry.path));
        Ok(files.into_iter().collect())
    }

    /// Artifacts for an attempt that started at `base`.
    #[instrument(skip_all, fields(base = ?base))]
    pub fn collect_artifacts(&self, base: Option<&str>, summary: &str) -> Result<Artifacts> {
        let head = self.head_sha()?;
        let commit = match (&head, base) {
            (Some(head), Some(base)) if head == base => None,
            _ => head,
        };
        let files_changed = self.changed_files(base)?;
        debug!(files = files_changed.len(), commit = ?commit, "collected artifacts");
        Ok(Artifacts {
            files_changed,
            commit,
            summary: summary.to_string(),
        })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?}");
    }

    fn repo() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        git(temp.path(), &["init", "-q"]);
        git(temp.path(), &["config", "user.email", "dev@example.com"]);
        git(temp.path(), &["config", "user.name", "dev"]);
        temp
    }

    #[test]
    fn parses_untracked_and_renamed_lines() {
        assert_eq!(
            parse_status_line("?? foo.txt").expect("parse"),
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
        assert_eq!(
            parse_status_line("R  old.txt -> new.txt")
                .expect("parse")
                .path,
            "new.txt"
        );
    }

    #[test]
    fn head_is_none_before_first_commit() {
        let temp = repo();
        let git = Git::new(temp.path());
        assert!(git.is_repo());
        assert_eq!(git.head_sha().expect("head"), None);
    }

    #[test]
    fn artifacts_include_commits_and_dirty_files() {
        let temp = repo();
        let root = temp.path();
        fs::write(root.join("a.txt"), "a").expect("write");
        git(root, &["add", "a.txt"]);
        git(root, &["commit", "-q", "-m", "base"]);
        let g = Git::new(root);
        let base = g.head_sha().expect("head").expect("sha");

        fs::write(root.join("b.txt"), "b").expect("write");
        git(root, &["add", "b.txt"]);
        git(root, &["commit", "-q", "-m", "work"]);
        fs::write(root.join("c.txt"), "c").expect("write");

        let artifacts = g.collect_artifacts(Some(&base), "did work").expect("collect");
        assert_eq!(artifacts.files_changed, ["b.txt", "c.txt"]);
        assert!(artifacts.commit.is_some());
        assert_ne!(artifacts.commit.as_deref(), Some(base.as_str()));
        assert_eq!(artifacts.summary, "did work");
    }

    #[test]
    fn non_repo_is_detected() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repo());
    }
}
