//! Crash-safe file replacement shared by every on-disk record.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Temp path used while replacing `path`: `<name>.tmp` next to it.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `contents` (temp file + fsync + rename).
///
/// A crash at any point leaves either the previous file or the new one in place;
/// at worst a stray `.tmp` sibling remains, which readers ignore.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let tmp = tmp_path(path);
    {
        let mut file =
            File::create(&tmp).with_context(|| format!("create temp {}", tmp.display()))?;
        file.write_all(contents)
            .with_context(|| format!("write temp {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    sync_dir(parent);
    Ok(())
}

/// Serialize `value` as pretty JSON with a trailing newline and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("record.json");
        write_atomic(&path, b"one").expect("first");
        write_atomic(&path, b"two").expect("second");
        assert_eq!(fs::read(&path).expect("read"), b"two");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn tmp_path_keeps_full_name() {
        let path = Path::new("/state/tasks/task-1.json");
        assert_eq!(tmp_path(path), Path::new("/state/tasks/task-1.json.tmp"));
    }
}
