//! Advisory lock held for the duration of an `index` or `reindex` run.
//!
//! The lock file sits next to the database (`<db>.lock`) and records the
//! holder's mode and pid. A second indexing run fails fast with
//! [`RecallError::IndexBusy`]. Question handlers only look at the lock to
//! see whether a full `reindex` is in progress; during an incremental
//! `index` they keep reading committed data.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chat_recall_core::error::RecallError;
use fs2::FileExt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Index,
    Reindex,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Index => "index",
            LockMode::Reindex => "reindex",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "index" => Some(LockMode::Index),
            "reindex" => Some(LockMode::Reindex),
            _ => None,
        }
    }
}

/// Who holds the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub mode: LockMode,
    pub pid: u32,
}

/// Exclusive indexing lock; released on drop.
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl IndexLock {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "index lock released");
    }
}

fn open(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Take the exclusive lock or fail with [`RecallError::IndexBusy`].
pub fn acquire(path: &Path, mode: LockMode) -> Result<IndexLock> {
    let mut file = open(path)?;
    if let Err(e) = FileExt::try_lock_exclusive(&file) {
        if is_contended(&e) {
            return Err(RecallError::IndexBusy.into());
        }
        return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "mode={}\npid={}\n", mode.as_str(), std::process::id())?;
    file.flush()?;
    debug!(path = %path.display(), mode = mode.as_str(), "index lock acquired");

    Ok(IndexLock {
        file,
        path: path.to_path_buf(),
        mode,
    })
}

/// The current holder, if any. Never blocks.
pub fn holder(path: &Path) -> Result<Option<LockHolder>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = open(path)?;
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(None)
        }
        Err(e) if is_contended(&e) => {
            let mut content = String::new();
            file.read_to_string(&mut content)?;
            Ok(Some(parse_holder(&content).unwrap_or(LockHolder {
                mode: LockMode::Reindex,
                pid: 0,
            })))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to check {}", path.display())),
    }
}

fn parse_holder(content: &str) -> Option<LockHolder> {
    let mut mode = None;
    let mut pid = None;
    for line in content.lines() {
        match line.split_once('=') {
            Some(("mode", v)) => mode = LockMode::parse(v.trim()),
            Some(("pid", v)) => pid = v.trim().parse().ok(),
            _ => {}
        }
    }
    Some(LockHolder {
        mode: mode?,
        pid: pid.unwrap_or(0),
    })
}

/// `IndexBusy` while a full reindex holds the lock.
pub fn ensure_readable(path: &Path) -> Result<()> {
    match holder(path)? {
        Some(LockHolder {
            mode: LockMode::Reindex,
            ..
        }) => Err(RecallError::IndexBusy.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_busy() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recall.sqlite.lock");
        let _held = acquire(&path, LockMode::Index).unwrap();

        let err = acquire(&path, LockMode::Reindex).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecallError>(),
            Some(RecallError::IndexBusy)
        ));
    }

    #[test]
    fn test_holder_reports_mode_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recall.sqlite.lock");
        assert_eq!(holder(&path).unwrap(), None);

        let lock = acquire(&path, LockMode::Reindex).unwrap();
        let h = holder(&path).unwrap().unwrap();
        assert_eq!(h.mode, LockMode::Reindex);
        assert_eq!(h.pid, std::process::id());
        assert!(ensure_readable(&path).is_err());

        drop(lock);
        assert_eq!(holder(&path).unwrap(), None);
        assert!(ensure_readable(&path).is_ok());
    }

    #[test]
    fn test_incremental_index_does_not_block_readers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recall.sqlite.lock");
        let _lock = acquire(&path, LockMode::Index).unwrap();
        assert!(ensure_readable(&path).is_ok());
    }

    #[test]
    fn test_parse_holder() {
        assert_eq!(
            parse_holder("mode=index\npid=12\n"),
            Some(LockHolder {
                mode: LockMode::Index,
                pid: 12
            })
        );
        assert_eq!(parse_holder("garbage"), None);
    }
}
