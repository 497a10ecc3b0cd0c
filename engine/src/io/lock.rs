//! Exclusive ownership of a data directory.
//!
//! Two engine processes sharing one data directory would double-run jobs and
//! race on job records, so startup takes a non-blocking advisory lock on
//! `<data_dir>/.engine.lock`. The OS drops the lock when the process dies, so
//! a crashed engine never leaves a stale lock behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = ".engine.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("data directory is in use by another process (lock {})", .path.display())]
    AlreadyLocked { path: PathBuf },
    #[error("lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held lock on a data directory. Released on [`DirectoryLock::release`] or drop.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirectoryLock {
    /// Take the lock for `data_dir`, creating the directory if needed.
    ///
    /// Fails immediately with [`LockError::AlreadyLocked`] when another holder
    /// exists. The existing file is not truncated before the lock is held, so
    /// a losing contender never wipes the winner's diagnostics.
    pub fn acquire(data_dir: &Path) -> Result<Self, LockError> {
        let path = data_dir.join(LOCK_FILE_NAME);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(data_dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(LockError::AlreadyLocked { path });
            }
            return Err(io_err(err));
        }

        if let Err(err) = write_holder(&file) {
            warn!(path = %path.display(), err = %err, "failed to write lock holder info");
        }
        info!(path = %path.display(), "data directory locked");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Calling it again is a no-op.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Err(err) = FileExt::unlock(&file) {
            warn!(path = %self.path.display(), err = %err, "failed to unlock data directory");
        }
        debug!(path = %self.path.display(), "data directory unlocked");
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn write_holder(mut file: &File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(
        file,
        "pid={}\nstarted_at={}\n",
        std::process::id(),
        Utc::now().to_rfc3339()
    )?;
    file.sync_all()
}

/// Diagnostics written by the current (or last) lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockHolder {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Read holder diagnostics without taking the lock.
///
/// Returns `Ok(None)` when no lock file exists.
pub fn read_holder(data_dir: &Path) -> Result<Option<LockHolder>> {
    let path = data_dir.join(LOCK_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut holder = LockHolder::default();
    for line in contents.lines() {
        match line.split_once('=') {
            Some(("pid", value)) => holder.pid = value.trim().parse().ok(),
            Some(("started_at", value)) => {
                holder.started_at = DateTime::parse_from_rfc3339(value.trim())
                    .ok()
                    .map(|ts| ts.with_timezone(&Utc));
            }
            _ => {}
        }
    }
    Ok(Some(holder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _held = DirectoryLock::acquire(temp.path()).expect("first lock");

        let err = DirectoryLock::acquire(temp.path()).expect_err("second lock must fail");
        assert!(matches!(err, LockError::AlreadyLocked { .. }), "{err:?}");
    }

    #[test]
    fn release_allows_reacquire() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut lock = DirectoryLock::acquire(temp.path()).expect("lock");
        lock.release();
        lock.release();
        assert!(!lock.is_held());

        let again = DirectoryLock::acquire(temp.path()).expect("reacquire");
        assert!(again.is_held());
    }

    #[test]
    fn drop_releases() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let _lock = DirectoryLock::acquire(temp.path()).expect("lock");
        }
        DirectoryLock::acquire(temp.path()).expect("reacquire after drop");
    }

    #[test]
    fn creates_missing_directory_and_records_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().join("nested/data");
        let _lock = DirectoryLock::acquire(&data_dir).expect("lock");

        let holder = read_holder(&data_dir).expect("read").expect("holder");
        assert_eq!(holder.pid, Some(std::process::id()));
        assert!(holder.started_at.is_some());
    }

    #[test]
    fn losing_contender_keeps_holder_info() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _held = DirectoryLock::acquire(temp.path()).expect("lock");
        let before = fs::read_to_string(temp.path().join(LOCK_FILE_NAME)).expect("read");

        let _ = DirectoryLock::acquire(temp.path());
        let after = fs::read_to_string(temp.path().join(LOCK_FILE_NAME)).expect("read");
        assert_eq!(before, after);
    }

    #[test]
    fn read_holder_without_lock_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(read_holder(temp.path()).expect("read"), None);
    }
}
