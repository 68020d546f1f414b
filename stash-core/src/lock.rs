//! Per-repository advisory lock
//!
//! Guards ref reads/writes and packfile execution against interleaved writers
//! from concurrent connections to the same repository. The lock is released
//! when the guard drops, including on error paths.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Result, StashError};

/// Lock file name inside a repository directory
pub const LOCK_FILE: &str = "lock";

/// How long to wait for a contended lock before giving up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

const RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Held exclusive lock on a repository
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    /// Acquire the lock for `repo_dir`, waiting up to `timeout`
    pub fn acquire(repo_dir: &Path, timeout: Duration) -> Result<Self> {
        let path = repo_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::trace!("acquired repository lock {:?}", path);
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Err(StashError::Lock(format!(
                            "timed out after {:?} waiting for {:?}",
                            timeout, path
                        )));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("failed to release repository lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        {
            let _guard = RepoLock::acquire(tmp.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        }
        let again = RepoLock::acquire(tmp.path(), Duration::from_millis(100));
        assert!(again.is_ok());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let tmp = TempDir::new().unwrap();
        let _held = RepoLock::acquire(tmp.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        let second = RepoLock::acquire(tmp.path(), Duration::from_millis(60));
        assert!(matches!(second, Err(StashError::Lock(_))));
    }

    #[test]
    fn test_lock_released_after_error_path() {
        fn failing_write(dir: &Path) -> Result<()> {
            let _guard = RepoLock::acquire(dir, DEFAULT_LOCK_TIMEOUT)?;
            Err(StashError::InvalidArgument("boom".into()))
        }
        let tmp = TempDir::new().unwrap();
        assert!(failing_write(tmp.path()).is_err());
        assert!(RepoLock::acquire(tmp.path(), Duration::from_millis(100)).is_ok());
    }
}
