//! Cross-process advisory file lock with a bounded wait.
//!
//! Independently launched training jobs share a data directory; the lock
//! serializes dataset construction between them. The lock is released when the
//! guard is dropped or the process exits.

use crate::error::LockError;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Delay between two acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Held exclusive lock on a lock file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock once without waiting.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let file = open_lock_file(path)?;
        if sys::try_lock_exclusive(&file)? {
            Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Wait up to `timeout` for the lock.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if sys::try_lock_exclusive(&file)? {
                debug!(path = %path.display(), "Acquired file lock");
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(LockError::TimedOut {
                    path: path.to_path_buf(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            debug!(path = %path.display(), "Lock busy, waiting");
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
        }
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

// Advisory locking is only enforced on unix hosts.
#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
        Ok(true)
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Ok(())
    }
}
