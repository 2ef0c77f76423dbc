//! Per-application advisory lock
//!
//! Mutating operations on one application are serialized through an
//! exclusive `flock` on `<locks_dir>/<name>.lock`. Operations on different
//! applications never contend.

use crate::error::{DeployError, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Held lock; released when dropped (the descriptor closes)
#[derive(Debug)]
pub struct AppLock {
    name: String,
    path: std::path::PathBuf,
    _file: std::fs::File,
}

impl AppLock {
    /// Acquire the lock for `name`, retrying until `timeout` elapses,
    /// then fail with [`DeployError::Busy`]
    pub async fn acquire(locks_dir: &Path, name: &str, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.lock", name));
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(lock) = Self::try_acquire(&path, name)? {
                debug!(app = %name, "Lock acquired");
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(DeployError::Busy(name.to_string()));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    fn try_acquire(path: &Path, name: &str) -> Result<Option<Self>> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        Ok(Some(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            _file: file,
        }))
    }

    #[cfg(not(unix))]
    fn try_acquire(path: &Path, name: &str) -> Result<Option<Self>> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => Ok(Some(Self {
                name: name.to_string(),
                path: path.to_path_buf(),
                _file: file,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        // Without flock the lock is the file's existence
        #[cfg(not(unix))]
        let _ = std::fs::remove_file(&self.path);
        debug!(app = %self.name, path = %self.path.display(), "Lock released");
    }
}
