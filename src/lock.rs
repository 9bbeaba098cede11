//! State locking to keep concurrent invocations off the same files
//!
//! The registry file and the host-side baselines are read-modify-written.
//! This module provides advisory locks around those touches. Locks are
//! automatically released when dropped, and by the kernel if the holder dies.
//!
//! Lock files are never truncated before the lock is held and never removed,
//! so every process contends on the same inode.

use anyhow::{Context, Result, bail};
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

/// Resources that can be locked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTarget {
    /// The device registry file
    Registry,
    /// Change detection for one device (its baselines)
    Detection(String),
}

impl LockTarget {
    /// Get the string representation of the lock target
    fn as_str(&self) -> &str {
        match self {
            Self::Registry => "registry",
            Self::Detection(_) => "detection",
        }
    }

    /// Lock file name for this target
    fn file_name(&self) -> String {
        match self {
            Self::Registry => "registry.lock".to_string(),
            Self::Detection(device) => format!("detect-{}.lock", sanitize(device)),
        }
    }
}

/// Replace characters that are unsafe in file names
#[must_use]
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Holds an exclusive lock on a resource
///
/// The lock is automatically released when this struct is dropped.
pub struct StateLock {
    /// Lock file handle
    lock_file: File,
    /// Path to the lock file (for error messages)
    lock_path: PathBuf,
}

impl StateLock {
    /// Acquire an exclusive lock on a resource
    ///
    /// # Arguments
    ///
    /// * `state_dir` - Directory holding devsync state
    /// * `target` - Resource to lock
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Cannot create locks directory
    /// - Cannot acquire lock within timeout period
    pub fn acquire(state_dir: &Path, target: &LockTarget) -> Result<Self> {
        let locks_dir = state_dir.join("locks");
        fs::create_dir_all(&locks_dir).context("Failed to create locks directory")?;

        let lock_path = locks_dir.join(target.file_name());
        let lock_file = Self::try_acquire_lock(&lock_path, target)?;

        Ok(Self {
            lock_file,
            lock_path,
        })
    }

    /// Try to acquire the lock file
    fn try_acquire_lock(lock_path: &Path, target: &LockTarget) -> Result<File> {
        // Use shorter timeouts in test mode for faster test execution
        let lock_timeout = if cfg!(test) {
            Duration::from_millis(100)
        } else {
            Duration::from_secs(30)
        };
        let retry_interval = if cfg!(test) {
            Duration::from_millis(10)
        } else {
            Duration::from_millis(100)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
        let start = Instant::now();

        loop {
            match file.try_lock_exclusive() {
                Ok(true) => {
                    // Holder info for debugging; only rewritten while held
                    if let Err(e) = file.set_len(0).and_then(|()| {
                        writeln!(
                            file,
                            "target={}\npid={}\ntime={}",
                            target.as_str(),
                            std::process::id(),
                            humantime::format_rfc3339(SystemTime::now())
                        )
                    }) {
                        tracing::debug!(path = %lock_path.display(), error = %e, "Failed to record lock holder");
                    }
                    return Ok(file);
                }
                Ok(false) | Err(_) if start.elapsed() < lock_timeout => {
                    std::thread::sleep(retry_interval);
                }
                Ok(false) | Err(_) => {
                    bail!(
                        "Another devsync process holds the {} lock. \
                         Please wait for it to complete (lock file: {})",
                        target.as_str(),
                        lock_path.display()
                    );
                }
            }
        }
    }

    /// Release the lock explicitly (normally handled by Drop)
    ///
    /// # Errors
    ///
    /// Returns an error if the unlock operation fails
    pub fn release(self) -> Result<()> {
        self.lock_file
            .unlock()
            .with_context(|| format!("Failed to unlock {}", self.lock_path.display()))
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            tracing::warn!(path = %self.lock_path.display(), error = %e, "Failed to unlock");
        }
    }
}
