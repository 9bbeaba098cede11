#![allow(dead_code)]

use anyhow::Result;
use assert_cmd::Command;
use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Fixed modification time so unchanged files list identically across runs
pub const FIXED_MTIME: i64 = 1_709_375_400;

/// Isolated home directory with its own devsync settings
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub config_path: PathBuf,
}

impl TestEnv {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join(".config/devsync/config.toml");
        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    pub fn home(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The devsync binary pointed at this environment
    pub fn cmd(&self) -> Result<Command> {
        let mut cmd = Command::cargo_bin("devsync")?;
        cmd.env("HOME", self.home())
            .env("DEVSYNC_CONFIG_PATH", &self.config_path)
            .env_remove("DEVSYNC_LOG")
            .env("NO_COLOR", "1");
        Ok(cmd)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

/// Write `content` to `path` with a fixed modification time
pub fn write_fixed(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    filetime::set_file_mtime(path, FileTime::from_unix_time(FIXED_MTIME, 0))?;
    Ok(())
}

/// Pin a directory's modification time after its contents changed
pub fn pin_dir(path: &Path) -> Result<()> {
    filetime::set_file_mtime(path, FileTime::from_unix_time(FIXED_MTIME, 0))?;
    Ok(())
}
