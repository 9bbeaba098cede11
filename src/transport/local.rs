//! Session to this machine, used for the host mirror side of a sync pair.

use super::Transport;
use super::runner::{CommandRunner, Invocation, RunOutcome, SystemRunner};
use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::Path;

/// Runs commands through the host's `sh`
pub struct LocalSession<R: CommandRunner = SystemRunner> {
    /// Host name reported as the session id
    name: String,
    /// Process runner
    runner: R,
}

impl LocalSession<SystemRunner> {
    /// Session on this host
    #[must_use]
    pub fn new() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl Default for LocalSession<SystemRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> LocalSession<R> {
    /// Session on this host with an explicit runner
    pub fn with_runner(runner: R) -> Self {
        let name = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self { name, runner }
    }
}

impl<R: CommandRunner> Transport for LocalSession<R> {
    fn id(&self) -> &str {
        &self.name
    }

    fn execute(&self, command: &str) -> Result<String> {
        let invocation = Invocation::new("sh").args(["-c", command]);
        match self.runner.run(&invocation)? {
            RunOutcome::Finished(output) => Ok(output.stdout_text()),
            RunOutcome::TimedOut => Err(anyhow!("{} timed out", invocation.display())),
        }
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("Failed to read {path}"))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directories for {path}"))?;
        }
        fs::write(path, data).with_context(|| format!("Failed to write {path}"))
    }
}
