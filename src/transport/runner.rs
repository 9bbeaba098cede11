//! Host process execution for transport drivers.
//!
//! Every transport reaches its device by running a local program (`adb`, `ssh`,
//! `sh`). Processes are spawned in their own process group so a handshake that
//! exceeds its deadline can be killed together with any helpers it forked.

use anyhow::{Context, Result};
use command_group::CommandGroup;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{Level, debug, span};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Whether the process exited with status zero
    pub success: bool,
    /// Captured standard output
    pub stdout: Vec<u8>,
    /// Captured standard error
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Standard output decoded lossily as UTF-8
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A program invocation, independent of how it gets executed
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Program to run
    pub program: PathBuf,
    /// Arguments passed verbatim
    pub args: Vec<OsString>,
    /// Extra environment variables
    pub env: Vec<(OsString, OsString)>,
    /// Bytes written to the child's stdin before waiting
    pub stdin: Option<Vec<u8>>,
    /// Deadline after which the process group is killed
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Start an invocation of `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed bytes to the child's stdin
    #[must_use]
    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    /// Kill the process if it runs longer than `timeout`
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human readable rendering for logs and error messages
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Outcome of running an invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process finished on its own
    Finished(ProcessOutput),
    /// The deadline passed and the process group was killed
    TimedOut,
}

/// Executes invocations on the host
pub trait CommandRunner {
    /// Run an invocation to completion or until its deadline
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be spawned or its pipes fail.
    fn run(&self, invocation: &Invocation) -> Result<RunOutcome>;
}

/// Runs invocations with `std::process` in a dedicated process group
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<RunOutcome> {
        let span = span!(Level::DEBUG, "run", cmd = %invocation.display());
        let _guard = span.enter();

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .group_spawn()
            .with_context(|| format!("Failed to spawn {}", invocation.program.display()))?;

        if let Some(data) = &invocation.stdin {
            let mut stdin = child
                .inner()
                .stdin
                .take()
                .context("Failed to open child stdin")?;
            stdin.write_all(data).context("Failed to write child stdin")?;
            // Dropping closes the pipe so the child sees EOF
        }

        let Some(timeout) = invocation.timeout else {
            let output = child
                .wait_with_output()
                .with_context(|| format!("Failed to wait for {}", invocation.display()))?;
            return Ok(RunOutcome::Finished(ProcessOutput {
                success: output.status.success(),
                stdout: output.stdout,
                stderr: output.stderr,
            }));
        };

        // Handshake commands print a few lines at most, so polling cannot
        // deadlock on a full pipe.
        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);
        loop {
            if let Some(status) = child.try_wait().context("Failed to poll child")? {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                if let Some(mut out) = child.inner().stdout.take() {
                    out.read_to_end(&mut stdout)?;
                }
                if let Some(mut err) = child.inner().stderr.take() {
                    err.read_to_end(&mut stderr)?;
                }
                return Ok(RunOutcome::Finished(ProcessOutput {
                    success: status.success(),
                    stdout,
                    stderr,
                }));
            }
            if start.elapsed() >= timeout {
                debug!(?timeout, "Deadline passed, killing process group");
                let _ = child.kill();
                let _ = child.wait();
                return Ok(RunOutcome::TimedOut);
            }
            std::thread::sleep(poll_interval);
        }
    }
}
