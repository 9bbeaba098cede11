//! Remote shell sessions using the system `ssh` client.
//!
//! Uses system SSH so the user's own `~/.ssh/config` (jump hosts, ports,
//! known hosts) applies.

use super::errors::TransportError;
use super::runner::{CommandRunner, Invocation, ProcessOutput, RunOutcome, SystemRunner};
use super::{Credential, Transport, quote};
use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, debug, info, span};

/// Prefix ssh puts on its own diagnostics
const SSH_CLIENT_PREFIX: &str = "ssh:";

/// Shell session to a host reachable with ssh
pub struct ShellSession<R: CommandRunner = SystemRunner> {
    /// ssh client binary
    ssh: PathBuf,
    /// `user@host` destination
    destination: String,
    /// Identity file
    identity: PathBuf,
    /// Connect timeout handed to ssh
    connect_timeout: Duration,
    /// Process runner
    runner: R,
}

impl ShellSession<SystemRunner> {
    /// Connect to `user@host` and verify the channel with a no-op command
    ///
    /// # Errors
    ///
    /// Returns a classified [`TransportError`] if the host cannot be reached
    /// or rejects the credential.
    pub fn connect(
        ssh_binary: &str,
        user: &str,
        host: &str,
        credential: &Credential,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let ssh = which::which(ssh_binary).map_err(|e| {
            TransportError::new(
                super::FailureKind::Unavailable,
                format!("ssh client '{ssh_binary}' not found: {e}"),
            )
        })?;
        let session = Self::with_runner(ssh, user, host, credential, connect_timeout, SystemRunner);
        session.probe()?;
        Ok(session)
    }
}

impl<R: CommandRunner> ShellSession<R> {
    /// Session with an explicit runner, without probing the host
    pub fn with_runner(
        ssh: PathBuf,
        user: &str,
        host: &str,
        credential: &Credential,
        connect_timeout: Duration,
        runner: R,
    ) -> Self {
        Self {
            ssh,
            destination: format!("{user}@{host}"),
            identity: credential.private_key().to_path_buf(),
            connect_timeout,
            runner,
        }
    }

    /// Base ssh invocation for this destination
    fn invocation(&self) -> Invocation {
        Invocation::new(&self.ssh)
            .args(["-o", "BatchMode=yes", "-o"])
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("-i")
            .arg(&self.identity)
            .arg(&self.destination)
    }

    /// Run an invocation to completion
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        match self.runner.run(invocation)? {
            RunOutcome::Finished(output) => Ok(output),
            RunOutcome::TimedOut => Err(anyhow!("{} timed out", invocation.display())),
        }
    }

    /// Check that the destination accepts the credential
    fn probe(&self) -> Result<(), TransportError> {
        let invocation = self.invocation().arg("true");
        let output = self.run(&invocation).map_err(|e| {
            TransportError::new(super::FailureKind::Unclassified, format!("ssh: {e:#}"))
        })?;
        if !output.success {
            return Err(TransportError::from_stderr("ssh", &output.stderr_text()));
        }
        Ok(())
    }
}

/// Whether stderr came from the ssh client rather than the remote command
fn is_client_failure(output: &ProcessOutput) -> bool {
    !output.success && output.stderr_text().trim_start().starts_with(SSH_CLIENT_PREFIX)
}

impl<R: CommandRunner> Transport for ShellSession<R> {
    fn id(&self) -> &str {
        &self.destination
    }

    fn execute(&self, command: &str) -> Result<String> {
        let span = span!(Level::DEBUG, "ssh_execute", dest = %self.destination);
        let _guard = span.enter();

        let output = self.run(&self.invocation().arg(command))?;
        if is_client_failure(&output) {
            return Err(TransportError::from_stderr("ssh", &output.stderr_text()).into());
        }
        debug!(bytes = output.stdout.len(), "Command finished");
        Ok(output.stdout_text())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let output = self.run(&self.invocation().arg(format!("cat {}", quote(path))))?;
        if !output.success {
            return Err(anyhow!(
                "Failed to read {path} from {}: {}",
                self.destination,
                output.stderr_text().trim()
            ));
        }
        Ok(output.stdout)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let invocation = self
            .invocation()
            .arg(format!("cat > {}", quote(path)))
            .stdin(data.to_vec());
        let output = self.run(&invocation)?;
        if !output.success {
            return Err(anyhow!(output.stderr_text()))
                .with_context(|| format!("Failed to write {path} to {}", self.destination));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        info!(dest = %self.destination, "Shell session closed");
        Ok(())
    }
}

/// Opens shell sessions with the system ssh client
#[derive(Debug, Clone)]
pub struct SshDialer {
    /// ssh client name or path
    ssh_binary: String,
}

impl SshDialer {
    /// Dialer using `ssh_binary`
    #[must_use]
    pub fn new(ssh_binary: &str) -> Self {
        Self {
            ssh_binary: ssh_binary.to_string(),
        }
    }
}

impl crate::orchestrator::ShellDialer for SshDialer {
    fn dial(
        &self,
        user: &str,
        host: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let session = ShellSession::connect(&self.ssh_binary, user, host, credential, timeout)?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct EchoRunner {
        seen: Rc<RefCell<Vec<Invocation>>>,
        result: Rc<RefCell<Option<ProcessOutput>>>,
    }

    impl CommandRunner for EchoRunner {
        fn run(&self, invocation: &Invocation) -> Result<RunOutcome> {
            self.seen.borrow_mut().push(invocation.clone());
            Ok(RunOutcome::Finished(
                self.result.borrow().clone().unwrap_or(ProcessOutput {
                    success: true,
                    stdout: b"ok\n".to_vec(),
                    stderr: Vec::new(),
                }),
            ))
        }
    }

    fn session(temp: &TempDir, runner: EchoRunner) -> ShellSession<EchoRunner> {
        let key = temp.path().join("id");
        std::fs::write(&key, "key").unwrap();
        let credential = Credential::load(&key).unwrap();
        ShellSession::with_runner(
            PathBuf::from("ssh"),
            "pi",
            "10.0.0.9",
            &credential,
            Duration::from_secs(5),
            runner,
        )
    }

    #[test]
    fn test_execute_builds_batch_invocation() {
        let temp = TempDir::new().unwrap();
        let runner = EchoRunner::default();
        let session = session(&temp, runner.clone());
        assert_eq!(session.id(), "pi@10.0.0.9");
        assert_eq!(session.execute("hostname").unwrap(), "ok\n");

        let seen = runner.seen.borrow();
        let rendered = seen[0].display();
        assert!(rendered.contains("BatchMode=yes"));
        assert!(rendered.contains("ConnectTimeout=5"));
        assert!(rendered.ends_with("pi@10.0.0.9 hostname"));
    }

    #[test]
    fn test_write_file_streams_stdin() {
        let temp = TempDir::new().unwrap();
        let runner = EchoRunner::default();
        let session = session(&temp, runner.clone());
        session.write_file("/tmp/a b.txt", b"data").unwrap();

        let seen = runner.seen.borrow();
        assert_eq!(seen[0].stdin.as_deref(), Some(&b"data"[..]));
        assert!(seen[0].display().ends_with("cat > '/tmp/a b.txt'"));
    }

    #[test]
    fn test_client_failure_is_error() {
        let temp = TempDir::new().unwrap();
        let runner = EchoRunner::default();
        *runner.result.borrow_mut() = Some(ProcessOutput {
            success: false,
            stdout: Vec::new(),
            stderr: b"ssh: connect to host 10.0.0.9 port 22: No route to host\n".to_vec(),
        });
        let session = session(&temp, runner);
        assert!(session.execute("true").is_err());
    }
}
