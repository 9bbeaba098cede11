//! Sessions and driver operations over the `adb` device bridge.
//!
//! The bridge binary is driven as a subprocess. The host credential is handed
//! over through `ADB_VENDOR_KEYS`, so the same key pair authenticates every
//! device regardless of the bridge's own key store.

use super::errors::{FailureKind, TransportError};
use super::runner::{CommandRunner, Invocation, ProcessOutput, RunOutcome, SystemRunner};
use super::{Credential, Endpoint, Transport, TransportKind, quote};
use crate::orchestrator::Bridge;
use anyhow::{Context, Result, anyhow};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, debug, info, span, warn};

/// Environment variable the bridge reads extra private keys from
const VENDOR_KEYS_ENV: &str = "ADB_VENDOR_KEYS";

/// Session to one device through the bridge
pub struct AdbSession<R: CommandRunner = SystemRunner> {
    /// Bridge binary
    adb: PathBuf,
    /// `-s` target (serial or `ip:port`)
    target: String,
    /// USB or network
    kind: TransportKind,
    /// Credential passed to every bridge invocation
    vendor_keys: PathBuf,
    /// Process runner
    runner: R,
    /// Set once `close` has released the endpoint
    closed: bool,
}

impl<R: CommandRunner> AdbSession<R> {
    /// Wrap an already authenticated endpoint
    pub fn new(adb: &Path, endpoint: &Endpoint, credential: &Credential, runner: R) -> Self {
        Self {
            adb: adb.to_path_buf(),
            target: endpoint.target(),
            kind: endpoint.kind(),
            vendor_keys: credential.private_key().to_path_buf(),
            runner,
            closed: false,
        }
    }

    /// Transport kind of this session
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Invocation of the bridge aimed at this session's target
    fn invocation(&self) -> Invocation {
        Invocation::new(&self.adb)
            .env(VENDOR_KEYS_ENV, &self.vendor_keys)
            .args(["-s", self.target.as_str()])
    }

    /// Run an invocation without deadline, turning bridge failures into errors
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        match self.runner.run(invocation)? {
            RunOutcome::Finished(output) => Ok(output),
            RunOutcome::TimedOut => Err(anyhow!("{} timed out", invocation.display())),
        }
    }
}

/// Whether stderr came from the bridge itself rather than the remote command
fn is_bridge_failure(output: &ProcessOutput) -> bool {
    if output.success {
        return false;
    }
    let stderr = output.stderr_text();
    let first = stderr.trim_start();
    first.starts_with("error:") || first.starts_with("adb:")
}

impl<R: CommandRunner> Transport for AdbSession<R> {
    fn id(&self) -> &str {
        &self.target
    }

    fn execute(&self, command: &str) -> Result<String> {
        let span = span!(Level::DEBUG, "adb_execute", target = %self.target);
        let _guard = span.enter();

        let invocation = self.invocation().arg("shell").arg(command);
        let output = self.run(&invocation)?;
        if is_bridge_failure(&output) {
            return Err(TransportError::from_stderr("adb shell", &output.stderr_text()).into());
        }
        debug!(bytes = output.stdout.len(), "Command finished");
        Ok(output.stdout_text())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let invocation = self
            .invocation()
            .args(["exec-out", &format!("cat {}", quote(path))]);
        let output = self.run(&invocation)?;
        if !output.success {
            return Err(anyhow!(
                "Failed to read {path} from {}: {}",
                self.target,
                output.stderr_text().trim()
            ));
        }
        Ok(output.stdout)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new().context("Failed to stage upload")?;
        staged.write_all(data).context("Failed to stage upload")?;
        staged.flush()?;

        let invocation = self
            .invocation()
            .arg("push")
            .arg(staged.path())
            .arg(path);
        let output = self.run(&invocation)?;
        if !output.success {
            return Err(TransportError::from_stderr("adb push", &output.stderr_text()))
                .with_context(|| format!("Failed to write {path} to {}", self.target));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed || self.kind != TransportKind::NetworkAdb {
            self.closed = true;
            return Ok(());
        }
        let invocation = Invocation::new(&self.adb)
            .env(VENDOR_KEYS_ENV, &self.vendor_keys)
            .args(["disconnect", self.target.as_str()]);
        self.run(&invocation)?;
        self.closed = true;
        info!(target = %self.target, "Disconnected");
        Ok(())
    }
}

/// Host-side operations of the `adb` bridge
pub struct AdbBridge<R: CommandRunner + Clone + 'static = SystemRunner> {
    /// Bridge binary
    adb: PathBuf,
    /// Process runner shared with opened sessions
    runner: R,
}

impl AdbBridge<SystemRunner> {
    /// Bridge using the system process runner
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be found on `PATH`.
    pub fn locate(binary: &str) -> Result<Self> {
        let adb = which::which(binary)
            .with_context(|| format!("Device bridge '{binary}' not found on PATH"))?;
        Ok(Self::with_runner(adb, SystemRunner))
    }
}

impl<R: CommandRunner + Clone + 'static> AdbBridge<R> {
    /// Bridge with an explicit runner
    pub fn with_runner(adb: PathBuf, runner: R) -> Self {
        Self { adb, runner }
    }

    /// Run a bridge command, mapping spawn failures and deadlines into the taxonomy
    ///
    /// `on_timeout` is the failure kind reported when the deadline passes.
    fn run_classified(
        &self,
        what: &str,
        invocation: &Invocation,
        on_timeout: FailureKind,
    ) -> Result<ProcessOutput, TransportError> {
        match self.runner.run(invocation) {
            Ok(RunOutcome::Finished(output)) => Ok(output),
            Ok(RunOutcome::TimedOut) => Err(TransportError::new(
                on_timeout,
                format!("{what}: no answer within deadline"),
            )),
            Err(e) => Err(TransportError::new(
                FailureKind::Unclassified,
                format!("{what}: {e:#}"),
            )),
        }
    }

    /// Bare invocation of the bridge binary
    fn bridge(&self, credential: Option<&Credential>) -> Invocation {
        let invocation = Invocation::new(&self.adb);
        match credential {
            Some(c) => invocation.env(VENDOR_KEYS_ENV, c.private_key()),
            None => invocation,
        }
    }

    /// Run a maintenance command whose failure only matters for logging
    fn run_best_effort(&self, args: &[&str]) -> Result<()> {
        let invocation = self.bridge(None).args(args.iter().copied());
        match self.runner.run(&invocation)? {
            RunOutcome::Finished(output) if !output.success => {
                warn!(cmd = %invocation.display(), stderr = %output.stderr_text().trim(), "Bridge command failed");
            }
            RunOutcome::TimedOut => warn!(cmd = %invocation.display(), "Bridge command timed out"),
            RunOutcome::Finished(_) => {}
        }
        Ok(())
    }
}

/// Parse `adb devices` output into `(serial, state)` pairs
#[must_use]
pub fn parse_device_list(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            Some((serial.to_string(), state.to_string()))
        })
        .collect()
}

impl<R: CommandRunner + Clone + 'static> Bridge for AdbBridge<R> {
    fn usb_devices(&self) -> Result<Vec<String>> {
        let invocation = self.bridge(None).arg("devices");
        let output = match self.runner.run(&invocation)? {
            RunOutcome::Finished(output) => output,
            RunOutcome::TimedOut => return Err(anyhow!("adb devices timed out")),
        };
        if !output.success {
            return Err(TransportError::from_stderr("adb devices", &output.stderr_text()).into());
        }

        // Network-attached entries are listed as ip:port
        Ok(parse_device_list(&output.stdout_text())
            .into_iter()
            .map(|(serial, _)| serial)
            .filter(|serial| !serial.contains(':'))
            .collect())
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn super::Transport>, TransportError> {
        let span = span!(Level::DEBUG, "handshake", endpoint = %endpoint);
        let _guard = span.enter();

        if let Endpoint::Network(addr) = endpoint {
            let invocation = self
                .bridge(Some(credential))
                .args(["connect", &addr.to_string()])
                .timeout(timeout);
            // An address that never answers is gone, not awaiting trust
            let output =
                self.run_classified("adb connect", &invocation, FailureKind::Unavailable)?;
            // `adb connect` reports failures on stdout with a zero exit status
            let text = format!("{}{}", output.stdout_text(), output.stderr_text());
            if !text.contains("connected to") {
                return Err(TransportError::from_stderr("adb connect", &text));
            }
        }

        let invocation = self
            .bridge(Some(credential))
            .args(["-s", endpoint.target().as_str(), "get-state"])
            .timeout(timeout);
        // A handshake stuck past its deadline is waiting on the trust dialog
        let output =
            self.run_classified("adb get-state", &invocation, FailureKind::AuthPending)?;
        let state = output.stdout_text().trim().to_string();
        if !output.success || state != "device" {
            let detail = if output.stderr.is_empty() {
                format!("device {state}")
            } else {
                output.stderr_text()
            };
            return Err(TransportError::from_stderr("adb get-state", &detail));
        }

        debug!("Handshake complete");
        Ok(Box::new(AdbSession::new(
            &self.adb,
            endpoint,
            credential,
            self.runner.clone(),
        )))
    }

    fn enable_network(&self, serial: &str, port: u16) -> Result<()> {
        let invocation = self
            .bridge(None)
            .args(["-s", serial, "tcpip", &port.to_string()]);
        match self.runner.run(&invocation)? {
            RunOutcome::Finished(output) if output.success => Ok(()),
            RunOutcome::Finished(output) => {
                Err(TransportError::from_stderr("adb tcpip", &output.stderr_text()).into())
            }
            RunOutcome::TimedOut => Err(anyhow!("adb tcpip timed out")),
        }
    }

    fn restart_driver(&self) -> Result<()> {
        self.run_best_effort(&["kill-server"])?;
        self.run_best_effort(&["start-server"])
    }

    fn kill_competing_driver(&self) -> Result<()> {
        // A server of another version holding the USB interface exits on kill-server
        self.run_best_effort(&["kill-server"])
    }
}
