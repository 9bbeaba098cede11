//! # Transport Sessions
//!
//! A session is one authenticated command channel to a device. All transports
//! expose the same capability set through the [`Transport`] trait; which variant
//! is used is decided by the orchestrator from configuration and what the
//! device bridge reports, never by inspecting the session itself.
//!
//! | Variant | Kind | Reaches |
//! |---|---|---|
//! | [`AdbSession`] | `Usb` / `NetworkAdb` | Android devices through the `adb` bridge |
//! | [`ShellSession`] | `Shell` | Hosts reachable with `ssh` |
//! | [`LocalSession`] | - | This machine (host mirror side) |
//!
//! Commands return standard output only. Standard error is discarded, matching
//! the behaviour of a remote shell channel.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Device bridge sessions (USB and network)
pub mod adb;
/// Transport failure taxonomy
pub mod errors;
/// Host-local session
pub mod local;
/// Host process execution
pub mod runner;
/// Remote shell sessions over ssh
pub mod shell;

pub use adb::{AdbBridge, AdbSession};
pub use errors::{FailureKind, TransportError};
pub use local::LocalSession;
pub use runner::{CommandRunner, Invocation, ProcessOutput, RunOutcome, SystemRunner};
pub use shell::{ShellSession, SshDialer};

/// Channel type used to reach a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB-attached bridge
    Usb,
    /// Network-attached bridge
    #[serde(rename = "network")]
    NetworkAdb,
    /// Remote shell
    Shell,
}

impl TransportKind {
    /// Key used in the registry file
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::NetworkAdb => "network",
            Self::Shell => "shell",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface shared by every session variant
pub trait Transport {
    /// Endpoint designation (serial, `ip:port`, `user@host`)
    fn id(&self) -> &str;

    /// Run a shell command and return its standard output
    ///
    /// # Errors
    ///
    /// Returns an error if the channel itself fails; a non-zero exit status
    /// of the remote command is not an error.
    fn execute(&self, command: &str) -> Result<String>;

    /// Read a whole file from the device
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be transferred.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace a file on the device
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be transferred.
    fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Tear the session down
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge refuses to release the endpoint.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Where a handshake is aimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// USB device by serial
    Usb(String),
    /// Network bridge address
    Network(SocketAddr),
}

impl Endpoint {
    /// Transport kind this endpoint is reached with
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Usb(_) => TransportKind::Usb,
            Self::Network(_) => TransportKind::NetworkAdb,
        }
    }

    /// Target string understood by the bridge's `-s` option
    #[must_use]
    pub fn target(&self) -> String {
        match self {
            Self::Usb(serial) => serial.clone(),
            Self::Network(addr) => addr.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.target())
    }
}

/// Identity of a connected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// Stable serial or hardware address
    pub id: String,
    /// Address the device currently answers on, if any
    pub current_address: Option<String>,
    /// Transport the identity was established over
    pub transport_kind: TransportKind,
    /// Operating system description
    pub operating_system: String,
}

/// Host key material shared by every device authentication
///
/// Key generation happens elsewhere; this only locates the private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    private_key: PathBuf,
}

impl Credential {
    /// Use the private key at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the key file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!(
                "Credential not found at {}. Generate a key pair first (e.g. by running 'adb start-server' once)",
                path.display()
            );
        }
        let private_key = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve credential {}", path.display()))?;
        Ok(Self { private_key })
    }

    /// Path to the private key
    #[must_use]
    pub fn private_key(&self) -> &Path {
        &self.private_key
    }
}

/// Quote a path or argument for a POSIX shell command line
#[must_use]
pub fn quote(arg: &str) -> String {
    shell_words::quote(arg).into_owned()
}
