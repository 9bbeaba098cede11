//! # Device Registry
//!
//! Persisted address book of devices, keyed first by the local network's
//! identity so each network keeps its own addresses:
//!
//! ```text
//! {
//!   "aa:bb:cc:dd:ee:ff": {
//!     "network": { "R58M123": "192.168.1.20:5555" },
//!     "shell":   { "nas": { "user": "pi", "name": "nas", "ip": "192.168.1.5", "os": "linux" } }
//!   }
//! }
//! ```
//!
//! Every mutation is one transaction: take the registry lock, re-read the file,
//! merge, and write it back through a temporary file renamed over the original.
//! Nothing is written when the merge leaves the contents unchanged.

use crate::lock::{LockTarget, StateLock};
use crate::transport::TransportKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Connection details of a shell-reachable host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellHost {
    /// Login user
    pub user: String,
    /// Host name
    pub name: String,
    /// Last known address
    pub ip: String,
    /// Operating system
    pub os: String,
}

/// Value stored for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistryEntry {
    /// Bridge address (`ip:port`)
    Address(String),
    /// Shell host record
    Shell(ShellHost),
}

/// Devices known on one network, per transport kind
pub type AddressBook = BTreeMap<TransportKind, BTreeMap<String, RegistryEntry>>;

/// Whole registry file contents
pub type RegistryData = BTreeMap<String, AddressBook>;

/// Registry file handle
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    /// Path to the JSON file
    path: PathBuf,
    /// Directory holding the registry lock
    state_dir: PathBuf,
}

impl DeviceRegistry {
    /// Registry stored at `path`, locked through `state_dir`
    #[must_use]
    pub fn open(path: &Path, state_dir: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Path to the registry file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole registry; a missing file is an empty registry
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<RegistryData> {
        if !self.path.exists() {
            return Ok(RegistryData::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read registry: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(RegistryData::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse registry: {}", self.path.display()))
    }

    /// Write the registry atomically
    fn save(&self, data: &RegistryData) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .context("Failed to create temporary registry file")?;
        let json = serde_json::to_string_pretty(data)?;
        staged.write_all(json.as_bytes())?;
        staged.write_all(b"\n")?;
        staged.flush()?;
        staged
            .persist(&self.path)
            .with_context(|| format!("Failed to replace registry: {}", self.path.display()))?;
        Ok(())
    }

    /// Load, apply `merge`, and save if anything changed
    fn transact<T>(&self, merge: impl FnOnce(&mut RegistryData) -> T) -> Result<(T, bool)> {
        let _lock = StateLock::acquire(&self.state_dir, &LockTarget::Registry)?;

        let before = self.load()?;
        let mut after = before.clone();
        let result = merge(&mut after);

        // Drop empty books so forgetting the last device leaves no residue
        after.retain(|_, book| {
            book.retain(|_, devices| !devices.is_empty());
            !book.is_empty()
        });

        let changed = before != after;
        if changed {
            self.save(&after)?;
        }
        Ok((result, changed))
    }

    /// Record the address a device answered on
    ///
    /// Only `(network, kind, device_id)` is touched, and only when the stored
    /// value differs. Returns whether the file was updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be locked, read or written.
    pub fn upsert_address(
        &self,
        network: &str,
        kind: TransportKind,
        device_id: &str,
        address: &str,
    ) -> Result<bool> {
        let entry = RegistryEntry::Address(address.to_string());
        let ((), changed) = self.transact(|data| {
            data.entry(network.to_string())
                .or_default()
                .entry(kind)
                .or_default()
                .insert(device_id.to_string(), entry);
        })?;
        if changed {
            info!(%network, %kind, device = %device_id, %address, "Registry updated");
        } else {
            debug!(%network, %kind, device = %device_id, "Registry already current");
        }
        Ok(changed)
    }

    /// Record a shell-reachable host
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be locked, read or written.
    pub fn upsert_shell_host(&self, network: &str, device_id: &str, host: ShellHost) -> Result<bool> {
        let ((), changed) = self.transact(|data| {
            data.entry(network.to_string())
                .or_default()
                .entry(TransportKind::Shell)
                .or_default()
                .insert(device_id.to_string(), RegistryEntry::Shell(host));
        })?;
        Ok(changed)
    }

    /// Remove a device from one network, or from every network when `network` is `None`
    ///
    /// Returns how many entries were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be locked, read or written.
    pub fn forget(&self, network: Option<&str>, device_id: &str) -> Result<usize> {
        let (removed, _) = self.transact(|data| {
            let mut removed = 0;
            for (name, book) in data.iter_mut() {
                if network.is_some_and(|n| n != name) {
                    continue;
                }
                for devices in book.values_mut() {
                    if devices.remove(device_id).is_some() {
                        removed += 1;
                    }
                }
            }
            removed
        })?;
        Ok(removed)
    }

    /// Network identities with at least one known device
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn networks(&self) -> Result<Vec<String>> {
        Ok(self.load()?.into_keys().collect())
    }

    /// Bridge addresses known on a network for a transport kind
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn addresses(&self, network: &str, kind: TransportKind) -> Result<Vec<(String, String)>> {
        let data = self.load()?;
        Ok(data
            .get(network)
            .and_then(|book| book.get(&kind))
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|(id, entry)| match entry {
                        RegistryEntry::Address(addr) => Some((id.clone(), addr.clone())),
                        RegistryEntry::Shell(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Shell hosts known on a network
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn shell_hosts(&self, network: &str) -> Result<Vec<(String, ShellHost)>> {
        let data = self.load()?;
        Ok(data
            .get(network)
            .and_then(|book| book.get(&TransportKind::Shell))
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|(id, entry)| match entry {
                        RegistryEntry::Shell(host) => Some((id.clone(), host.clone())),
                        RegistryEntry::Address(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
