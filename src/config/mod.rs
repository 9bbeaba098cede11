/// TOML parsing and validation of the settings file
pub mod parser;
/// Sync rules file
pub mod rules;
/// Unknown-key warnings
pub mod validator;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file contents
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local state locations
    #[serde(default)]
    pub core: CoreConfig,

    /// Device bridge and shell client settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Change detection settings
    #[serde(default)]
    pub detect: DetectConfig,
}

/// `[core]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Local state: registry, baselines, locks
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Sync rules file; defaults to `<state_dir>/sync.json`
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
    /// Device registry file; defaults to `<state_dir>/devices.json`
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    /// Host private key shared by every device authentication
    #[serde(default = "default_credential_path")]
    pub credential_path: PathBuf,
}

/// `[transport]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Device bridge client, looked up on `PATH`
    #[serde(default = "default_adb_binary")]
    pub adb_binary: String,
    /// SSH client
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// Handshake bound; an unanswered trust dialog must not hang the run
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Wait after restarting or killing the bridge driver
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Port requested when enabling a device's network channel
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Device interface whose address is recorded
    #[serde(default = "default_network_interface")]
    pub network_interface: String,
    /// Fixed network identity instead of the gateway's hardware address
    #[serde(default)]
    pub network_identity: Option<String>,
}

/// `[detect]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Where baselines live on devices
    #[serde(default = "default_device_state_dir")]
    pub device_state_dir: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            rules_path: None,
            registry_path: None,
            credential_path: default_credential_path(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            adb_binary: default_adb_binary(),
            ssh_binary: default_ssh_binary(),
            auth_timeout_ms: default_auth_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            tcp_port: default_tcp_port(),
            network_interface: default_network_interface(),
            network_identity: None,
        }
    }
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            device_state_dir: default_device_state_dir(),
        }
    }
}

impl TransportConfig {
    /// Handshake bound as a duration
    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Settle delay as a duration
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Config {
    /// Effective sync rules path
    #[must_use]
    pub fn rules_path(&self) -> PathBuf {
        self.core
            .rules_path
            .clone()
            .unwrap_or_else(|| self.core.state_dir.join("sync.json"))
    }

    /// Effective device registry path
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.core
            .registry_path
            .clone()
            .unwrap_or_else(|| self.core.state_dir.join("devices.json"))
    }

    /// Directory for host-side baselines
    #[must_use]
    pub fn baselines_dir(&self) -> PathBuf {
        self.core.state_dir.join("baselines")
    }

    /// Load configuration from a file
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Cannot create parent directories
    /// - Cannot read or parse the configuration file
    /// - Configuration file contains invalid TOML
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            // Create default config if it doesn't exist
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        parser::parse_config_file(path)
    }

    /// Save configuration to a file
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Cannot create parent directories
    /// - Cannot write to the file
    /// - TOML serialization fails
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(toml_str.as_bytes())?;
        Ok(())
    }

    /// All settable keys, in display order
    pub const KEYS: &'static [&'static str] = &[
        "core.state_dir",
        "core.rules_path",
        "core.registry_path",
        "core.credential_path",
        "transport.adb_binary",
        "transport.ssh_binary",
        "transport.auth_timeout_ms",
        "transport.settle_delay_ms",
        "transport.tcp_port",
        "transport.network_interface",
        "transport.network_identity",
        "detect.device_state_dir",
    ];

    /// Get a configuration value by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let (section, name) = key.split_once('.')?;
        let path = |p: &Path| p.display().to_string();

        match (section, name) {
            ("core", "state_dir") => Some(path(&self.core.state_dir)),
            ("core", "rules_path") => Some(path(&self.rules_path())),
            ("core", "registry_path") => Some(path(&self.registry_path())),
            ("core", "credential_path") => Some(path(&self.core.credential_path)),
            ("transport", "adb_binary") => Some(self.transport.adb_binary.clone()),
            ("transport", "ssh_binary") => Some(self.transport.ssh_binary.clone()),
            ("transport", "auth_timeout_ms") => Some(self.transport.auth_timeout_ms.to_string()),
            ("transport", "settle_delay_ms") => Some(self.transport.settle_delay_ms.to_string()),
            ("transport", "tcp_port") => Some(self.transport.tcp_port.to_string()),
            ("transport", "network_interface") => Some(self.transport.network_interface.clone()),
            ("transport", "network_identity") => self.transport.network_identity.clone(),
            ("detect", "device_state_dir") => Some(self.detect.device_state_dir.clone()),
            _ => None,
        }
    }

    /// Set a configuration value by key
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The key format is invalid (must be section.key)
    /// - The key is unknown
    /// - The value is invalid for the key (e.g., zero port)
    pub fn set(&mut self, key: &str, value: String) -> Result<()> {
        let Some((section, name)) = key.split_once('.') else {
            return Err(anyhow::anyhow!("Invalid configuration key: {key}"));
        };

        match (section, name) {
            ("core", "state_dir") => self.core.state_dir = crate::utils::expand_tilde(&value)?,
            ("core", "rules_path") => {
                self.core.rules_path = Some(crate::utils::expand_tilde(&value)?);
            }
            ("core", "registry_path") => {
                self.core.registry_path = Some(crate::utils::expand_tilde(&value)?);
            }
            ("core", "credential_path") => {
                self.core.credential_path = crate::utils::expand_tilde(&value)?;
            }
            ("transport", "adb_binary") => self.transport.adb_binary = value,
            ("transport", "ssh_binary") => self.transport.ssh_binary = value,
            ("transport", "auth_timeout_ms") => {
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid number: {value}"))?;
                if ms == 0 {
                    return Err(anyhow::anyhow!("Authentication timeout must be positive"));
                }
                self.transport.auth_timeout_ms = ms;
            }
            ("transport", "settle_delay_ms") => {
                self.transport.settle_delay_ms = value
                    .parse()
                    .with_context(|| format!("Invalid number: {value}"))?;
            }
            ("transport", "tcp_port") => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Invalid port: {value}"))?;
                if port == 0 {
                    return Err(anyhow::anyhow!("Port must be between 1 and 65535"));
                }
                self.transport.tcp_port = port;
            }
            ("transport", "network_interface") => self.transport.network_interface = value,
            ("transport", "network_identity") => {
                self.transport.network_identity = Some(value.trim().to_lowercase());
            }
            ("detect", "device_state_dir") => {
                if !value.starts_with('/') {
                    return Err(anyhow::anyhow!("Device state directory must be absolute: {value}"));
                }
                self.detect.device_state_dir = value;
            }
            _ => return Err(anyhow::anyhow!("Unknown configuration key: {key}")),
        }
        Ok(())
    }

    /// Unset a configuration value by key
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The key format is invalid (must be section.key)
    /// - The key is unknown or cannot be unset
    pub fn unset(&mut self, key: &str) -> Result<()> {
        let Some((section, name)) = key.split_once('.') else {
            return Err(anyhow::anyhow!("Invalid configuration key: {key}"));
        };

        match (section, name) {
            ("core", "rules_path") => self.core.rules_path = None,
            ("core", "registry_path") => self.core.registry_path = None,
            ("transport", "network_identity") => self.transport.network_identity = None,
            _ => return Err(anyhow::anyhow!("Cannot unset configuration key: {key}")),
        }
        Ok(())
    }
}

// Default functions for serde
fn default_state_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    home.join(crate::DEFAULT_STATE_DIR)
}

fn default_credential_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    home.join(".android").join("adbkey")
}

fn default_adb_binary() -> String {
    "adb".to_string()
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

const fn default_auth_timeout_ms() -> u64 {
    2000
}

const fn default_settle_delay_ms() -> u64 {
    3000
}

const fn default_tcp_port() -> u16 {
    5555
}

fn default_network_interface() -> String {
    "wlan0".to_string()
}

fn default_device_state_dir() -> String {
    "/data/local/tmp/devsync".to_string()
}
