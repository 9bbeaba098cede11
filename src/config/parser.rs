use super::Config;
use anyhow::{Context, Result};
use std::path::Path;

/// Read, parse and validate a configuration file
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or holds
/// out-of-range values.
pub fn parse_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config_str(&content)
}

fn parse_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse TOML config")?;

    // Validate and return validation errors directly without wrapping
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.transport.auth_timeout_ms == 0 {
        anyhow::bail!("Authentication timeout must be positive");
    }

    if config.transport.tcp_port == 0 {
        anyhow::bail!("Port must be between 1 and 65535");
    }

    if !config.detect.device_state_dir.starts_with('/') {
        anyhow::bail!(
            "Device state directory must be absolute: {}",
            config.detect.device_state_dir
        );
    }

    if config.transport.adb_binary.trim().is_empty() || config.transport.ssh_binary.trim().is_empty() {
        anyhow::bail!("Client binaries cannot be empty");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_valid_config() {
        let toml_content = r#"
[core]
state_dir = "/var/lib/devsync"

[transport]
adb_binary = "/opt/platform-tools/adb"
auth_timeout_ms = 1500
tcp_port = 5556
network_identity = "home"

[detect]
device_state_dir = "/sdcard/.devsync"
"#;

        let config = parse_config_str(toml_content).unwrap();
        assert_eq!(config.transport.tcp_port, 5556);
        assert_eq!(config.transport.network_identity.as_deref(), Some("home"));
        assert_eq!(config.detect.device_state_dir, "/sdcard/.devsync");
        assert_eq!(
            config.registry_path(),
            std::path::PathBuf::from("/var/lib/devsync/devices.json")
        );
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config_str("").unwrap();
        // Should use defaults
        assert_eq!(config.transport.settle_delay_ms, 3000);
        assert_eq!(config.transport.network_interface, "wlan0");
    }

    #[test]
    fn test_parse_malformed_toml() {
        let malformed = r#"
[core
state_dir = "~/.devsync"
"#;
        let result = parse_config_str(malformed);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse TOML")
        );
    }

    #[test]
    fn test_parse_zero_timeout() {
        let invalid = r#"
[transport]
auth_timeout_ms = 0
"#;
        assert!(parse_config_str(invalid).is_err());
    }

    #[test]
    fn test_parse_relative_device_dir() {
        let invalid = r#"
[detect]
device_state_dir = "devsync"
"#;
        assert!(parse_config_str(invalid).is_err());
    }

    #[test]
    fn test_parse_invalid_data_types() {
        let invalid = r#"
[transport]
tcp_port = "not_a_number"
"#;
        assert!(parse_config_str(invalid).is_err());
    }

    #[test]
    fn test_parse_port_out_of_range() {
        let invalid = r#"
[transport]
tcp_port = 70000
"#;
        assert!(parse_config_str(invalid).is_err());
    }

    #[test]
    fn test_parse_file_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.transport.ssh_binary = "/usr/bin/ssh".to_string();
        config.save(&config_path)?;

        let loaded = parse_config_file(&config_path)?;
        assert_eq!(loaded.transport.ssh_binary, "/usr/bin/ssh");
        Ok(())
    }
}
