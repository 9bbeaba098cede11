use anyhow::Result;
use colored::Colorize;
use std::collections::HashSet;
use std::path::Path;

/// Tracks which configuration fields are recognised
pub struct ConfigValidator {
    /// Set of valid configuration fields that are recognized by devsync
    known_fields: HashSet<String>,
    /// Set of section names
    known_sections: HashSet<String>,
}

impl ConfigValidator {
    /// Create a new validator with known configuration fields
    #[must_use]
    pub fn new() -> Self {
        let known_fields: HashSet<String> =
            super::Config::KEYS.iter().map(|k| (*k).to_string()).collect();
        let known_sections = known_fields
            .iter()
            .filter_map(|k| k.split_once('.').map(|(s, _)| s.to_string()))
            .collect();

        Self {
            known_fields,
            known_sections,
        }
    }

    /// Unknown fields in a configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed
    pub fn unknown_fields(&self, config_path: &Path) -> Result<Vec<String>> {
        if !config_path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(config_path)?;
        let parsed: toml::Value = toml::from_str(&content)?;

        let mut unknown = Vec::new();
        self.check_table(&parsed, "", &mut unknown);
        Ok(unknown)
    }

    /// Validate a configuration file and warn about unknown fields
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed
    pub fn validate_config_file(&self, config_path: &Path) -> Result<()> {
        let unknown = self.unknown_fields(config_path)?;
        if !unknown.is_empty() {
            eprintln!("{}", "Configuration warnings:".yellow().bold());
            for field in unknown {
                eprintln!("  Unknown configuration field: {}", field.yellow());
            }
            eprintln!();
        }
        Ok(())
    }

    /// Recursively collects fields that are neither known keys nor sections
    fn check_table(&self, table: &toml::Value, prefix: &str, unknown: &mut Vec<String>) {
        let toml::Value::Table(map) = table else {
            return;
        };
        for (key, value) in map {
            let full_key = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };

            if self.known_fields.contains(&full_key) {
                continue;
            }
            if prefix.is_empty() && self.known_sections.contains(&full_key) {
                self.check_table(value, &full_key, unknown);
                continue;
            }
            unknown.push(full_key);
        }
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
