//! Sync rules: which host roots pair with which device roots.
//!
//! Stored as a JSON array:
//!
//! ```json
//! [
//!   {
//!     "uniqueLocal": "copy",
//!     "newLocal": "copy",
//!     "newRemote": "copy",
//!     "uniqueRemote": "ignore",
//!     "local": "~/Pictures/Phone",
//!     "remote": "/sdcard/DCIM",
//!     "excl": [".thumbnails", "*.tmp"]
//!   }
//! ]
//! ```
//!
//! Policies are recorded for each rule but not applied here; detection only
//! consumes the roots and exclusions.

use anyhow::{Context, Result, bail};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// What to do with a class of detected change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Copy to the other side
    Copy,
    /// Move to the other side
    Move,
    /// Delete from its side
    Delete,
    /// Leave alone
    #[default]
    Ignore,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Ignore => "ignore",
        };
        f.write_str(name)
    }
}

/// One host root paired with one device root
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRule {
    /// Entries only present on the host
    pub unique_local: Policy,
    /// Entries new on the host since the last run
    pub new_local: Policy,
    /// Entries new on the device since the last run
    pub new_remote: Policy,
    /// Entries only present on the device
    pub unique_remote: Policy,
    /// Host root
    #[serde(default)]
    pub local: String,
    /// Device root
    #[serde(default)]
    pub remote: String,
    /// Exclusion globs, relative to the root unless absolute
    #[serde(default)]
    pub excl: Vec<String>,
}

/// Side of a sync pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// This host
    Local,
    /// The device
    Remote,
}

impl SyncRule {
    /// Root on one side; empty when unset
    #[must_use]
    pub fn root(&self, side: Side) -> &str {
        match side {
            Side::Local => self.local.trim(),
            Side::Remote => self.remote.trim(),
        }
    }

    /// Compile exclusions against the root on `side`
    fn exclusions(&self, side: Side) -> Result<Vec<Pattern>> {
        let root = self.root(side).trim_end_matches('/');
        self.excl
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| {
                let p = p.trim();
                let anchored = if p.starts_with('/') {
                    p.to_string()
                } else {
                    format!("{root}/{p}")
                };
                Pattern::new(&anchored).with_context(|| format!("Invalid exclusion pattern: {p}"))
            })
            .collect()
    }
}

/// The whole rules file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncConfiguration {
    rules: Vec<SyncRule>,
}

impl SyncConfiguration {
    /// Configuration holding only the placeholder rule
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            rules: vec![SyncRule::default()],
        }
    }

    /// Load rules; a missing file is created with a placeholder rule
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or created, or an
    /// exclusion is not a valid glob.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::placeholder();
            config.save(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sync rules: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse sync rules: {}", path.display()))?;
        if config.rules.is_empty() {
            config.rules.push(SyncRule::default());
        }
        for rule in &mut config.rules {
            if rule.local.trim().starts_with('~') {
                rule.local = crate::utils::expand_tilde(rule.local.trim())?
                    .display()
                    .to_string();
            }
        }

        // Surface bad globs at load time rather than mid-run
        for side in [Side::Local, Side::Remote] {
            config.exclusions(side)?;
        }
        Ok(config)
    }

    /// Save rules as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write sync rules: {}", path.display()))
    }

    /// All rules, placeholders included
    #[must_use]
    pub fn rules(&self) -> &[SyncRule] {
        &self.rules
    }

    /// Rules with a root on `side`
    pub fn active(&self, side: Side) -> impl Iterator<Item = &SyncRule> {
        self.rules.iter().filter(move |r| !r.root(side).is_empty())
    }

    /// Roots on `side` consumed by detection, in rule order without duplicates
    #[must_use]
    pub fn roots(&self, side: Side) -> Vec<String> {
        let mut roots: Vec<String> = Vec::new();
        for rule in self.active(side) {
            let root = rule.root(side).to_string();
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }

    /// Compiled exclusions of every active rule on `side`
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is not a valid glob.
    pub fn exclusions(&self, side: Side) -> Result<Vec<Pattern>> {
        let mut patterns = Vec::new();
        for rule in self.active(side) {
            patterns.extend(rule.exclusions(side)?);
        }
        Ok(patterns)
    }

    /// Reject rules with only one root set
    ///
    /// # Errors
    ///
    /// Returns an error naming the first half-configured rule.
    pub fn check_complete(&self) -> Result<()> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.root(Side::Local).is_empty() != rule.root(Side::Remote).is_empty() {
                bail!(
                    "Sync rule {} has only one root; set both \"local\" and \"remote\"",
                    index + 1
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RULES: &str = r#"[
  {
    "uniqueLocal": "copy",
    "newLocal": "move",
    "newRemote": "delete",
    "uniqueRemote": "ignore",
    "local": "/home/u/Phone",
    "remote": "/sdcard/DCIM",
    "excl": [".thumbnails", "*.tmp", "/sdcard/DCIM/Camera/cache"]
  },
  {
    "uniqueLocal": "ignore",
    "newLocal": "ignore",
    "newRemote": "ignore",
    "uniqueRemote": "ignore",
    "local": "",
    "remote": "",
    "excl": []
  }
]"#;

    #[test]
    fn test_missing_file_gets_placeholder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        let config = SyncConfiguration::load(&path).unwrap();

        assert_eq!(config.rules().len(), 1);
        assert!(config.roots(Side::Local).is_empty());
        assert!(config.roots(Side::Remote).is_empty());

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written[0]["uniqueLocal"], "ignore");
        assert_eq!(written[0]["local"], "");
    }

    #[test]
    fn test_roots_skip_placeholders() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, RULES).unwrap();

        let config = SyncConfiguration::load(&path).unwrap();
        assert_eq!(config.rules().len(), 2);
        assert_eq!(config.rules()[0].new_local, Policy::Move);
        assert_eq!(config.roots(Side::Local), vec!["/home/u/Phone".to_string()]);
        assert_eq!(config.roots(Side::Remote), vec!["/sdcard/DCIM".to_string()]);
        config.check_complete().unwrap();
    }

    #[test]
    fn test_local_root_tilde_expanded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, RULES.replace("/home/u/Phone", "~/Phone")).unwrap();

        let config = SyncConfiguration::load(&path).unwrap();
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            config.roots(Side::Local),
            vec![home.join("Phone").display().to_string()]
        );
    }

    #[test]
    fn test_exclusions_are_anchored_per_side() {
        let config: SyncConfiguration = serde_json::from_str(RULES).unwrap();
        let remote = config.exclusions(Side::Remote).unwrap();
        assert!(remote.iter().any(|p| p.matches("/sdcard/DCIM/.thumbnails")));
        assert!(remote.iter().any(|p| p.matches("/sdcard/DCIM/a/b.tmp")));
        assert!(remote.iter().any(|p| p.matches("/sdcard/DCIM/Camera/cache")));
        assert!(!remote.iter().any(|p| p.matches("/sdcard/Music/x.tmp")));

        let local = config.exclusions(Side::Local).unwrap();
        assert!(local.iter().any(|p| p.matches("/home/u/Phone/.thumbnails")));
    }

    #[test]
    fn test_invalid_policy_and_glob() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");

        std::fs::write(&path, RULES.replace("\"move\"", "\"mirror\"")).unwrap();
        assert!(SyncConfiguration::load(&path).is_err());

        std::fs::write(&path, RULES.replace("*.tmp", "[unclosed")).unwrap();
        assert!(SyncConfiguration::load(&path).is_err());
    }

    #[test]
    fn test_half_configured_rule() {
        let rule = SyncRule {
            remote: "/sdcard/DCIM".into(),
            ..SyncRule::default()
        };
        let config = SyncConfiguration { rules: vec![rule] };
        assert!(config.check_complete().is_err());
    }
}
