//! # Sync Coordinator
//!
//! Runs change detection on both sides of a sync pair. The host keeps one
//! baseline per device under the state directory; each device keeps one
//! baseline per host under its own state directory. Each side is diffed
//! against its own baseline, so the two change sets are independent.
//!
//! Policies from the sync rules are not applied; callers receive the two
//! change sets and decide what to do with them.

use crate::config::rules::{Side, SyncConfiguration};
use crate::detect::{self, ChangeSet};
use crate::lock::{LockTarget, StateLock};
use crate::snapshot::SnapshotStore;
use crate::transport::Transport;
use anyhow::{Context, Result};
use glob::Pattern;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{Level, info, span};

/// Changes found on both sides for one device
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Device id
    pub device: String,
    /// Changes under the host roots
    pub host_changes: ChangeSet,
    /// Changes under the device roots
    pub device_changes: ChangeSet,
}

impl SyncReport {
    /// Whether neither side changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.host_changes.is_empty() && self.device_changes.is_empty()
    }
}

/// Pairs host and device detection according to the sync rules
pub struct SyncCoordinator<'a> {
    rules: &'a SyncConfiguration,
    /// Host state directory (locks, host-side baselines)
    state_dir: PathBuf,
    /// Directory on devices holding their baselines
    device_state_dir: String,
}

impl<'a> SyncCoordinator<'a> {
    /// Coordinator for `rules`
    #[must_use]
    pub fn new(rules: &'a SyncConfiguration, state_dir: &Path, device_state_dir: &str) -> Self {
        Self {
            rules,
            state_dir: state_dir.to_path_buf(),
            device_state_dir: device_state_dir.to_string(),
        }
    }

    /// Baseline of the host roots kept for `device_id`
    #[must_use]
    pub fn host_store(&self, device_id: &str) -> SnapshotStore {
        let dir = self.state_dir.join("baselines");
        SnapshotStore::new(&dir.to_string_lossy(), device_id)
    }

    /// Baseline of the device roots kept on the device for `host_id`
    #[must_use]
    pub fn device_store(&self, host_id: &str) -> SnapshotStore {
        SnapshotStore::new(&self.device_state_dir, host_id)
    }

    /// Detect changes on both sides
    ///
    /// The device side is compared first, then the host side. Baselines are
    /// promoted only once both sides have been compared, so a failure on
    /// either side leaves both baselines as they were and the next run
    /// reports everything again.
    ///
    /// # Errors
    ///
    /// Returns an error if the detection lock is held elsewhere, a command
    /// fails, or a listing cannot be parsed.
    pub fn run(&self, host: &dyn Transport, device: &dyn Transport, device_id: &str) -> Result<SyncReport> {
        let span = span!(Level::INFO, "sync_pair", device = %device_id, host = %host.id());
        let _guard = span.enter();

        let _lock = StateLock::acquire(&self.state_dir, &LockTarget::Detection(device_id.to_string()))?;

        let device_roots = self.rules.roots(Side::Remote);
        let device_store = self.device_store(host.id());
        let host_roots = self.rules.roots(Side::Local);
        let host_store = self.host_store(device_id);
        let device_exclusions = self.rules.exclusions(Side::Remote)?;
        let host_exclusions = self.host_exclusions()?;

        let mut device_changes = detect::compare(device, &device_roots, &device_store)
            .with_context(|| format!("Detection failed on device {device_id}"))?;
        let mut host_changes = detect::compare(host, &host_roots, &host_store)
            .with_context(|| format!("Detection failed on host for {device_id}"))?;

        detect::commit(device, &device_roots, &device_store)
            .with_context(|| format!("Failed to update baseline on device {device_id}"))?;
        detect::commit(host, &host_roots, &host_store)
            .with_context(|| format!("Failed to update host baseline for {device_id}"))?;

        device_changes.exclude(&device_exclusions);
        host_changes.exclude(&host_exclusions);

        info!(
            host = host_changes.record_count(),
            device = device_changes.record_count(),
            "Pair detection finished"
        );
        Ok(SyncReport {
            device: device_id.to_string(),
            host_changes,
            device_changes,
        })
    }

    /// Host exclusions from the rules, plus the state directory itself
    ///
    /// A host root may contain the state directory, whose baselines and
    /// locks change on every run.
    fn host_exclusions(&self) -> Result<Vec<Pattern>> {
        let mut patterns = self.rules.exclusions(Side::Local)?;
        let state_dir = self.state_dir.to_string_lossy();
        let state_dir = state_dir.trim_end_matches('/');
        if !state_dir.is_empty() {
            patterns.push(
                Pattern::new(&Pattern::escape(state_dir))
                    .with_context(|| format!("Invalid state directory: {state_dir}"))?,
            );
        }
        Ok(patterns)
    }

    /// Drop both baselines so the next run reports everything as added
    ///
    /// # Errors
    ///
    /// Returns an error if the detection lock is held elsewhere or a
    /// removal command fails.
    pub fn reset(&self, host: &dyn Transport, device: &dyn Transport, device_id: &str) -> Result<()> {
        let _lock = StateLock::acquire(&self.state_dir, &LockTarget::Detection(device_id.to_string()))?;
        self.device_store(host.id()).reset(device)?;
        self.host_store(device_id).reset(host)?;
        info!(device = %device_id, "Baselines reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::rules::SyncRule;
    use std::cell::RefCell;

    /// Side that answers every listing with a fixed diff
    struct Scripted {
        name: &'static str,
        diff: &'static str,
        commands: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn new(name: &'static str, diff: &'static str) -> Self {
            Self {
                name,
                diff,
                commands: RefCell::new(Vec::new()),
            }
        }
    }

    impl Transport for Scripted {
        fn id(&self) -> &str {
            self.name
        }

        fn execute(&self, command: &str) -> Result<String> {
            self.commands.borrow_mut().push(command.to_string());
            if command.contains("ls -lR") {
                Ok(self.diff.to_string())
            } else if command.starts_with("rm") {
                Ok(String::new())
            } else {
                Ok("ok\n".to_string())
            }
        }

        fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn write_file(&self, _path: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    const DEVICE_DIFF: &str = "\
--- a
+++ b
 /sdcard/DCIM:
+-rw-rw---- 1 u0 media 20 2024-03-02 11:30:00 +0100 b.jpg
+-rw-rw---- 1 u0 media 20 2024-03-02 11:30:00 +0100 b.tmp
devsync-diff-exit=1
";

    const SAME: &str = "devsync-diff-exit=0\n";

    fn rules() -> SyncConfiguration {
        let json = serde_json::to_string(&vec![SyncRule {
            local: "/home/u/Phone".into(),
            remote: "/sdcard/DCIM".into(),
            excl: vec!["*.tmp".into()],
            ..SyncRule::default()
        }])
        .unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_both_sides_detected_with_exclusions() {
        let temp = tempfile::TempDir::new().unwrap();
        let rules = rules();
        let coordinator = SyncCoordinator::new(&rules, temp.path(), "/data/local/tmp/devsync");
        let host = Scripted::new("laptop", SAME);
        let device = Scripted::new("R58M", DEVICE_DIFF);

        let report = coordinator.run(&host, &device, "R58M").unwrap();
        assert!(report.host_changes.is_empty());
        assert_eq!(report.device_changes.record_count(), 1);

        // Each side lists only its own roots and keeps its own baseline
        let device_commands = device.commands.borrow();
        assert!(device_commands.iter().any(|c| c.contains("ls -lR --full-time /sdcard/DCIM")));
        assert!(device_commands.iter().any(|c| c.contains("/data/local/tmp/devsync/laptop.old")));
        let host_commands = host.commands.borrow();
        assert!(host_commands.iter().any(|c| c.contains("ls -lR --full-time /home/u/Phone")));
        assert!(host_commands.iter().any(|c| c.contains("baselines/R58M.old")));
    }

    #[test]
    fn test_failing_side_promotes_neither_baseline() {
        let temp = tempfile::TempDir::new().unwrap();
        let rules = rules();
        let coordinator = SyncCoordinator::new(&rules, temp.path(), "/data/local/tmp/devsync");
        let host = Scripted::new("laptop", "--- a\n+++ b\nnot a listing\ndevsync-diff-exit=1\n");
        let device = Scripted::new("R58M", DEVICE_DIFF);

        assert!(coordinator.run(&host, &device, "R58M").is_err());
        assert!(!device.commands.borrow().iter().any(|c| c.starts_with("mv")));
        assert!(!host.commands.borrow().iter().any(|c| c.starts_with("mv")));
    }

    #[test]
    fn test_both_baselines_promoted_after_success() {
        let temp = tempfile::TempDir::new().unwrap();
        let rules = rules();
        let coordinator = SyncCoordinator::new(&rules, temp.path(), "/data/local/tmp/devsync");
        let host = Scripted::new("laptop", SAME);
        let device = Scripted::new("R58M", DEVICE_DIFF);

        coordinator.run(&host, &device, "R58M").unwrap();
        assert!(device.commands.borrow().last().unwrap().starts_with("mv"));
        assert!(host.commands.borrow().last().unwrap().starts_with("mv"));
    }

    #[test]
    fn test_host_exclusions_cover_state_dir() {
        let rules = rules();
        let coordinator = SyncCoordinator::new(&rules, Path::new("/home/u/Phone/[state]"), "/data/local/tmp/devsync");
        let patterns = coordinator.host_exclusions().unwrap();

        assert!(patterns.iter().any(|p| p.matches("/home/u/Phone/[state]")));
        assert!(!patterns.iter().any(|p| p.matches("/home/u/Phone/s")));
        assert!(patterns.iter().any(|p| p.matches("/home/u/Phone/x.tmp")));
    }

    #[test]
    fn test_placeholder_rules_issue_no_listing() {
        let temp = tempfile::TempDir::new().unwrap();
        let rules = SyncConfiguration::placeholder();
        let coordinator = SyncCoordinator::new(&rules, temp.path(), "/data/local/tmp/devsync");
        let host = Scripted::new("laptop", SAME);
        let device = Scripted::new("R58M", DEVICE_DIFF);

        let report = coordinator.run(&host, &device, "R58M").unwrap();
        assert!(report.is_empty());
        assert!(host.commands.borrow().is_empty());
        assert!(device.commands.borrow().is_empty());
    }

    #[test]
    fn test_concurrent_run_for_same_device_is_refused() {
        let temp = tempfile::TempDir::new().unwrap();
        let rules = rules();
        let coordinator = SyncCoordinator::new(&rules, temp.path(), "/data/local/tmp/devsync");
        let _held = StateLock::acquire(temp.path(), &LockTarget::Detection("R58M".into())).unwrap();

        let host = Scripted::new("laptop", SAME);
        let device = Scripted::new("R58M", DEVICE_DIFF);
        assert!(coordinator.run(&host, &device, "R58M").is_err());
    }

    #[test]
    fn test_reset_removes_both_baselines() {
        let temp = tempfile::TempDir::new().unwrap();
        let rules = rules();
        let coordinator = SyncCoordinator::new(&rules, temp.path(), "/data/local/tmp/devsync");
        let host = Scripted::new("laptop", SAME);
        let device = Scripted::new("R58M", "");

        coordinator.reset(&host, &device, "R58M").unwrap();
        assert!(device.commands.borrow()[0].contains("/data/local/tmp/devsync/laptop.old"));
        assert!(host.commands.borrow()[0].contains("R58M.old"));
    }
}
