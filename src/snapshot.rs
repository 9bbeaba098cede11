//! One-generation listing baselines.
//!
//! Each detection target keeps exactly two files on the side being listed:
//! `<label>.old`, the baseline, and `<label>.new`, the capture taken by the
//! current run. After a successful parse the capture replaces the baseline.

use crate::lock::sanitize;
use crate::transport::{Transport, quote};
use anyhow::{Context, Result, bail};
use tracing::debug;

/// Location of a baseline on one side of a sync pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStore {
    /// Directory holding the snapshot files
    directory: String,
    /// File stem, usually the peer's id
    label: String,
}

impl SnapshotStore {
    /// Store in `directory` for the peer called `label`
    #[must_use]
    pub fn new(directory: &str, label: &str) -> Self {
        Self {
            directory: directory.trim_end_matches('/').to_string(),
            label: sanitize(label),
        }
    }

    /// Path of the current baseline
    #[must_use]
    pub fn baseline_path(&self) -> String {
        format!("{}/{}.old", self.directory, self.label)
    }

    /// Path the next capture is written to
    #[must_use]
    pub fn capture_path(&self) -> String {
        format!("{}/{}.new", self.directory, self.label)
    }

    /// Create the directory and an empty baseline if none exists
    ///
    /// # Errors
    ///
    /// Returns an error if the remote side did not confirm the baseline.
    pub fn ensure_baseline(&self, transport: &dyn Transport) -> Result<()> {
        let command = format!(
            "mkdir -p {dir} && {{ test -e {old} || touch {old}; }} && echo ok",
            dir = quote(&self.directory),
            old = quote(&self.baseline_path()),
        );
        let output = transport
            .execute(&command)
            .with_context(|| format!("Failed to prepare baseline on {}", transport.id()))?;
        if output.trim() != "ok" {
            bail!(
                "Could not create baseline {} on {}",
                self.baseline_path(),
                transport.id()
            );
        }
        debug!(device = %transport.id(), baseline = %self.baseline_path(), "Baseline ready");
        Ok(())
    }

    /// Replace the baseline with the latest capture
    ///
    /// # Errors
    ///
    /// Returns an error if the rename could not be confirmed.
    pub fn promote(&self, transport: &dyn Transport) -> Result<()> {
        let command = format!(
            "mv -f {new} {old} && echo ok",
            new = quote(&self.capture_path()),
            old = quote(&self.baseline_path()),
        );
        let output = transport
            .execute(&command)
            .with_context(|| format!("Failed to promote capture on {}", transport.id()))?;
        if output.trim() != "ok" {
            bail!(
                "Could not replace baseline {} on {}",
                self.baseline_path(),
                transport.id()
            );
        }
        Ok(())
    }

    /// Raw baseline contents
    ///
    /// # Errors
    ///
    /// Returns an error if the baseline cannot be read.
    pub fn read_baseline(&self, transport: &dyn Transport) -> Result<Vec<u8>> {
        transport.read_file(&self.baseline_path())
    }

    /// Remove both snapshot files so the next run starts from scratch
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be run.
    pub fn reset(&self, transport: &dyn Transport) -> Result<()> {
        let command = format!(
            "rm -f {old} {new}",
            old = quote(&self.baseline_path()),
            new = quote(&self.capture_path()),
        );
        transport.execute(&command)?;
        Ok(())
    }
}
