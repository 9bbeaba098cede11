//! # Change Detection
//!
//! Finds what changed under a set of roots since the previous run by
//! diffing two recursive long listings taken on the side being watched.
//!
//! One composed shell command does the work remotely:
//!
//! 1. `ls -lR --full-time` over every root, written to the capture file
//! 2. `diff -U <n>` against the baseline, with enough context that every
//!    directory header survives
//! 3. `grep` down to headers and changed lines, followed by a trailer line
//!    carrying the exit status of `diff`
//!
//! The filtered diff is parsed locally ([`parser`]) into a [`ChangeSet`].
//! [`compare`] stops there; [`commit`] then replaces the baseline with the
//! capture ([`SnapshotStore::promote`]). [`detect`] does both.

pub mod changeset;
pub mod parser;

pub use changeset::{ChangeKind, ChangeSet, DirectoryChange, EntryChange};
pub use parser::ParseError;

use crate::snapshot::SnapshotStore;
use crate::transport::{Transport, quote};
use anyhow::{Context, Result, anyhow, bail};
use tracing::{Level, debug, info, span};

/// Prefix of the trailer line holding the exit status of `diff`
pub const DIFF_STATUS_PREFIX: &str = "devsync-diff-exit=";

/// Build the listing and diff command for `roots`
#[must_use]
pub fn listing_command(roots: &[String], store: &SnapshotStore) -> String {
    let roots = roots.iter().map(|r| quote(r)).collect::<Vec<_>>().join(" ");
    let old = quote(&store.baseline_path());
    let new = quote(&store.capture_path());
    format!(
        "LC_ALL=C ls -lR --full-time {roots} 2>/dev/null | grep -v '^total ' > {new}; \
         n=$(cat {old} {new} | wc -l); \
         {{ diff -U \"$n\" {old} {new}; echo \"{DIFF_STATUS_PREFIX}$?\"; }} \
         | grep -E '^[+-]|:$|^{DIFF_STATUS_PREFIX}'"
    )
}

/// Split the status trailer off the command output
///
/// `diff` exits with 0 (same) or 1 (different); anything else means the
/// comparison did not happen and the output cannot be trusted.
fn strip_status(output: &str) -> Result<&str> {
    let trimmed = output.trim_end_matches('\n');
    let (body, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..=pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    let status = last
        .strip_prefix(DIFF_STATUS_PREFIX)
        .ok_or_else(|| anyhow!("Listing output ended without the diff status"))?;
    let status: i32 = status
        .trim()
        .parse()
        .with_context(|| format!("Malformed diff status: {status}"))?;
    if status > 1 {
        bail!("diff failed with exit status {status}");
    }
    Ok(body)
}

/// Changes under `roots` on `transport` since the baseline in `store`
///
/// The capture is left next to the baseline; call [`commit`] to make it the
/// new baseline. An empty root list yields an empty change set without
/// touching the transport.
///
/// # Errors
///
/// Returns an error if a command fails, `diff` reports trouble, or the
/// listing cannot be parsed. A [`ParseError`] can be recovered with
/// `downcast_ref`.
pub fn compare(transport: &dyn Transport, roots: &[String], store: &SnapshotStore) -> Result<ChangeSet> {
    let span = span!(Level::DEBUG, "detect", device = %transport.id());
    let _guard = span.enter();

    if roots.is_empty() {
        debug!("No sync roots configured");
        return Ok(ChangeSet::new());
    }

    store.ensure_baseline(transport)?;

    let output = transport
        .execute(&listing_command(roots, store))
        .with_context(|| format!("Failed to list roots on {}", transport.id()))?;
    debug!(bytes = output.len(), "Listing diff received");

    let body = strip_status(&output)
        .with_context(|| format!("Failed to compare listings on {}", transport.id()))?;
    let changes = parser::parse_diff(body)
        .with_context(|| format!("Failed to parse listing from {}", transport.id()))?;

    info!(directories = changes.len(), records = changes.record_count(), "Detection finished");
    Ok(changes)
}

/// Replace the baseline with the capture taken by [`compare`]
///
/// Nothing happens for an empty root list, which never captures.
///
/// # Errors
///
/// Returns an error if the capture cannot be moved.
pub fn commit(transport: &dyn Transport, roots: &[String], store: &SnapshotStore) -> Result<()> {
    if roots.is_empty() {
        return Ok(());
    }
    store.promote(transport)
}

/// Detect changes under `roots` and make the capture the new baseline
///
/// # Errors
///
/// As [`compare`]; the baseline is left untouched on error.
pub fn detect(transport: &dyn Transport, roots: &[String], store: &SnapshotStore) -> Result<ChangeSet> {
    let changes = compare(transport, roots, store)?;
    commit(transport, roots, store)?;
    Ok(changes)
}
