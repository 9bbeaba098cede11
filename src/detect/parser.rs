//! Parser for filtered `ls -lR` diffs.
//!
//! The input is a unified diff between two recursive long listings, reduced
//! to directory headers and changed lines:
//!
//! ```text
//! --- /data/local/tmp/devsync/host.old
//! +++ /data/local/tmp/devsync/host.new
//!  /sdcard/DCIM:
//! --rw-rw---- 1 u0_a12 media_rw 100 2024-03-01 10:00:00.000000000 +0100 c.txt
//! +-rw-rw---- 1 u0_a12 media_rw 20 2024-03-02 11:30:00.000000000 +0100 b.txt
//! +/sdcard/DCIM/new:
//! +-rw-rw---- 1 u0_a12 media_rw 5 2024-03-02 11:31:00.000000000 +0100 x.jpg
//! +
//! ```
//!
//! Every header opens a block. A `+`/`-` header means the whole directory
//! appeared or disappeared; a ` ` header means the directory persisted and
//! its changed entries follow.

use super::changeset::{ChangeKind, ChangeSet, EntryChange, join};
use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Timestamp layout produced by `ls --full-time`
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

/// File type characters accepted in the mode column
const FILE_TYPES: &str = "-dlbcps";

/// A listing line that does not follow the expected grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number within the diff output
    pub line_number: usize,
    /// Offending line after whitespace normalisation
    pub line: String,
    /// What was wrong with it
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unexpected listing line {}: {} ({})",
            self.line_number, self.line, self.reason
        )
    }
}

impl std::error::Error for ParseError {}

/// One parsed long-format listing line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Diff sign (`' '`, `'+'` or `'-'`)
    pub sign: char,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Size column (zero for device nodes)
    pub size: u64,
    /// Modification time
    pub modified: DateTime<FixedOffset>,
    /// Entry name, without any symlink target
    pub name: String,
}

/// Collapse runs of whitespace into single spaces
#[must_use]
pub fn normalize(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut previous_space = false;
    for c in line.chars() {
        if c.is_whitespace() {
            if !previous_space {
                out.push(' ');
            }
            previous_space = true;
        } else {
            out.push(c);
            previous_space = false;
        }
    }
    out
}

/// Split off the next space-separated field
fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    if rest.is_empty() {
        return None;
    }
    match rest.split_once(' ') {
        Some((field, tail)) => {
            *rest = tail;
            Some(field)
        }
        None => {
            let field = *rest;
            *rest = "";
            Some(field)
        }
    }
}

fn is_mode(field: &str) -> bool {
    let mut chars = field.chars();
    let Some(kind) = chars.next() else {
        return false;
    };
    // Permission bits may carry a trailing ACL/SELinux marker
    let perms: Vec<char> = chars.collect();
    FILE_TYPES.contains(kind)
        && (perms.len() == 9 || perms.len() == 10)
        && perms[..9]
            .iter()
            .all(|c| matches!(c, 'r' | 'w' | 'x' | '-' | 's' | 'S' | 't' | 'T'))
}

/// Parse one normalised listing line with its leading diff sign
///
/// Returns a description of the first mismatch on failure.
pub fn parse_entry(line: &str) -> Result<ListingEntry, String> {
    let mut chars = line.chars();
    let sign = chars.next().ok_or("empty line")?;
    if !matches!(sign, ' ' | '+' | '-') {
        return Err(format!("unknown diff sign '{sign}'"));
    }
    let mut rest = chars.as_str();

    let mode = next_field(&mut rest).ok_or("missing mode")?;
    if !is_mode(mode) {
        return Err(format!("invalid mode '{mode}'"));
    }
    let links = next_field(&mut rest).ok_or("missing link count")?;
    if links.parse::<u64>().is_err() {
        return Err(format!("invalid link count '{links}'"));
    }
    next_field(&mut rest).ok_or("missing owner")?;
    next_field(&mut rest).ok_or("missing group")?;

    let size_field = next_field(&mut rest).ok_or("missing size")?;
    let size = if let Some(major) = size_field.strip_suffix(',') {
        // Device nodes list "major, minor" instead of a size
        let minor = next_field(&mut rest).ok_or("missing device minor")?;
        if major.parse::<u64>().is_err() || minor.parse::<u64>().is_err() {
            return Err(format!("invalid device numbers '{major}, {minor}'"));
        }
        0
    } else {
        size_field
            .parse::<u64>()
            .map_err(|_| format!("invalid size '{size_field}'"))?
    };

    let date = next_field(&mut rest).ok_or("missing date")?;
    let time = next_field(&mut rest).ok_or("missing time")?;
    let zone = next_field(&mut rest).ok_or("missing time zone")?;
    let stamp = format!("{date} {time} {zone}");
    let modified = DateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT)
        .map_err(|e| format!("invalid timestamp '{stamp}': {e}"))?;

    if rest.is_empty() {
        return Err("missing name".to_string());
    }
    let kind = mode.chars().next().unwrap_or('-');
    let name = match (kind, rest.split_once(" -> ")) {
        ('l', Some((name, _target))) => name,
        _ => rest,
    };

    Ok(ListingEntry {
        sign,
        is_directory: kind == 'd',
        size,
        modified,
        name: name.to_string(),
    })
}

/// Directory block being accumulated
struct Block {
    sign: char,
    path: String,
    records: Vec<EntryChange>,
    by_name: HashMap<String, usize>,
    /// Sub-directory name -> signs seen for it
    directories: Vec<(String, Vec<char>)>,
}

impl Block {
    fn new(sign: char, path: &str) -> Self {
        Self {
            sign,
            path: path.to_string(),
            records: Vec::new(),
            by_name: HashMap::new(),
            directories: Vec::new(),
        }
    }

    fn add_file(&mut self, kind: ChangeKind, entry: ListingEntry) {
        if let Some(&index) = self.by_name.get(&entry.name) {
            let record = &mut self.records[index];
            // The merged record carries the added side's size and timestamp
            let take_new = kind == ChangeKind::Added || record.kind != ChangeKind::Added;
            if record.kind != kind {
                record.kind = ChangeKind::Modified;
            }
            if take_new {
                record.size = entry.size;
                record.modified = entry.modified;
            }
            return;
        }
        self.by_name.insert(entry.name.clone(), self.records.len());
        self.records.push(EntryChange {
            kind,
            size: entry.size,
            modified: entry.modified,
            name: entry.name,
        });
    }

    fn add_directory(&mut self, sign: char, name: String) {
        match self.directories.iter_mut().find(|(n, _)| *n == name) {
            Some((_, signs)) => signs.push(sign),
            None => self.directories.push((name, vec![sign])),
        }
    }

    fn finish(self, changes: &mut ChangeSet) {
        if self.sign != ' ' {
            if let Some(kind) = ChangeKind::from_sign(self.sign)
                && !changes.record_whole(&self.path, kind)
            {
                trace!(path = %self.path, "Directory change implied by ancestor");
            }
            return;
        }
        if changes.has_whole_ancestor(&self.path) {
            return;
        }
        changes.record_entries(&self.path, self.records);
        for (name, signs) in self.directories {
            // Present on both sides: only its metadata changed
            if signs.contains(&'+') && signs.contains(&'-') {
                continue;
            }
            if let Some(kind) = signs.first().copied().and_then(ChangeKind::from_sign) {
                changes.record_whole(&join(&self.path, &name), kind);
            }
        }
    }
}

/// Parse filtered diff output into a change set
///
/// # Errors
///
/// Returns a [`ParseError`] for the first line that is neither a directory
/// header nor a listing entry. No partial result is returned.
pub fn parse_diff(output: &str) -> Result<ChangeSet, ParseError> {
    let mut changes = ChangeSet::new();
    if output.trim().is_empty() {
        return Ok(changes);
    }

    let mut current: Option<Block> = None;
    for (index, raw) in output.lines().enumerate() {
        let line_number = index + 1;
        if line_number <= 2 && (raw.starts_with("--- ") || raw.starts_with("+++ ")) {
            continue;
        }
        if raw.starts_with("@@") || raw.starts_with('\\') {
            continue;
        }

        let line = normalize(raw);
        let body = line.get(1..).unwrap_or("").trim();
        if body.is_empty() || body.starts_with("total ") {
            continue;
        }

        let error = |reason: String| ParseError {
            line_number,
            line: line.clone(),
            reason,
        };

        match parse_entry(&line) {
            Ok(entry) => {
                let block = current
                    .as_mut()
                    .ok_or_else(|| error("entry before any directory header".to_string()))?;
                if block.sign != ' ' || entry.sign == ' ' {
                    continue;
                }
                let Some(kind) = ChangeKind::from_sign(entry.sign) else {
                    continue;
                };
                if entry.is_directory {
                    block.add_directory(entry.sign, entry.name);
                } else {
                    block.add_file(kind, entry);
                }
            }
            Err(reason) => {
                let sign = line.chars().next().unwrap_or(' ');
                let Some(path) = body.strip_suffix(':').filter(|_| matches!(sign, ' ' | '+' | '-'))
                else {
                    return Err(error(reason));
                };
                if let Some(done) = current.take() {
                    done.finish(&mut changes);
                }
                current = Some(Block::new(sign, path));
            }
        }
    }
    if let Some(done) = current.take() {
        done.finish(&mut changes);
    }
    Ok(changes)
}
