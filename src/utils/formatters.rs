use crate::detect::{ChangeKind, DirectoryChange, EntryChange};
use crate::utils::format_size;
use chrono::{DateTime, FixedOffset};
use colored::Colorize;

/// Returns the colored change sign
#[must_use]
pub fn colored_sign(kind: ChangeKind) -> String {
    let sign = kind.sign().to_string();
    match kind {
        ChangeKind::Added => sign.green().to_string(),
        ChangeKind::Removed => sign.red().to_string(),
        ChangeKind::Modified => sign.yellow().to_string(),
    }
}

/// Formats a listing timestamp in a human-readable format
#[must_use]
pub fn format_timestamp(timestamp: &DateTime<FixedOffset>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Formats one changed entry
#[must_use]
pub fn format_entry(entry: &EntryChange) -> String {
    format!(
        "{} {}  {}",
        colored_sign(entry.kind),
        entry.name,
        format!("{}, {}", format_size(entry.size), format_timestamp(&entry.modified)).dimmed()
    )
}

/// Formats a directory header line
#[must_use]
pub fn format_directory(path: &str, change: &DirectoryChange) -> String {
    match change {
        DirectoryChange::Whole(kind) => {
            format!("{} {}/ {}", colored_sign(*kind), path.bold(), format!("(directory {kind})").dimmed())
        }
        DirectoryChange::Entries(entries) => {
            format!("  {}/ {}", path.bold(), format!("({} changed)", entries.len()).dimmed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_entry() {
        colored::control::set_override(false);
        let entry = EntryChange {
            kind: ChangeKind::Modified,
            size: 2048,
            modified: DateTime::parse_from_rfc3339("2024-03-02T11:30:00+01:00").unwrap(),
            name: "photo.jpg".into(),
        };
        assert_eq!(format_entry(&entry), "~ photo.jpg  2.00 KB, 2024-03-02 11:30:00");
    }

    #[test]
    fn test_format_directory() {
        colored::control::set_override(false);
        assert_eq!(
            format_directory("/sdcard/old", &DirectoryChange::Whole(ChangeKind::Removed)),
            "- /sdcard/old/ (directory removed)"
        );
        assert_eq!(
            format_directory("/sdcard", &DirectoryChange::Entries(Vec::new())),
            "  /sdcard/ (0 changed)"
        );
    }
}
