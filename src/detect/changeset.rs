use chrono::{DateTime, FixedOffset};
use glob::Pattern;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of change for a directory or entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present only in the new listing
    Added,
    /// Present only in the baseline
    Removed,
    /// Removed and re-added under the same name in the same directory
    Modified,
}

impl ChangeKind {
    /// Diff sign for this kind (`~` for modified)
    #[must_use]
    pub const fn sign(self) -> char {
        match self {
            Self::Added => '+',
            Self::Removed => '-',
            Self::Modified => '~',
        }
    }

    /// Kind for a diff sign; unchanged lines have none
    #[must_use]
    pub const fn from_sign(sign: char) -> Option<Self> {
        match sign {
            '+' => Some(Self::Added),
            '-' => Some(Self::Removed),
            '~' => Some(Self::Modified),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
        };
        f.write_str(name)
    }
}

/// One changed file inside a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryChange {
    /// What happened to the entry
    pub kind: ChangeKind,
    /// Size in bytes
    pub size: u64,
    /// Modification timestamp as listed
    pub modified: DateTime<FixedOffset>,
    /// File name within the directory
    pub name: String,
}

/// Change recorded for one directory path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DirectoryChange {
    /// The whole directory appeared or disappeared
    Whole(ChangeKind),
    /// Individual entries changed, in first-seen order
    Entries(Vec<EntryChange>),
}

/// Per-directory changes found by one detection run
///
/// A whole-directory record is never stored below another whole-directory
/// record: the ancestor already implies it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    directories: BTreeMap<String, DirectoryChange>,
}

/// Proper ancestors of `path`, nearest first
///
/// Top-level paths (`/a`, `a`) have none, so they are never shadowed.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim_end_matches('/');
    std::iter::successors(Some(trimmed), |p| p.rfind('/').map(|i| &p[..i]))
        .skip(1)
        .filter(|p| !p.is_empty())
}

/// Join a directory path and an entry name
#[must_use]
pub fn join(directory: &str, name: &str) -> String {
    if directory.ends_with('/') {
        format!("{directory}{name}")
    } else {
        format!("{directory}/{name}")
    }
}

impl ChangeSet {
    /// Empty change set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }

    /// Number of directories with changes
    #[must_use]
    pub fn len(&self) -> usize {
        self.directories.len()
    }

    /// Change recorded for a directory
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&DirectoryChange> {
        self.directories.get(path)
    }

    /// Iterate directories in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DirectoryChange)> {
        self.directories.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether a whole-directory change is recorded on a proper ancestor
    #[must_use]
    pub fn has_whole_ancestor(&self, path: &str) -> bool {
        ancestors(path).any(|a| matches!(self.directories.get(a), Some(DirectoryChange::Whole(_))))
    }

    /// Whether `path` is already recorded or implied by an ancestor
    #[must_use]
    pub fn is_shadowed(&self, path: &str) -> bool {
        self.directories.contains_key(path) || self.has_whole_ancestor(path)
    }

    /// Record a whole-directory change unless it is shadowed
    ///
    /// Returns whether the record was stored.
    pub fn record_whole(&mut self, path: &str, kind: ChangeKind) -> bool {
        if self.is_shadowed(path) {
            return false;
        }
        // Anything recorded underneath is now implied
        let prefix = join(path, "");
        self.directories.retain(|k, _| !k.starts_with(&prefix));
        self.directories
            .insert(path.to_string(), DirectoryChange::Whole(kind));
        true
    }

    /// Record entry changes for a directory unless an ancestor shadows it
    ///
    /// Empty record lists are not stored. Returns whether anything was stored.
    pub fn record_entries(&mut self, path: &str, entries: Vec<EntryChange>) -> bool {
        if entries.is_empty() || self.is_shadowed(path) {
            return false;
        }
        self.directories
            .insert(path.to_string(), DirectoryChange::Entries(entries));
        true
    }

    /// Drop directories and entries matching any exclusion pattern
    ///
    /// Patterns are matched against the directory path, the full entry path
    /// and the bare entry name.
    pub fn exclude(&mut self, patterns: &[Pattern]) {
        if patterns.is_empty() {
            return;
        }
        let matches = |candidate: &str| patterns.iter().any(|p| p.matches(candidate));

        self.directories.retain(|dir, change| {
            if matches(dir) || ancestors(dir).any(matches) {
                return false;
            }
            if let DirectoryChange::Entries(entries) = change {
                entries.retain(|e| !matches(&e.name) && !matches(&join(dir, &e.name)));
                return !entries.is_empty();
            }
            true
        });
    }

    /// Total number of records (whole directories plus entries)
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.directories
            .values()
            .map(|change| match change {
                DirectoryChange::Whole(_) => 1,
                DirectoryChange::Entries(entries) => entries.len(),
            })
            .sum()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = (&'a String, &'a DirectoryChange);
    type IntoIter = std::collections::btree_map::Iter<'a, String, DirectoryChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.directories.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(kind: ChangeKind, name: &str) -> EntryChange {
        EntryChange {
            kind,
            size: 1,
            modified: DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("/a/b/c").collect::<Vec<_>>(), vec!["/a/b", "/a"]);
        assert_eq!(ancestors("a/b").collect::<Vec<_>>(), vec!["a"]);
        assert!(ancestors("/a").next().is_none());
        assert!(ancestors("a").next().is_none());
    }

    #[test]
    fn test_whole_directory_shadows_descendants() {
        let mut changes = ChangeSet::new();
        assert!(changes.record_whole("/a", ChangeKind::Removed));
        assert!(!changes.record_whole("/a/b", ChangeKind::Removed));
        assert!(!changes.record_entries("/a/b", vec![entry(ChangeKind::Added, "x")]));
        assert!(!changes.record_whole("/a", ChangeKind::Added));
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_entry_records_do_not_shadow() {
        let mut changes = ChangeSet::new();
        assert!(changes.record_entries("/a", vec![entry(ChangeKind::Added, "x")]));
        assert!(changes.record_whole("/a/new", ChangeKind::Added));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_sibling_prefix_is_not_ancestor() {
        let mut changes = ChangeSet::new();
        changes.record_whole("/a/b", ChangeKind::Added);
        assert!(changes.record_whole("/a/bc", ChangeKind::Added));
    }

    #[test]
    fn test_whole_prunes_recorded_descendants() {
        let mut changes = ChangeSet::new();
        changes.record_entries("/a/b", vec![entry(ChangeKind::Added, "x")]);
        assert!(changes.record_whole("/a", ChangeKind::Removed));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get("/a"), Some(&DirectoryChange::Whole(ChangeKind::Removed)));
    }

    #[test]
    fn test_exclude() {
        let mut changes = ChangeSet::new();
        changes.record_entries(
            "/sdcard/DCIM",
            vec![entry(ChangeKind::Added, "a.jpg"), entry(ChangeKind::Added, "a.tmp")],
        );
        changes.record_whole("/sdcard/Android/data", ChangeKind::Added);
        changes.record_entries("/sdcard/cache", vec![entry(ChangeKind::Added, "only.tmp")]);

        let patterns = vec![
            Pattern::new("*.tmp").unwrap(),
            Pattern::new("/sdcard/Android").unwrap(),
        ];
        changes.exclude(&patterns);

        assert_eq!(changes.len(), 1);
        let Some(DirectoryChange::Entries(entries)) = changes.get("/sdcard/DCIM") else {
            panic!("expected entry records");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.jpg");
    }

    #[test]
    fn test_serialization_shape() {
        let mut changes = ChangeSet::new();
        changes.record_whole("/a", ChangeKind::Removed);
        changes.record_entries("/b", vec![entry(ChangeKind::Modified, "f")]);
        let json = serde_json::to_value(&changes).unwrap();
        assert_eq!(json["/a"], "removed");
        assert_eq!(json["/b"][0]["kind"], "modified");
        assert_eq!(json["/b"][0]["name"], "f");
    }

    proptest! {
        #[test]
        fn prop_no_whole_record_below_another(paths in prop::collection::vec("(/[abc]){1,4}", 1..20)) {
            let mut changes = ChangeSet::new();
            for path in &paths {
                changes.record_whole(path, ChangeKind::Added);
            }
            for (path, _) in changes.iter() {
                prop_assert!(!changes.has_whole_ancestor(path));
            }
        }
    }
}
