//! Indexed entries and the per-share index they make up.

use super::fingerprint::fingerprint;
use super::tokenizer::tokenize;
use crate::share::ListedEntry;
use crate::utils::{extension_of, join_share_path, normalize_share_path, path_depth};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Path -> fingerprint, kept key-for-key in sync with `ShareIndex::entries`
pub type FingerprintMap = FxHashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}

/// One filesystem object inside a share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Absolute from the share root, forward-slash separated
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    /// Always 0 for directories
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Lowercase, files only
    pub extension: Option<String>,
    pub depth: u32,
    pub parent_path: String,
    /// Lowercase name tokens, unique, in order of first appearance
    pub search_tokens: Vec<String>,
    pub fingerprint: String,
    pub inode: Option<u64>,
}

impl IndexEntry {
    /// Build an entry for a listed child of `parent_path`.
    ///
    /// Tokens and fingerprint are computed here so the crawl never needs a
    /// second pass.
    pub fn from_listing(parent_path: &str, listed: &ListedEntry) -> Self {
        let parent_path = normalize_share_path(parent_path);
        let path = join_share_path(&parent_path, &listed.name);
        let size = match listed.kind {
            EntryKind::File => listed.size,
            EntryKind::Directory => 0,
        };
        let extension = match listed.kind {
            EntryKind::File => extension_of(&listed.name),
            EntryKind::Directory => None,
        };
        let fingerprint = fingerprint(&path, size, &listed.modified, listed.kind, listed.inode);

        Self {
            depth: path_depth(&path) as u32,
            search_tokens: tokenize(&listed.name),
            name: listed.name.clone(),
            kind: listed.kind,
            size,
            modified_at: listed.modified,
            extension,
            parent_path,
            fingerprint,
            inode: listed.inode,
            path,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    #[default]
    NotBuilt,
    Building,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ChangeCounts {
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

/// Build state and bookkeeping for one share's index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub share_id: String,
    pub status: IndexStatus,
    /// 0-100
    pub progress: u8,
    /// Number of file entries (directories are not counted)
    pub total_files: usize,
    /// Number of entries of any kind
    pub total_entries: usize,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub last_incremental_at: Option<DateTime<Utc>>,
    pub last_change_counts: Option<ChangeCounts>,
    pub build_duration_ms: u64,
    /// Reason for the last failed build
    pub error: Option<String>,
}

impl IndexMetadata {
    pub fn not_built(share_id: impl Into<String>) -> Self {
        Self {
            share_id: share_id.into(),
            status: IndexStatus::NotBuilt,
            progress: 0,
            total_files: 0,
            total_entries: 0,
            last_updated_at: None,
            last_incremental_at: None,
            last_change_counts: None,
            build_duration_ms: 0,
            error: None,
        }
    }
}

/// The complete searchable state of one share
#[derive(Debug, Clone)]
pub struct ShareIndex {
    pub entries: Vec<IndexEntry>,
    pub fingerprints: FingerprintMap,
    pub metadata: IndexMetadata,
}

impl ShareIndex {
    /// A freshly built index, stamped as completed now
    pub fn completed(
        share_id: &str,
        entries: Vec<IndexEntry>,
        fingerprints: FingerprintMap,
        build_duration_ms: u64,
    ) -> Self {
        let mut metadata = IndexMetadata::not_built(share_id);
        metadata.status = IndexStatus::Completed;
        metadata.progress = 100;
        metadata.build_duration_ms = build_duration_ms;
        metadata.last_updated_at = Some(Utc::now());

        let mut index = Self {
            entries,
            fingerprints,
            metadata,
        };
        index.refresh_counts();
        index
    }

    /// Recompute the entry/file counters from `entries`
    pub fn refresh_counts(&mut self) {
        self.metadata.total_entries = self.entries.len();
        self.metadata.total_files = self.entries.iter().filter(|e| e.is_file()).count();
    }

    /// True when the fingerprint map holds exactly each entry's own
    /// fingerprint, keyed by its path
    pub fn is_consistent(&self) -> bool {
        if self.fingerprints.len() != self.entries.len() {
            return false;
        }
        let paths: HashSet<&str> = self.entries.iter().map(|e| e.path.as_str()).collect();
        paths.len() == self.entries.len()
            && self
                .entries
                .iter()
                .all(|e| self.fingerprints.get(&e.path) == Some(&e.fingerprint))
    }

    /// Time since the index was last written, if it ever was
    pub fn age(&self) -> Option<chrono::Duration> {
        self.metadata
            .last_updated_at
            .map(|updated| Utc::now().signed_duration_since(updated))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_entry_from_listing() {
        let entry = file_entry("/docs", "Annual_Report.PDF", 20, 1_700_000_000);
        assert_eq!(entry.path, "/docs/Annual_Report.PDF");
        assert_eq!(entry.parent_path, "/docs");
        assert_eq!(entry.depth, 2);
        assert_eq!(entry.extension.as_deref(), Some("pdf"));
        assert_eq!(entry.search_tokens, vec!["annual", "report", "pdf"]);
        assert_eq!(entry.fingerprint.len(), 32);
    }

    #[test]
    fn test_directory_has_no_size_or_extension() {
        let raw = listed("photos.2024", EntryKind::Directory, 4096, 1);
        let entry = IndexEntry::from_listing("/", &raw);
        assert_eq!(entry.path, "/photos.2024");
        assert_eq!(entry.size, 0);
        assert_eq!(entry.extension, None);
        assert_eq!(entry.depth, 1);
    }

    #[test]
    fn test_completed_counts_files_only() {
        let index = index_of(
            "s",
            vec![
                file_entry("/", "a.txt", 10, 1),
                dir_entry("/", "docs", 1),
                file_entry("/docs", "b.pdf", 20, 1),
            ],
        );
        assert_eq!(index.metadata.status, IndexStatus::Completed);
        assert_eq!(index.metadata.total_files, 2);
        assert_eq!(index.metadata.total_entries, 3);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_inconsistent_fingerprints_detected() {
        let mut index = index_of("s", vec![file_entry("/", "a.txt", 10, 1)]);
        index.fingerprints.insert("/ghost".to_string(), "x".to_string());
        assert!(!index.is_consistent());
        index.fingerprints.remove("/ghost");
        index.fingerprints.remove("/a.txt");
        assert!(!index.is_consistent());
    }

    #[test]
    fn test_stale_fingerprint_value_detected() {
        let mut index = index_of(
            "s",
            vec![file_entry("/", "a.txt", 10, 1), file_entry("/", "b.txt", 10, 1)],
        );
        // Same keys, but the entry was modified after the map was built
        index.entries[0] = file_entry("/", "a.txt", 11, 2);
        assert_eq!(index.fingerprints.len(), index.entries.len());
        assert!(!index.is_consistent());
    }
}
