//! Change detection between a live index and a fresh snapshot.

use super::crawler::Snapshot;
use super::entry::{ChangeCounts, IndexEntry, ShareIndex};

/// Default fraction of changed entries above which a full rebuild is cheaper
pub const DEFAULT_CHANGE_THRESHOLD: f64 = 0.30;

/// Differences between two states of a share
#[derive(Debug, Clone, Default)]
pub struct Delta {
    /// In the snapshot but not in the index
    pub added: Vec<IndexEntry>,
    /// In both, with a different fingerprint; carries the new entry
    pub modified: Vec<IndexEntry>,
    /// Paths in the index but not in the snapshot
    pub deleted: Vec<String>,
}

impl Delta {
    /// Classify every path of `previous` and `current`.
    ///
    /// Each path lands in at most one bucket; unchanged paths in none.
    pub fn detect(previous: &ShareIndex, current: &Snapshot) -> Self {
        let mut delta = Delta::default();

        for entry in &current.entries {
            match previous.fingerprints.get(&entry.path) {
                None => delta.added.push(entry.clone()),
                Some(old) if *old != entry.fingerprint => delta.modified.push(entry.clone()),
                Some(_) => {}
            }
        }

        delta.deleted = previous
            .entries
            .iter()
            .filter(|e| !current.fingerprints.contains_key(&e.path))
            .map(|e| e.path.clone())
            .collect();

        delta
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }

    pub fn total_changes(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }

    /// Changed entries relative to the previous index size (at least 1)
    pub fn change_ratio(&self, previous_entries: usize) -> f64 {
        self.total_changes() as f64 / previous_entries.max(1) as f64
    }

    pub fn exceeds_threshold(&self, previous_entries: usize, threshold: f64) -> bool {
        self.change_ratio(previous_entries) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::test_support::{dir_entry, file_entry, index_of};
    use crate::index::entry::FingerprintMap;

    fn snapshot_of(entries: Vec<IndexEntry>) -> Snapshot {
        let fingerprints: FingerprintMap = entries
            .iter()
            .map(|e| (e.path.clone(), e.fingerprint.clone()))
            .collect();
        Snapshot {
            entries,
            fingerprints,
            ..Default::default()
        }
    }

    #[test]
    fn test_detect_classifies_each_path_once() {
        let previous = index_of(
            "s",
            vec![
                file_entry("/", "same.txt", 1, 1),
                file_entry("/", "edited.txt", 1, 1),
                file_entry("/", "gone.txt", 1, 1),
                dir_entry("/", "docs", 1),
            ],
        );
        let current = snapshot_of(vec![
            file_entry("/", "same.txt", 1, 1),
            file_entry("/", "edited.txt", 2, 5),
            file_entry("/", "new.txt", 1, 1),
            dir_entry("/", "docs", 1),
        ]);

        let delta = Delta::detect(&previous, &current);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].path, "/new.txt");
        assert_eq!(delta.modified.len(), 1);
        assert_eq!(delta.modified[0].path, "/edited.txt");
        assert_eq!(delta.modified[0].size, 2);
        assert_eq!(delta.deleted, vec!["/gone.txt".to_string()]);
        assert_eq!(delta.counts().total(), 3);
    }

    #[test]
    fn test_identical_states_produce_empty_delta() {
        let entries = vec![file_entry("/", "a.txt", 1, 1), dir_entry("/", "d", 1)];
        let previous = index_of("s", entries.clone());
        let delta = Delta::detect(&previous, &snapshot_of(entries));
        assert!(delta.is_empty());
        assert_eq!(delta.change_ratio(previous.entries.len()), 0.0);
    }

    #[test]
    fn test_change_ratio_and_threshold() {
        let previous = index_of(
            "s",
            (0..10).map(|i| file_entry("/", &format!("f{}", i), 1, 1)).collect(),
        );
        let mut entries: Vec<IndexEntry> =
            (0..10).map(|i| file_entry("/", &format!("f{}", i), 1, 1)).collect();
        entries.truncate(7);
        let delta = Delta::detect(&previous, &snapshot_of(entries));

        assert_eq!(delta.deleted.len(), 3);
        assert!((delta.change_ratio(10) - 0.3).abs() < f64::EPSILON);
        // Escalation needs strictly more than the threshold
        assert!(!delta.exceeds_threshold(10, DEFAULT_CHANGE_THRESHOLD));
        assert!(delta.exceeds_threshold(10, 0.25));
    }

    #[test]
    fn test_ratio_against_empty_index() {
        let previous = index_of("s", Vec::new());
        let delta = Delta::detect(&previous, &snapshot_of(vec![file_entry("/", "a", 1, 1)]));
        assert_eq!(delta.change_ratio(0), 1.0);
    }
}
