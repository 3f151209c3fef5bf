//! Persistent index storage
//!
//! Each share is stored as three artifacts in the index directory:
//!
//! - `<id>.entries.bin` – bincode encoded entries
//! - `<id>.hashes.bin` – bincode encoded path -> fingerprint map
//! - `<id>.meta.json` – human readable metadata, written last as the commit record
//!
//! Every write goes to a uniquely named temp file in the same directory, is
//! fsynced and decoded back, and only then renamed over the previous artifact.
//! Readers take a shared lock, writers hold an exclusive lock on the temp file.
//!
//! The three renames are not atomic as a group, so each artifact carries the
//! same commit token (the digest of the entry fingerprints). A reader rejects
//! entries whose token differs from the metadata's, and recomputes the
//! fingerprint map when only that artifact is behind.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::entry::{FingerprintMap, IndexEntry, IndexMetadata, IndexStatus, ShareIndex};
use super::fingerprint::{entries_digest, rebuild_fingerprints};

/// Current persistence format version (bump this when format changes)
pub const FORMAT_VERSION: u32 = 2;

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Serialize)]
struct EntriesRef<'a> {
    version: u32,
    share_id: &'a str,
    commit: &'a str,
    entries: &'a [IndexEntry],
}

#[derive(Deserialize)]
struct PersistedEntries {
    version: u32,
    share_id: String,
    commit: String,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize)]
struct FingerprintsRef<'a> {
    version: u32,
    share_id: &'a str,
    commit: &'a str,
    fingerprints: &'a FingerprintMap,
}

#[derive(Deserialize)]
struct PersistedFingerprints {
    version: u32,
    share_id: String,
    commit: String,
    fingerprints: FingerprintMap,
}

#[derive(Serialize)]
struct MetadataRef<'a> {
    version: u32,
    commit: &'a str,
    metadata: &'a IndexMetadata,
}

#[derive(Deserialize)]
struct PersistedMetadata {
    version: u32,
    commit: String,
    metadata: IndexMetadata,
}

/// On-disk locations of one share's artifacts
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub entries: PathBuf,
    pub fingerprints: PathBuf,
    pub metadata: PathBuf,
}

/// Health of a single artifact on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ArtifactState {
    Missing,
    Unreadable { reason: String },
    Valid { count: usize },
}

impl ArtifactState {
    pub fn count(&self) -> Option<usize> {
        match self {
            ArtifactState::Valid { count } => Some(*count),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ArtifactState::Missing)
    }
}

/// Result of decoding every artifact of a share without building an index
#[derive(Debug, Clone, Serialize)]
pub struct DiskInspection {
    pub entries: ArtifactState,
    pub fingerprints: ArtifactState,
    pub metadata: ArtifactState,
    /// `total_entries` as recorded in the metadata artifact
    pub recorded_entries: Option<usize>,
    /// Commit token of the entries artifact
    pub commit: Option<String>,
    /// Metadata and entries are both readable and come from the same write
    pub commits_agree: bool,
    /// The fingerprint artifact comes from the entries' write and holds
    /// exactly each entry's fingerprint
    pub fingerprints_match: bool,
}

/// Saves, loads and deletes persisted share indexes
#[derive(Debug, Clone)]
pub struct PersistenceManager {
    index_dir: PathBuf,
    max_cache_age: Duration,
}

impl PersistenceManager {
    pub fn new(index_dir: impl Into<PathBuf>, max_cache_age: Duration) -> Self {
        Self {
            index_dir: index_dir.into(),
            max_cache_age,
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn max_cache_age(&self) -> Duration {
        self.max_cache_age
    }

    pub fn paths(&self, share_id: &str) -> ArtifactPaths {
        ArtifactPaths {
            entries: self.index_dir.join(format!("{}.entries.bin", share_id)),
            fingerprints: self.index_dir.join(format!("{}.hashes.bin", share_id)),
            metadata: self.index_dir.join(format!("{}.meta.json", share_id)),
        }
    }

    /// Atomically replace the persisted artifacts of `index`'s share.
    ///
    /// Nothing on disk changes until all three temp files are written and
    /// verified. Temp files are removed on any failure.
    pub fn save(&self, index: &ShareIndex) -> Result<()> {
        let share_id = index.metadata.share_id.as_str();
        let paths = self.paths(share_id);

        std::fs::create_dir_all(&self.index_dir).with_context(|| {
            format!(
                "Failed to create index directory: {}",
                self.index_dir.display()
            )
        })?;

        let commit_token = entries_digest(&index.entries);
        let entry_count = index.entries.len();
        let entries_bytes = bincode::serialize(&EntriesRef {
            version: FORMAT_VERSION,
            share_id,
            commit: &commit_token,
            entries: &index.entries,
        })
        .context("Failed to serialize entries")?;
        let entries_tmp = self.stage(share_id, &entries_bytes, |bytes| {
            let decoded: PersistedEntries = bincode::deserialize(bytes)?;
            anyhow::ensure!(
                decoded.entries.len() == entry_count && decoded.commit == commit_token,
                "entries mismatch after write"
            );
            Ok(())
        })?;

        let fingerprint_count = index.fingerprints.len();
        let fingerprints_bytes = bincode::serialize(&FingerprintsRef {
            version: FORMAT_VERSION,
            share_id,
            commit: &commit_token,
            fingerprints: &index.fingerprints,
        })
        .context("Failed to serialize fingerprints")?;
        let fingerprints_tmp = self.stage(share_id, &fingerprints_bytes, |bytes| {
            let decoded: PersistedFingerprints = bincode::deserialize(bytes)?;
            anyhow::ensure!(
                decoded.fingerprints.len() == fingerprint_count,
                "fingerprint count mismatch after write"
            );
            Ok(())
        })?;

        let metadata_bytes = serde_json::to_vec_pretty(&MetadataRef {
            version: FORMAT_VERSION,
            commit: &commit_token,
            metadata: &index.metadata,
        })
        .context("Failed to serialize metadata")?;
        let metadata_tmp = self.stage(share_id, &metadata_bytes, |bytes| {
            let _: PersistedMetadata = serde_json::from_slice(bytes)?;
            Ok(())
        })?;

        // Metadata goes last: a reader that sees new metadata sees new data
        commit(entries_tmp, &paths.entries)?;
        commit(fingerprints_tmp, &paths.fingerprints)?;
        commit(metadata_tmp, &paths.metadata)?;

        debug!(
            share_id = share_id,
            entries = entry_count,
            dir = %self.index_dir.display(),
            "Index artifacts written"
        );
        Ok(())
    }

    /// Write `bytes` to a fresh temp file and check it decodes.
    fn stage(
        &self,
        share_id: &str,
        bytes: &[u8],
        verify: impl Fn(&[u8]) -> Result<()>,
    ) -> Result<NamedTempFile> {
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", share_id))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.index_dir)
            .with_context(|| {
                format!(
                    "Failed to create temp file in: {}",
                    self.index_dir.display()
                )
            })?;

        tmp.as_file()
            .lock_exclusive()
            .with_context(|| format!("Failed to lock temp file: {}", tmp.path().display()))?;
        tmp.write_all(bytes)
            .with_context(|| format!("Failed to write temp file: {}", tmp.path().display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", tmp.path().display()))?;

        let mut written = Vec::with_capacity(bytes.len());
        tmp.seek(SeekFrom::Start(0))
            .and_then(|_| tmp.read_to_end(&mut written))
            .with_context(|| format!("Failed to re-read temp file: {}", tmp.path().display()))?;
        verify(&written)
            .with_context(|| format!("Temp file failed verification: {}", tmp.path().display()))?;

        FileExt::unlock(tmp.as_file())
            .with_context(|| format!("Failed to unlock temp file: {}", tmp.path().display()))?;
        Ok(tmp)
    }

    /// Load a share's index, returning None when absent, too old or unusable.
    pub fn load(&self, share_id: &str) -> Option<ShareIndex> {
        match self.read(share_id, Some(self.max_cache_age)) {
            Ok(index) => index,
            Err(e) => {
                warn!(
                    share_id = share_id,
                    error = %e,
                    "Failed to load persisted index, will rebuild"
                );
                None
            }
        }
    }

    /// Read a share's artifacts.
    ///
    /// `Ok(None)` means there is nothing usable on disk: no metadata, or an
    /// index older than `max_age`. Entries from a different write than the
    /// metadata are an error. Missing, stale or mismatched fingerprints are
    /// reconstructed from the entries.
    pub fn read(&self, share_id: &str, max_age: Option<Duration>) -> Result<Option<ShareIndex>> {
        let paths = self.paths(share_id);

        let metadata_bytes = match read_locked(&paths.metadata) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read metadata: {}", paths.metadata.display())
                })
            }
        };
        let persisted: PersistedMetadata = serde_json::from_slice(&metadata_bytes)
            .with_context(|| format!("Failed to parse metadata: {}", paths.metadata.display()))?;
        check_version(persisted.version, &paths.metadata)?;
        let commit = persisted.commit;
        let mut metadata = persisted.metadata;

        if let Some(max_age) = max_age {
            let too_old = match metadata.last_updated_at {
                Some(updated) => chrono::Utc::now()
                    .signed_duration_since(updated)
                    .to_std()
                    .map(|age| age > max_age)
                    .unwrap_or(false),
                None => true,
            };
            if too_old {
                info!(
                    share_id = share_id,
                    last_updated_at = ?metadata.last_updated_at,
                    max_age_secs = max_age.as_secs(),
                    "Persisted index is older than max cache age, ignoring"
                );
                return Ok(None);
            }
        }

        let entries_bytes = read_locked(&paths.entries)
            .with_context(|| format!("Failed to read entries: {}", paths.entries.display()))?;
        let persisted: PersistedEntries = bincode::deserialize(&entries_bytes)
            .with_context(|| format!("Failed to decode entries: {}", paths.entries.display()))?;
        check_version(persisted.version, &paths.entries)?;
        anyhow::ensure!(
            persisted.share_id == share_id,
            "Entries artifact belongs to share {:?}",
            persisted.share_id
        );
        anyhow::ensure!(
            persisted.commit == commit,
            "Entries artifact is from a different write than the metadata (torn commit)"
        );
        anyhow::ensure!(
            persisted.entries.len() == metadata.total_entries,
            "Entries artifact holds {} entries but metadata records {}",
            persisted.entries.len(),
            metadata.total_entries
        );
        anyhow::ensure!(
            entries_digest(&persisted.entries) == commit,
            "Entries artifact does not match its commit token"
        );

        let entries = persisted.entries;
        let fingerprints = match self.read_fingerprints(share_id, &paths.fingerprints, &commit) {
            Ok(fingerprints) => fingerprints,
            Err(e) => {
                warn!(
                    share_id = share_id,
                    error = %e,
                    "Fingerprint artifact unusable, reconstructing from entries"
                );
                rebuild_fingerprints(&entries)
            }
        };

        metadata.status = IndexStatus::Completed;
        metadata.progress = 100;
        metadata.error = None;

        let mut index = ShareIndex {
            entries,
            fingerprints,
            metadata,
        };
        if !index.is_consistent() {
            warn!(
                share_id = share_id,
                "Fingerprints do not match entries, reconstructing"
            );
            index.fingerprints = rebuild_fingerprints(&index.entries);
        }
        index.refresh_counts();

        Ok(Some(index))
    }

    fn read_fingerprints(&self, share_id: &str, path: &Path, commit: &str) -> Result<FingerprintMap> {
        let bytes = read_locked(path)
            .with_context(|| format!("Failed to read fingerprints: {}", path.display()))?;
        let persisted: PersistedFingerprints = bincode::deserialize(&bytes)
            .with_context(|| format!("Failed to decode fingerprints: {}", path.display()))?;
        check_version(persisted.version, path)?;
        anyhow::ensure!(
            persisted.share_id == share_id,
            "Fingerprint artifact belongs to share {:?}",
            persisted.share_id
        );
        anyhow::ensure!(
            persisted.commit == commit,
            "Fingerprint artifact is from a different write than the entries"
        );
        Ok(persisted.fingerprints)
    }

    /// Decode every artifact independently, for integrity checks
    pub fn inspect(&self, share_id: &str) -> DiskInspection {
        let paths = self.paths(share_id);

        let mut entry_commit: Option<String> = None;
        let mut entry_fingerprints: Option<Vec<(String, String)>> = None;
        let entries = match read_locked(&paths.entries) {
            Err(e) if e.kind() == ErrorKind::NotFound => ArtifactState::Missing,
            Err(e) => ArtifactState::Unreadable {
                reason: e.to_string(),
            },
            Ok(bytes) => match bincode::deserialize::<PersistedEntries>(&bytes) {
                Ok(p) if p.version == FORMAT_VERSION && entries_digest(&p.entries) != p.commit => {
                    ArtifactState::Unreadable {
                        reason: "entries do not match their commit token".to_string(),
                    }
                }
                Ok(p) if p.version == FORMAT_VERSION => {
                    let count = p.entries.len();
                    entry_commit = Some(p.commit);
                    entry_fingerprints = Some(
                        p.entries
                            .into_iter()
                            .map(|e| (e.path, e.fingerprint))
                            .collect(),
                    );
                    ArtifactState::Valid { count }
                }
                Ok(p) => ArtifactState::Unreadable {
                    reason: format!("format version {}", p.version),
                },
                Err(e) => ArtifactState::Unreadable {
                    reason: e.to_string(),
                },
            },
        };

        let mut fingerprint_map: Option<(String, FingerprintMap)> = None;
        let fingerprints = match read_locked(&paths.fingerprints) {
            Err(e) if e.kind() == ErrorKind::NotFound => ArtifactState::Missing,
            Err(e) => ArtifactState::Unreadable {
                reason: e.to_string(),
            },
            Ok(bytes) => match bincode::deserialize::<PersistedFingerprints>(&bytes) {
                Ok(p) if p.version == FORMAT_VERSION => {
                    let count = p.fingerprints.len();
                    fingerprint_map = Some((p.commit, p.fingerprints));
                    ArtifactState::Valid { count }
                }
                Ok(p) => ArtifactState::Unreadable {
                    reason: format!("format version {}", p.version),
                },
                Err(e) => ArtifactState::Unreadable {
                    reason: e.to_string(),
                },
            },
        };

        let mut recorded_entries = None;
        let mut metadata_commit: Option<String> = None;
        let metadata = match read_locked(&paths.metadata) {
            Err(e) if e.kind() == ErrorKind::NotFound => ArtifactState::Missing,
            Err(e) => ArtifactState::Unreadable {
                reason: e.to_string(),
            },
            Ok(bytes) => match serde_json::from_slice::<PersistedMetadata>(&bytes) {
                Ok(p) if p.version == FORMAT_VERSION => {
                    recorded_entries = Some(p.metadata.total_entries);
                    metadata_commit = Some(p.commit);
                    ArtifactState::Valid {
                        count: p.metadata.total_entries,
                    }
                }
                Ok(p) => ArtifactState::Unreadable {
                    reason: format!("format version {}", p.version),
                },
                Err(e) => ArtifactState::Unreadable {
                    reason: e.to_string(),
                },
            },
        };

        let commits_agree = matches!(
            (&entry_commit, &metadata_commit),
            (Some(entries), Some(metadata)) if entries == metadata
        );
        let fingerprints_match = match (&entry_commit, &entry_fingerprints, &fingerprint_map) {
            (Some(commit), Some(pairs), Some((map_commit, map))) => {
                map_commit == commit
                    && pairs.len() == map.len()
                    && pairs.iter().all(|(path, fp)| map.get(path) == Some(fp))
            }
            _ => false,
        };

        DiskInspection {
            entries,
            fingerprints,
            metadata,
            recorded_entries,
            commit: entry_commit,
            commits_agree,
            fingerprints_match,
        }
    }

    /// True when a metadata record exists for the share
    pub fn exists(&self, share_id: &str) -> bool {
        self.paths(share_id).metadata.exists()
    }

    /// Remove all artifacts of a share. Missing files are not an error.
    pub fn delete(&self, share_id: &str) -> Result<()> {
        let paths = self.paths(share_id);
        // Metadata first, so a partial delete never looks like a valid index
        for path in [&paths.metadata, &paths.entries, &paths.fingerprints] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to delete: {}", path.display()))
                }
            }
        }
        Ok(())
    }

    /// Remove temp files left behind by an interrupted write
    pub fn sweep_temp_files(&self) -> Result<usize> {
        let read_dir = match std::fs::read_dir(&self.index_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to list index directory: {}", self.index_dir.display())
                })
            }
        };

        let mut removed = 0;
        for entry in read_dir.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp file"),
                }
            }
        }
        Ok(removed)
    }
}

fn commit(tmp: NamedTempFile, target: &Path) -> Result<()> {
    tmp.persist(target)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move artifact into place: {}", target.display()))?;
    Ok(())
}

fn check_version(found: u32, path: &Path) -> Result<()> {
    if found != FORMAT_VERSION {
        anyhow::bail!(
            "Index format version mismatch in {}: found {}, expected {}. The index will be rebuilt.",
            path.display(),
            found,
            FORMAT_VERSION
        );
    }
    Ok(())
}

/// Read a whole file under a shared lock (multiple readers allowed)
fn read_locked(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    FileExt::lock_shared(&file)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    // Lock is released when file is dropped
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::test_support::{dir_entry, file_entry, index_of};
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> PersistenceManager {
        PersistenceManager::new(dir.path().join("index"), Duration::from_secs(3600))
    }

    fn sample_index(n: usize) -> ShareIndex {
        let entries = (0..n)
            .map(|i| file_entry("/", &format!("file_{}.txt", i), i as u64, 1_700_000_000))
            .collect();
        index_of("media", entries)
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        let index = sample_index(25);

        pm.save(&index).unwrap();
        let loaded = pm.load("media").expect("index should load");

        assert_eq!(loaded.entries.len(), 25);
        assert_eq!(loaded.metadata.total_files, 25);
        assert_eq!(loaded.metadata.status, IndexStatus::Completed);
        assert_eq!(loaded.fingerprints, index.fingerprints);
        assert_eq!(loaded.entries, index.entries);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        pm.save(&sample_index(3)).unwrap();

        let names: Vec<String> = std::fs::read_dir(pm.index_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 3, "unexpected files: {:?}", names);
        assert!(names.iter().all(|n| !n.ends_with(TEMP_SUFFIX)));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(manager(&temp_dir).load("nothing").is_none());
    }

    #[test]
    fn test_load_rejects_old_index() {
        let temp_dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(temp_dir.path(), Duration::from_secs(60));
        let mut index = sample_index(2);
        index.metadata.last_updated_at = Some(chrono::Utc::now() - chrono::Duration::hours(2));
        pm.save(&index).unwrap();

        assert!(pm.load("media").is_none());
        // Without an age limit the same artifacts are usable
        assert!(pm.read("media", None).unwrap().is_some());
    }

    #[test]
    fn test_missing_fingerprints_are_reconstructed() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        let index = index_of(
            "media",
            vec![dir_entry("/", "docs", 5), file_entry("/docs", "b.pdf", 20, 5)],
        );
        pm.save(&index).unwrap();
        std::fs::remove_file(pm.paths("media").fingerprints).unwrap();

        let loaded = pm.load("media").expect("entries and metadata are valid");
        assert_eq!(loaded.fingerprints, index.fingerprints);
    }

    #[test]
    fn test_corrupt_fingerprints_are_reconstructed() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        let index = sample_index(4);
        pm.save(&index).unwrap();
        std::fs::write(pm.paths("media").fingerprints, b"garbage").unwrap();

        let loaded = pm.load("media").unwrap();
        assert!(loaded.is_consistent());
        assert_eq!(loaded.fingerprints, index.fingerprints);
    }

    #[test]
    fn test_truncated_entries_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        pm.save(&sample_index(10)).unwrap();

        let path = pm.paths("media").entries;
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(pm.load("media").is_none());
        let inspection = pm.inspect("media");
        assert!(matches!(inspection.entries, ArtifactState::Unreadable { .. }));
        assert!(!inspection.fingerprints_match);
    }

    #[test]
    fn test_entries_from_newer_write_with_old_metadata_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        pm.save(&sample_index(3)).unwrap();
        let old_metadata = std::fs::read(pm.paths("media").metadata).unwrap();

        // Simulate a crash after the entries rename but before the metadata rename
        pm.save(&sample_index(5)).unwrap();
        std::fs::write(pm.paths("media").metadata, old_metadata).unwrap();

        assert!(pm.read("media", None).is_err());
    }

    #[test]
    fn test_inspect_healthy_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        pm.save(&sample_index(7)).unwrap();

        let inspection = pm.inspect("media");
        assert_eq!(inspection.entries, ArtifactState::Valid { count: 7 });
        assert_eq!(inspection.fingerprints, ArtifactState::Valid { count: 7 });
        assert_eq!(inspection.recorded_entries, Some(7));
        assert!(inspection.commits_agree);
        assert!(inspection.fingerprints_match);
    }

    /// Save `first`, then `second`, and put `first`'s fingerprints and
    /// metadata back, as if the process died right after the entries rename.
    fn torn_after_entries_rename(pm: &PersistenceManager, first: &ShareIndex, second: &ShareIndex) {
        pm.save(first).unwrap();
        let paths = pm.paths("media");
        let old_hashes = std::fs::read(&paths.fingerprints).unwrap();
        let old_metadata = std::fs::read(&paths.metadata).unwrap();

        pm.save(second).unwrap();
        std::fs::write(&paths.fingerprints, old_hashes).unwrap();
        std::fs::write(&paths.metadata, old_metadata).unwrap();
    }

    #[test]
    fn test_torn_commit_with_same_entry_count_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        let before = index_of(
            "media",
            vec![file_entry("/", "a.txt", 10, 1), file_entry("/", "b.txt", 20, 1)],
        );
        let after = index_of(
            "media",
            vec![file_entry("/", "a.txt", 15, 2), file_entry("/", "b.txt", 20, 1)],
        );
        torn_after_entries_rename(&pm, &before, &after);

        assert!(pm.read("media", None).is_err());
        assert!(pm.load("media").is_none());

        let inspection = pm.inspect("media");
        assert_eq!(inspection.entries, ArtifactState::Valid { count: 2 });
        assert_eq!(inspection.recorded_entries, Some(2));
        assert!(!inspection.commits_agree);
        assert!(!inspection.fingerprints_match);
    }

    #[test]
    fn test_stale_fingerprints_alone_are_reconstructed() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        let before = index_of(
            "media",
            vec![file_entry("/", "a.txt", 10, 1), file_entry("/", "b.txt", 20, 1)],
        );
        let after = index_of(
            "media",
            vec![file_entry("/", "a.txt", 15, 2), file_entry("/", "b.txt", 20, 1)],
        );
        pm.save(&before).unwrap();
        let old_hashes = std::fs::read(pm.paths("media").fingerprints).unwrap();
        pm.save(&after).unwrap();
        std::fs::write(pm.paths("media").fingerprints, old_hashes).unwrap();

        let inspection = pm.inspect("media");
        assert!(inspection.commits_agree);
        assert!(!inspection.fingerprints_match);

        let loaded = pm.load("media").expect("entries and metadata agree");
        assert!(loaded.is_consistent());
        assert_eq!(loaded.fingerprints, after.fingerprints);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        pm.save(&sample_index(1)).unwrap();
        assert!(pm.exists("media"));

        pm.delete("media").unwrap();
        assert!(!pm.exists("media"));
        pm.delete("media").unwrap();

        let inspection = pm.inspect("media");
        assert!(inspection.entries.is_missing());
        assert!(inspection.fingerprints.is_missing());
        assert!(inspection.metadata.is_missing());
    }

    #[test]
    fn test_sweep_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let pm = manager(&temp_dir);
        pm.save(&sample_index(1)).unwrap();
        std::fs::write(pm.index_dir().join(".media.abc123.tmp"), b"partial").unwrap();

        assert_eq!(pm.sweep_temp_files().unwrap(), 1);
        assert!(pm.load("media").is_some());
    }
}
