//! Change fingerprints for indexed entries.
//!
//! A fingerprint covers path, size, mtime, kind and (when the backend has one)
//! inode. File content is never read, so an edit that preserves both size and
//! mtime goes unnoticed.

use super::entry::{EntryKind, FingerprintMap, IndexEntry};
use chrono::{DateTime, Utc};
use rayon::prelude::*;

/// Compute the fingerprint of an entry from its identity-affecting fields.
pub fn fingerprint(
    path: &str,
    size: u64,
    modified_at: &DateTime<Utc>,
    kind: EntryKind,
    inode: Option<u64>,
) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}",
        path,
        size,
        modified_at.timestamp_micros(),
        kind.as_str(),
        inode.map(|i| i.to_string()).unwrap_or_default()
    );
    format!("{:x}", md5::compute(material.as_bytes()))
}

/// Recompute the fingerprint of an existing entry
pub fn fingerprint_entry(entry: &IndexEntry) -> String {
    fingerprint(
        &entry.path,
        entry.size,
        &entry.modified_at,
        entry.kind,
        entry.inode,
    )
}

/// Rebuild the path -> fingerprint map from entries (parallelized)
pub fn rebuild_fingerprints(entries: &[IndexEntry]) -> FingerprintMap {
    entries
        .par_iter()
        .map(|e| (e.path.clone(), fingerprint_entry(e)))
        .collect()
}

/// Digest of every entry's fingerprint, in entry order.
///
/// Stamped into all three persisted artifacts of a write so a reader can tell
/// whether they came from the same save.
pub fn entries_digest(entries: &[IndexEntry]) -> String {
    let mut context = md5::Context::new();
    for entry in entries {
        context.consume(entry.fingerprint.as_bytes());
        context.consume(b"\n");
    }
    format!("{:x}", context.finalize())
}
