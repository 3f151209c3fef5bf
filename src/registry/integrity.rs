//! Consistency checks between persisted artifacts and the served index.

use serde::Serialize;

use crate::index::{entries_digest, ArtifactState, DiskInspection, ShareIndex};

/// Remediation for a detected inconsistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Nothing usable anywhere; crawl the share again
    Rebuild,
    /// Entries are fine but the fingerprint map is not; recompute it
    RebuildHashes,
    /// Disk is sound but memory is missing or inconsistent; load from disk
    Reload,
    /// Memory is sound but disk is missing or stale; write memory out
    Sync,
    Healthy,
}

/// Summary of the index currently served from memory
#[derive(Debug, Clone, Serialize)]
pub struct MemoryState {
    pub entries: usize,
    pub fingerprints: usize,
    pub consistent: bool,
    /// Commit token the index would be persisted with
    pub commit: String,
}

impl MemoryState {
    fn of(index: &ShareIndex) -> Self {
        Self {
            entries: index.entries.len(),
            fingerprints: index.fingerprints.len(),
            consistent: index.is_consistent(),
            commit: entries_digest(&index.entries),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub share_id: String,
    pub action: RepairAction,
    pub issues: Vec<String>,
    pub disk: DiskInspection,
    pub memory: Option<MemoryState>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.action == RepairAction::Healthy
    }
}

/// Outcome of [`IndexRegistry::repair`](super::IndexRegistry::repair)
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub performed: RepairAction,
    pub after: IntegrityReport,
}

fn describe(name: &str, state: &ArtifactState) -> Option<String> {
    match state {
        ArtifactState::Missing => Some(format!("{} artifact is missing", name)),
        ArtifactState::Unreadable { reason } => {
            Some(format!("{} artifact is unreadable: {}", name, reason))
        }
        ArtifactState::Valid { .. } => None,
    }
}

/// Decide which remediation brings disk and memory back in agreement.
///
/// Memory only ever holds an index that was persisted first, so when both
/// sides are internally sound but disagree, memory wins.
pub fn assess(share_id: &str, disk: DiskInspection, memory: Option<&ShareIndex>) -> IntegrityReport {
    let memory_state = memory.map(MemoryState::of);
    let memory_sound = memory_state.as_ref().is_some_and(|m| m.consistent);
    let mut issues = Vec::new();

    issues.extend(describe("metadata", &disk.metadata));
    issues.extend(describe("entries", &disk.entries));
    if let (Some(recorded), Some(actual)) = (disk.recorded_entries, disk.entries.count()) {
        if recorded != actual {
            issues.push(format!(
                "metadata records {} entries but entries artifact holds {}",
                recorded, actual
            ));
        }
    }
    if issues.is_empty() && !disk.commits_agree {
        issues.push("metadata and entries artifacts come from different writes".to_string());
    }
    let disk_sound = issues.is_empty();

    let action = if !disk_sound {
        if memory_sound {
            RepairAction::Sync
        } else {
            RepairAction::Rebuild
        }
    } else if let Some(issue) = describe("fingerprint", &disk.fingerprints) {
        issues.push(issue);
        RepairAction::RebuildHashes
    } else if !disk.fingerprints_match {
        issues.push("fingerprint artifact does not match entries".to_string());
        RepairAction::RebuildHashes
    } else {
        match &memory_state {
            None => {
                issues.push("index is not loaded in memory".to_string());
                RepairAction::Reload
            }
            Some(m) if !m.consistent => {
                issues.push("in-memory fingerprints do not match entries".to_string());
                RepairAction::Reload
            }
            Some(m) if Some(m.entries) != disk.entries.count() => {
                issues.push(format!(
                    "memory holds {} entries but disk holds {}",
                    m.entries,
                    disk.entries.count().unwrap_or(0)
                ));
                RepairAction::Sync
            }
            Some(m) if disk.commit.as_deref() != Some(m.commit.as_str()) => {
                issues.push("memory and disk hold different entries".to_string());
                RepairAction::Sync
            }
            Some(_) => RepairAction::Healthy,
        }
    };

    IntegrityReport {
        share_id: share_id.to_string(),
        action,
        issues,
        disk,
        memory: memory_state,
    }
}
