//! Incremental refresh of a live index.
//!
//! A cycle takes a diff-mode snapshot of the share, compares it with the live
//! index and either does nothing, asks for a full rebuild, or produces a
//! patched copy. The live index is never mutated; publishing the copy is the
//! caller's job once it has been persisted.

use anyhow::Result;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

use crate::index::{ChangeCounts, Crawler, CrawlMode, Delta, IndexStatus, ShareIndex};
use crate::share::ShareDescriptor;

/// Result of one incremental cycle for a share
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CycleOutcome {
    /// Snapshot matched the live index; nothing was written
    NoChanges,
    /// Patch persisted and published
    Applied {
        added: usize,
        modified: usize,
        deleted: usize,
        total_files: usize,
    },
    /// Too many changes for a patch; a full rebuild ran instead
    Escalated { change_ratio: f64, total_changes: usize },
    /// No index existed yet; a full build ran
    Rebuilt { total_files: usize },
    Skipped { reason: String },
    Failed { error: String },
    /// A rebuild or delete was requested while this cycle ran
    Superseded,
    /// The share no longer exists; its index was removed
    ShareRemoved,
}

impl CycleOutcome {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        CycleOutcome::Failed {
            error: format!("{:#}", error),
        }
    }
}

/// Change summary published after the index of a share changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeNotification {
    pub share_id: String,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub total_files: usize,
}

/// What the caller should do with the outcome of a diff
#[derive(Debug)]
pub enum CyclePlan {
    NoChanges,
    Escalate {
        change_ratio: f64,
        counts: ChangeCounts,
    },
    Apply {
        next: Box<ShareIndex>,
        counts: ChangeCounts,
    },
}

/// Crawl `share` in diff mode and decide how to bring `current` up to date.
pub async fn plan_cycle(
    share: &ShareDescriptor,
    current: &ShareIndex,
    crawler: &Crawler,
    full_rebuild_threshold: f64,
) -> Result<CyclePlan> {
    let start = Instant::now();
    let mut snapshot = crawler.crawl(share, CrawlMode::Diff, None).await?;
    let carried = snapshot.carry_forward_from(current);
    if carried > 0 {
        debug!(share_id = %share.id, carried, "Carried forward entries of unreadable directories");
    }

    let delta = Delta::detect(current, &snapshot);
    let counts = delta.counts();
    if delta.is_empty() {
        debug!(share_id = %share.id, elapsed_ms = start.elapsed().as_millis() as u64, "No changes detected");
        return Ok(CyclePlan::NoChanges);
    }

    let change_ratio = delta.change_ratio(current.entries.len());
    if delta.exceeds_threshold(current.entries.len(), full_rebuild_threshold) {
        info!(
            share_id = %share.id,
            added = counts.added,
            modified = counts.modified,
            deleted = counts.deleted,
            change_ratio = format!("{:.2}", change_ratio),
            threshold = full_rebuild_threshold,
            "Change ratio above threshold, escalating to full rebuild"
        );
        return Ok(CyclePlan::Escalate {
            change_ratio,
            counts,
        });
    }

    let next = apply_delta(current, &delta);
    debug!(
        share_id = %share.id,
        added = counts.added,
        modified = counts.modified,
        deleted = counts.deleted,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Incremental patch prepared"
    );
    Ok(CyclePlan::Apply {
        next: Box::new(next),
        counts,
    })
}

/// Produce a patched copy of `current`; `current` itself is left untouched.
///
/// Modified entries are replaced at their original position, deletions are
/// removed from the highest index down so earlier offsets stay valid, and
/// additions are appended.
pub fn apply_delta(current: &ShareIndex, delta: &Delta) -> ShareIndex {
    let mut entries = current.entries.clone();
    let mut fingerprints = current.fingerprints.clone();

    let positions: FxHashMap<&str, usize> = current
        .entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.path.as_str(), i))
        .collect();

    for entry in &delta.modified {
        if let Some(&i) = positions.get(entry.path.as_str()) {
            entries[i] = entry.clone();
        }
        fingerprints.insert(entry.path.clone(), entry.fingerprint.clone());
    }

    let mut doomed: Vec<usize> = delta
        .deleted
        .iter()
        .filter_map(|path| positions.get(path.as_str()).copied())
        .collect();
    doomed.sort_unstable_by(|a, b| b.cmp(a));
    for i in doomed {
        entries.remove(i);
    }
    for path in &delta.deleted {
        fingerprints.remove(path);
    }

    for entry in &delta.added {
        fingerprints.insert(entry.path.clone(), entry.fingerprint.clone());
        entries.push(entry.clone());
    }

    let now = Utc::now();
    let mut next = ShareIndex {
        entries,
        fingerprints,
        metadata: current.metadata.clone(),
    };
    next.metadata.status = IndexStatus::Completed;
    next.metadata.progress = 100;
    next.metadata.error = None;
    next.metadata.last_updated_at = Some(now);
    next.metadata.last_incremental_at = Some(now);
    next.metadata.last_change_counts = Some(delta.counts());
    next.refresh_counts();
    next
}
