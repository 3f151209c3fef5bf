//! Share crawler.
//!
//! Walks a share breadth first through its [`DirectoryLister`], one depth
//! level at a time. Directories of a level are listed concurrently (bounded by
//! the lister's cap or the batch size) and their children are turned into
//! [`IndexEntry`] values in batches, fingerprinted and tokenized on the way.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::entry::{EntryKind, FingerprintMap, IndexEntry, ShareIndex};
use crate::config::IndexConfig;
use crate::share::{DirectoryLister, ListedEntry, ShareDescriptor};
use crate::utils::is_under;

/// Hard cap on recursion, guards against cyclic or pathological trees
pub const MAX_CRAWL_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlMode {
    /// Building a new index from scratch; reports progress
    Full,
    /// Capturing the latest state to diff against the live index
    Diff,
}

/// Crawl tuning, compiled once from [`IndexConfig`]
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub batch_size: usize,
    pub max_depth: usize,
    exclude: GlobSet,
}

impl CrawlerConfig {
    pub fn new(batch_size: usize, max_depth: usize, exclude_patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid exclude pattern: {}", pattern))?,
            );
        }
        Ok(Self {
            batch_size: batch_size.max(1),
            max_depth: max_depth.clamp(1, MAX_CRAWL_DEPTH),
            exclude: builder.build().context("Failed to compile exclude patterns")?,
        })
    }

    pub fn from_index_config(config: &IndexConfig) -> Result<Self> {
        Self::new(config.batch_size, config.max_depth, &config.exclude_patterns)
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude.is_match(name)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_depth: MAX_CRAWL_DEPTH,
            exclude: GlobSet::empty(),
        }
    }
}

/// A point-in-time view of a share
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<IndexEntry>,
    pub fingerprints: FingerprintMap,
    /// Directories whose listing failed; their contents are unknown
    pub unreadable_dirs: Vec<String>,
    pub directories_listed: usize,
}

impl Snapshot {
    fn push(&mut self, entry: IndexEntry) {
        self.fingerprints
            .insert(entry.path.clone(), entry.fingerprint.clone());
        self.entries.push(entry);
    }

    /// Copy entries living under unreadable directories from `previous`.
    ///
    /// A directory that failed to list is treated as unchanged rather than
    /// emptied, so a transient error does not turn into mass deletion.
    pub fn carry_forward_from(&mut self, previous: &ShareIndex) -> usize {
        if self.unreadable_dirs.is_empty() {
            return 0;
        }
        let mut carried = 0;
        for entry in &previous.entries {
            if self.fingerprints.contains_key(&entry.path) {
                continue;
            }
            let hidden = self
                .unreadable_dirs
                .iter()
                .any(|dir| entry.path != *dir && is_under(&entry.path, dir));
            if hidden {
                self.push(entry.clone());
                carried += 1;
            }
        }
        carried
    }
}

/// Progress callback, receives 0-80 while the crawl runs
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

pub struct Crawler {
    lister: Arc<dyn DirectoryLister>,
    config: CrawlerConfig,
}

impl Crawler {
    pub fn new(lister: Arc<dyn DirectoryLister>, config: CrawlerConfig) -> Self {
        Self { lister, config }
    }

    fn concurrency(&self) -> usize {
        match self.lister.max_concurrency() {
            Some(cap) => cap.max(1),
            None => self.config.batch_size,
        }
    }

    /// Walk `share` and return every reachable entry.
    ///
    /// Only a failure to list the share root aborts the crawl. Anything below
    /// it that cannot be read is skipped and recorded.
    pub async fn crawl(
        &self,
        share: &ShareDescriptor,
        mode: CrawlMode,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Snapshot> {
        let start = Instant::now();
        let report = |value: u8| {
            if let (CrawlMode::Full, Some(cb)) = (mode, progress) {
                cb(value);
            }
        };
        report(0);

        let root_listing = self
            .lister
            .list(share, "/")
            .await
            .with_context(|| format!("Failed to list root of share {}", share.id))?;

        let mut snapshot = Snapshot {
            directories_listed: 1,
            ..Default::default()
        };
        let mut frontier: Vec<(String, Vec<ListedEntry>)> = vec![("/".to_string(), root_listing)];
        let concurrency = self.concurrency();
        let mut reported = 0u8;

        for depth in 1..=self.config.max_depth {
            let mut next_dirs: Vec<String> = Vec::new();

            for (dir, listing) in &frontier {
                for batch in listing.chunks(self.config.batch_size) {
                    for listed in batch {
                        if self.config.is_excluded(&listed.name) {
                            debug!(share_id = %share.id, dir = %dir, name = %listed.name, "Excluded by pattern");
                            continue;
                        }
                        let entry = IndexEntry::from_listing(dir, listed);
                        if entry.kind == EntryKind::Directory && depth < self.config.max_depth {
                            next_dirs.push(entry.path.clone());
                        }
                        snapshot.push(entry);
                    }
                    tokio::task::yield_now().await;
                }
            }

            if next_dirs.is_empty() {
                break;
            }

            let pending = next_dirs.len();
            let lister = &self.lister;
            let listings: Vec<(String, Result<Vec<ListedEntry>>)> = stream::iter(next_dirs)
                .map(|dir| async move {
                    let result = lister.list(share, &dir).await;
                    (dir, result)
                })
                .buffered(concurrency)
                .collect()
                .await;

            frontier = Vec::with_capacity(listings.len());
            for (dir, result) in listings {
                match result {
                    Ok(listing) => {
                        snapshot.directories_listed += 1;
                        frontier.push((dir, listing));
                    }
                    Err(e) => {
                        warn!(share_id = %share.id, dir = %dir, error = %e, "Skipping unreadable directory");
                        snapshot.unreadable_dirs.push(dir);
                    }
                }
            }

            let done = snapshot.directories_listed as f64;
            let estimate = (done / (done + pending as f64)).min(1.0);
            let value = ((depth as f64 / self.config.max_depth as f64).max(estimate) * 80.0) as u8;
            reported = reported.max(value.min(80));
            report(reported);
        }

        // Leaf-level directories are emitted but never listed
        report(80);

        match mode {
            CrawlMode::Full => info!(
                share_id = %share.id,
                entries = snapshot.entries.len(),
                directories = snapshot.directories_listed,
                unreadable = snapshot.unreadable_dirs.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Crawl completed"
            ),
            CrawlMode::Diff => debug!(
                share_id = %share.id,
                entries = snapshot.entries.len(),
                unreadable = snapshot.unreadable_dirs.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Diff crawl completed"
            ),
        }

        Ok(snapshot)
    }
}
