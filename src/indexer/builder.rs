//! Full index rebuilds.
//!
//! A build crawls the whole share, stamps the result as completed and writes
//! it to disk. Publishing the result is left to the caller, which must only
//! swap it in after this returns `Ok`, so disk always holds at least what
//! memory serves.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::index::crawler::ProgressFn;
use crate::index::{CrawlMode, Crawler, CrawlerConfig, PersistenceManager, ShareIndex};
use crate::share::{DirectoryLister, ShareDescriptor};
use crate::utils::{format_bytes, format_number};

/// Progress reported while persisting
pub const PROGRESS_PERSISTING: u8 = 90;

#[derive(Debug, Clone)]
pub struct IndexBuilder {
    crawler_config: CrawlerConfig,
    persistence: PersistenceManager,
}

impl IndexBuilder {
    pub fn new(crawler_config: CrawlerConfig, persistence: PersistenceManager) -> Self {
        Self {
            crawler_config,
            persistence,
        }
    }

    pub fn crawler_config(&self) -> &CrawlerConfig {
        &self.crawler_config
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    pub fn crawler(&self, lister: Arc<dyn DirectoryLister>) -> Crawler {
        Crawler::new(lister, self.crawler_config.clone())
    }

    /// Crawl `share` from scratch and persist the result.
    pub async fn build(
        &self,
        share: &ShareDescriptor,
        lister: Arc<dyn DirectoryLister>,
        progress: ProgressFn<'_>,
    ) -> Result<ShareIndex> {
        let start = Instant::now();
        info!(share_id = %share.id, root = %share.root.display(), "Starting full rebuild");

        let snapshot = self
            .crawler(lister)
            .crawl(share, CrawlMode::Full, Some(progress))
            .await?;
        let directories_listed = snapshot.directories_listed;
        let unreadable = snapshot.unreadable_dirs.len();

        let index = ShareIndex::completed(
            &share.id,
            snapshot.entries,
            snapshot.fingerprints,
            start.elapsed().as_millis() as u64,
        );

        progress(PROGRESS_PERSISTING);
        let index = self.persist(index).await?;
        progress(100);

        log_completion_stats(&index, directories_listed, unreadable, start);
        Ok(index)
    }

    /// Write `index` to disk off the async runtime and hand it back.
    pub async fn persist(&self, index: ShareIndex) -> Result<ShareIndex> {
        let persistence = self.persistence.clone();
        let share_id = index.metadata.share_id.clone();
        let result = tokio::task::spawn_blocking(move || persistence.save(&index).map(|_| index))
            .await
            .context("Persistence task panicked")?;

        if let Err(e) = &result {
            error!(share_id = %share_id, error = %e, "Failed to persist index");
        }
        result
    }
}

fn log_completion_stats(
    index: &ShareIndex,
    directories_listed: usize,
    unreadable: usize,
    start: Instant,
) {
    let elapsed = start.elapsed();
    let entries_per_sec = if elapsed.as_secs_f64() > 0.0 {
        index.entries.len() as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    let indexed_size: u64 = index.entries.iter().map(|e| e.size).sum();

    // Get current process memory usage
    let process_memory = {
        use sysinfo::{Pid, ProcessesToUpdate, System};
        let pid = Pid::from_u32(std::process::id());
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| p.memory()).unwrap_or(0)
    };

    info!(
        share_id = %index.metadata.share_id,
        elapsed_secs = format!("{:.1}", elapsed.as_secs_f64()),
        files = %format_number(index.metadata.total_files),
        entries = %format_number(index.metadata.total_entries),
        directories_listed = %format_number(directories_listed),
        unreadable_dirs = unreadable,
        entries_per_sec = format!("{:.0}", entries_per_sec),
        indexed_size = %format_bytes(indexed_size),
        process_memory = %format_bytes(process_memory),
        "Full rebuild completed"
    );
}
