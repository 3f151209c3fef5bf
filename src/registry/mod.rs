//! Process-wide index façade.
//!
//! [`IndexRegistry`] owns one slot per share: the published index, the build
//! state reported to callers, the per-share operation lock and the incremental
//! timer. Builds, cycles, repairs and deletes of one share are serialized by
//! that lock; different shares never wait on each other.
//!
//! Readers only ever clone the published `Arc<ShareIndex>`, which is replaced
//! in one assignment after the new index has been persisted.

pub mod integrity;

pub use integrity::{IntegrityReport, RepairAction, RepairReport};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{Config, IncrementalConfig};
use crate::error::{validate_share_id, IndexError, Result};
use crate::index::{
    ChangeCounts, CrawlerConfig, IndexMetadata, IndexStatus, PersistenceManager, ShareIndex,
};
use crate::indexer::{plan_cycle, ChangeNotification, CycleOutcome, CyclePlan, IndexBuilder, Scheduler};
use crate::search::{SearchEngine, SearchHit, SearchOptions, SearchResults};
use crate::share::{Listers, ShareDescriptor, ShareRegistry};

const NOTIFICATION_CAPACITY: usize = 256;

/// How long shutdown waits for a running build or cycle per share
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bookkeeping of incremental cycles for one share
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub cycles_run: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub last_outcome: Option<CycleOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncrementalStats {
    pub share_id: String,
    pub enabled: bool,
    /// A timer is currently running for the share
    pub scheduled: bool,
    pub check_interval_secs: u64,
    pub full_rebuild_threshold: f64,
    pub last_incremental_at: Option<DateTime<Utc>>,
    pub last_change_counts: Option<ChangeCounts>,
    #[serde(flatten)]
    pub cycles: CycleStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub share_id: String,
    pub results: Vec<SearchHit>,
    pub total: usize,
    pub elapsed_ms: f64,
    pub status: IndexStatus,
    /// No index is servable yet, or a build is in progress
    pub building: bool,
}

struct ShareSlot {
    live: RwLock<Option<Arc<ShareIndex>>>,
    state: RwLock<IndexMetadata>,
    op_lock: tokio::sync::Mutex<()>,
    /// Bumped by every operation that invalidates in-flight cycles
    generation: AtomicU64,
    build_pending: AtomicBool,
    stats: Mutex<CycleStats>,
}

impl ShareSlot {
    fn new(share_id: &str) -> Self {
        Self {
            live: RwLock::new(None),
            state: RwLock::new(IndexMetadata::not_built(share_id)),
            op_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            build_pending: AtomicBool::new(false),
            stats: Mutex::new(CycleStats::default()),
        }
    }

    fn live(&self) -> Option<Arc<ShareIndex>> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status(&self) -> IndexMetadata {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Swap in a persisted index and report it as current
    fn publish(&self, index: ShareIndex) -> Arc<ShareIndex> {
        let index = Arc::new(index);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = index.metadata.clone();
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(index.clone());
        index
    }

    fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = IndexMetadata::not_built(state.share_id.clone());
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn update_state(&self, update: impl FnOnce(&mut IndexMetadata)) {
        update(&mut self.state.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn mark_building(&self) {
        self.update_state(|s| {
            s.status = IndexStatus::Building;
            s.progress = 0;
            s.error = None;
        });
    }

    fn set_progress(&self, progress: u8) {
        self.update_state(|s| s.progress = progress.min(100));
    }

    fn mark_failed(&self, error: &anyhow::Error) {
        self.update_state(|s| {
            s.status = IndexStatus::Failed;
            s.progress = 0;
            s.error = Some(format!("{:#}", error));
        });
    }

    fn record_cycle(&self, outcome: &CycleOutcome, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.cycles_run += 1;
        stats.last_cycle_at = Some(Utc::now());
        stats.last_cycle_duration_ms = Some(elapsed.as_millis() as u64);
        stats.last_outcome = Some(outcome.clone());
    }

    fn cycle_stats(&self) -> CycleStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The external-facing index API, constructed once per process.
pub struct IndexRegistry {
    shares: Arc<dyn ShareRegistry>,
    listers: Listers,
    builder: IndexBuilder,
    engine: SearchEngine,
    incremental: RwLock<IncrementalConfig>,
    auto_index: bool,
    slots: RwLock<HashMap<String, Arc<ShareSlot>>>,
    scheduler: Scheduler,
    notifications: broadcast::Sender<ChangeNotification>,
}

impl IndexRegistry {
    pub fn new(
        config: &Config,
        shares: Arc<dyn ShareRegistry>,
        listers: Listers,
    ) -> anyhow::Result<Arc<Self>> {
        config.index.incremental.validate()?;
        let crawler_config = CrawlerConfig::from_index_config(&config.index)?;
        let persistence = PersistenceManager::new(
            config.index.resolved_index_dir(),
            config.index.max_cache_age(),
        );
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Arc::new(Self {
            shares,
            listers,
            builder: IndexBuilder::new(crawler_config, persistence),
            engine: SearchEngine::new(),
            incremental: RwLock::new(config.index.incremental),
            auto_index: config.server.auto_index,
            slots: RwLock::new(HashMap::new()),
            scheduler: Scheduler::new(),
            notifications,
        }))
    }

    pub fn persistence(&self) -> &PersistenceManager {
        self.builder.persistence()
    }

    pub fn incremental_config(&self) -> IncrementalConfig {
        *self.incremental.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load persisted indexes, queue builds for the rest and start timers.
    pub async fn init(self: &Arc<Self>) -> anyhow::Result<()> {
        let persistence = self.persistence().clone();
        let swept = tokio::task::spawn_blocking(move || persistence.sweep_temp_files())
            .await
            .context("Temp file sweep panicked")??;

        let mut loaded = 0usize;
        let mut queued = 0usize;
        for share in self.shares.list() {
            if !share.enabled {
                debug!(share_id = %share.id, "Share disabled, not indexing");
                continue;
            }
            if let Err(e) = validate_share_id(&share.id) {
                warn!(error = %e, "Ignoring share with invalid id");
                continue;
            }

            let slot = self.slot(&share.id);
            let persistence = self.persistence().clone();
            let id = share.id.clone();
            let persisted = tokio::task::spawn_blocking(move || persistence.load(&id))
                .await
                .ok()
                .flatten();

            match persisted {
                Some(index) => {
                    info!(
                        share_id = %share.id,
                        total_files = index.metadata.total_files,
                        "Loaded persisted index"
                    );
                    slot.publish(index);
                    loaded += 1;
                }
                None if self.auto_index => {
                    if self.spawn_build(share.clone(), slot) {
                        queued += 1;
                    }
                }
                None => {}
            }
            self.ensure_schedule(&share.id);
        }

        info!(
            loaded,
            queued_builds = queued,
            temp_files_removed = swept,
            "Index registry initialized"
        );
        Ok(())
    }

    /// Stop all timers, giving running operations a grace period to finish.
    pub async fn shutdown(&self) {
        for (share_id, slot) in self.all_slots() {
            match tokio::time::timeout(SHUTDOWN_GRACE, slot.op_lock.lock()).await {
                Ok(_guard) => {
                    self.scheduler.stop(&share_id);
                }
                Err(_) => warn!(
                    share_id = %share_id,
                    "Index operation still running at shutdown, abandoning it"
                ),
            }
        }
        let stopped = self.scheduler.stop_all();
        info!(timers_stopped = stopped, "Index registry shut down");
    }

    /// Current index of a share.
    ///
    /// The first access queues a build and returns `None`. A cached index
    /// older than the max cache age is returned as is while a rebuild runs in
    /// the background. After a failed build, searches do not retry; the timer,
    /// an explicit rebuild or a repair does.
    pub fn get_index(self: &Arc<Self>, share_id: &str) -> Result<Option<Arc<ShareIndex>>> {
        let share = self.enabled_share(share_id)?;
        let slot = self.slot(share_id);
        let live = slot.live();

        match &live {
            None if slot.status().status == IndexStatus::NotBuilt => {
                self.spawn_build(share, slot);
            }
            Some(index) if self.is_stale(index) && slot.status().status != IndexStatus::Failed => {
                debug!(share_id = share_id, "Cached index is stale, rebuilding in background");
                self.spawn_build(share, slot);
            }
            _ => {}
        }
        Ok(live)
    }

    pub fn search(
        self: &Arc<Self>,
        share_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse> {
        let live = self.get_index(share_id)?;
        let status = self.slot(share_id).status().status;

        let results = match &live {
            Some(index) => self.engine.search(index, query, options),
            None => SearchResults::default(),
        };

        Ok(SearchResponse {
            share_id: share_id.to_string(),
            results: results.hits,
            total: results.total,
            elapsed_ms: results.elapsed_ms,
            status,
            building: live.is_none() || status == IndexStatus::Building,
        })
    }

    /// Queue a from-scratch rebuild and return immediately.
    pub fn rebuild_index(self: &Arc<Self>, share_id: &str) -> Result<()> {
        let share = self.enabled_share(share_id)?;
        let handle = Handle::try_current()
            .map_err(|e| anyhow!("No async runtime to run the rebuild on: {}", e))?;

        self.slot(share_id).mark_building();
        let registry = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = registry.rebuild_now(&share.id).await {
                warn!(share_id = %share.id, error = %e, "Rebuild request failed");
            }
        });
        Ok(())
    }

    /// Stop the timer, drop the index from memory and disk, build it again
    /// and restart the timer.
    ///
    /// Build failures are reported through the returned status.
    pub async fn rebuild_now(self: &Arc<Self>, share_id: &str) -> Result<IndexMetadata> {
        let share = self.enabled_share(share_id)?;
        let slot = self.slot(share_id);
        slot.supersede();

        {
            let _guard = slot.op_lock.lock().await;
            self.scheduler.stop(share_id);
            slot.clear();
            self.delete_artifacts(share_id).await;
            // Failure is recorded on the slot
            let _ = self.build_locked(&share, &slot).await;
        }

        self.ensure_schedule(share_id);
        Ok(slot.status())
    }

    pub fn get_status(&self, share_id: &str) -> Result<IndexMetadata> {
        validate_share_id(share_id)?;
        if let Some(slot) = self.existing_slot(share_id) {
            return Ok(slot.status());
        }
        if self.shares.get(share_id).is_some() {
            return Ok(IndexMetadata::not_built(share_id));
        }
        Err(IndexError::ShareNotFound(share_id.to_string()))
    }

    /// Status of every configured share, ordered by id
    pub fn list_statuses(&self) -> Vec<IndexMetadata> {
        let mut statuses: Vec<IndexMetadata> = self
            .shares
            .list()
            .into_iter()
            .map(|share| match self.existing_slot(&share.id) {
                Some(slot) => slot.status(),
                None => IndexMetadata::not_built(share.id),
            })
            .collect();
        statuses.sort_by(|a, b| a.share_id.cmp(&b.share_id));
        statuses
    }

    pub fn get_incremental_stats(&self, share_id: &str) -> Result<IncrementalStats> {
        let status = self.get_status(share_id)?;
        let config = self.incremental_config();
        let cycles = self
            .existing_slot(share_id)
            .map(|slot| slot.cycle_stats())
            .unwrap_or_default();

        Ok(IncrementalStats {
            share_id: share_id.to_string(),
            enabled: config.enabled,
            scheduled: self.scheduler.is_scheduled(share_id),
            check_interval_secs: config.check_interval_secs,
            full_rebuild_threshold: config.full_rebuild_threshold,
            last_incremental_at: status.last_incremental_at,
            last_change_counts: status.last_change_counts,
            cycles,
        })
    }

    /// Run one incremental cycle now and wait for it.
    pub async fn trigger_incremental_update(self: &Arc<Self>, share_id: &str) -> Result<CycleOutcome> {
        validate_share_id(share_id)?;
        if self.shares.get(share_id).is_none() && self.existing_slot(share_id).is_none() {
            return Err(IndexError::ShareNotFound(share_id.to_string()));
        }
        Ok(self.run_cycle(share_id).await)
    }

    /// Replace the incremental settings and recreate every timer.
    pub async fn configure_incremental_update(self: &Arc<Self>, config: IncrementalConfig) -> Result<()> {
        config.validate()?;
        *self.incremental.write().unwrap_or_else(PoisonError::into_inner) = config;

        for (share_id, slot) in self.all_slots() {
            // Never cancel a timer in the middle of a cycle
            let _guard = slot.op_lock.lock().await;
            self.scheduler.stop(&share_id);
        }
        self.scheduler.stop_all();

        if config.enabled {
            for share in self.shares.list() {
                if share.enabled && validate_share_id(&share.id).is_ok() {
                    self.ensure_schedule(&share.id);
                }
            }
        }

        info!(
            enabled = config.enabled,
            check_interval_secs = config.check_interval_secs,
            full_rebuild_threshold = config.full_rebuild_threshold,
            "Incremental updates reconfigured"
        );
        Ok(())
    }

    pub async fn check_integrity(&self, share_id: &str) -> Result<IntegrityReport> {
        validate_share_id(share_id)?;
        let slot = self.existing_slot(share_id);
        if slot.is_none()
            && self.shares.get(share_id).is_none()
            && !self.persistence().exists(share_id)
        {
            return Err(IndexError::ShareNotFound(share_id.to_string()));
        }

        let persistence = self.persistence().clone();
        let id = share_id.to_string();
        let disk = tokio::task::spawn_blocking(move || persistence.inspect(&id))
            .await
            .context("Integrity inspection panicked")?;
        let live = slot.and_then(|s| s.live());

        let report = integrity::assess(share_id, disk, live.as_deref());
        if !report.is_healthy() {
            warn!(
                share_id = share_id,
                action = ?report.action,
                issues = ?report.issues,
                "Index integrity problem detected"
            );
        }
        Ok(report)
    }

    /// Check integrity and carry out the suggested remediation.
    pub async fn repair(self: &Arc<Self>, share_id: &str) -> Result<RepairReport> {
        let before = self.check_integrity(share_id).await?;
        let action = before.action;

        match action {
            RepairAction::Healthy => {}
            RepairAction::Rebuild => {
                self.rebuild_now(share_id).await?;
            }
            RepairAction::RebuildHashes => self.reload_from_disk(share_id, true).await?,
            RepairAction::Reload => self.reload_from_disk(share_id, false).await?,
            RepairAction::Sync => self.sync_to_disk(share_id).await?,
        }

        let after = self.check_integrity(share_id).await?;
        info!(share_id = share_id, action = ?action, healthy = after.is_healthy(), "Repair finished");
        Ok(RepairReport {
            performed: action,
            after,
        })
    }

    /// Drop a share's index from memory and disk and stop its timer.
    pub async fn delete_index(&self, share_id: &str) -> Result<()> {
        validate_share_id(share_id)?;
        let slot = self.existing_slot(share_id);
        if slot.is_none()
            && self.shares.get(share_id).is_none()
            && !self.persistence().exists(share_id)
        {
            return Err(IndexError::ShareNotFound(share_id.to_string()));
        }

        match slot {
            Some(slot) => {
                slot.supersede();
                let _guard = slot.op_lock.lock().await;
                self.scheduler.stop(share_id);
                slot.clear();
                self.delete_artifacts(share_id).await;
            }
            None => {
                self.scheduler.stop(share_id);
                self.delete_artifacts(share_id).await;
            }
        }
        info!(share_id = share_id, "Index deleted");
        Ok(())
    }

    /// Receive a summary after every change applied to an index
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifications.subscribe()
    }

    fn slot(&self, share_id: &str) -> Arc<ShareSlot> {
        if let Some(slot) = self.existing_slot(share_id) {
            return slot;
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(share_id.to_string())
            .or_insert_with(|| Arc::new(ShareSlot::new(share_id)))
            .clone()
    }

    fn existing_slot(&self, share_id: &str) -> Option<Arc<ShareSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(share_id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<(String, Arc<ShareSlot>)> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    fn enabled_share(&self, share_id: &str) -> Result<ShareDescriptor> {
        validate_share_id(share_id)?;
        let share = self
            .shares
            .get(share_id)
            .ok_or_else(|| IndexError::ShareNotFound(share_id.to_string()))?;
        if !share.enabled {
            return Err(IndexError::ShareDisabled(share_id.to_string()));
        }
        Ok(share)
    }

    fn is_stale(&self, index: &ShareIndex) -> bool {
        let max_age = self.persistence().max_cache_age();
        index
            .age()
            .and_then(|age| age.to_std().ok())
            .is_some_and(|age| age > max_age)
    }

    /// Queue a background build unless one is already queued.
    fn spawn_build(self: &Arc<Self>, share: ShareDescriptor, slot: Arc<ShareSlot>) -> bool {
        if slot.build_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(share_id = %share.id, "No async runtime, cannot build index");
            slot.build_pending.store(false, Ordering::SeqCst);
            return false;
        };

        slot.mark_building();
        let generation = slot.generation();
        let registry = Arc::clone(self);
        handle.spawn(async move {
            let built = {
                let _guard = slot.op_lock.lock().await;
                if slot.generation() == generation {
                    registry.build_locked(&share, &slot).await.is_ok()
                } else {
                    debug!(share_id = %share.id, "Queued build superseded");
                    false
                }
            };
            slot.build_pending.store(false, Ordering::SeqCst);
            if built {
                registry.ensure_schedule(&share.id);
            }
        });
        true
    }

    /// Full build of `share`; the caller holds the slot's operation lock.
    async fn build_locked(
        &self,
        share: &ShareDescriptor,
        slot: &Arc<ShareSlot>,
    ) -> anyhow::Result<Arc<ShareIndex>> {
        slot.mark_building();
        if self.shares.get(&share.id).is_none() {
            let e = anyhow!("Share {} no longer exists", share.id);
            slot.mark_failed(&e);
            return Err(e);
        }

        let lister = self.listers.for_kind(share.kind);
        let progress = |p: u8| slot.set_progress(p);
        match self.builder.build(share, lister, &progress).await {
            Ok(index) => Ok(slot.publish(index)),
            Err(e) => {
                error!(share_id = %share.id, error = %format!("{:#}", e), "Full rebuild failed");
                slot.mark_failed(&e);
                Err(e)
            }
        }
    }

    /// Start the share's incremental timer if enabled and not already running
    fn ensure_schedule(self: &Arc<Self>, share_id: &str) {
        let config = self.incremental_config();
        if !config.enabled || Handle::try_current().is_err() {
            return;
        }

        let registry = Arc::downgrade(self);
        let id = share_id.to_string();
        self.scheduler.ensure(share_id, config.check_interval(), move || {
            let registry = registry.clone();
            let id = id.clone();
            async move {
                let Some(registry) = registry.upgrade() else {
                    return false;
                };
                registry.run_cycle(&id).await != CycleOutcome::ShareRemoved
            }
        });
    }

    async fn run_cycle(self: &Arc<Self>, share_id: &str) -> CycleOutcome {
        let started = Instant::now();
        let outcome = self.cycle(share_id).await;

        match &outcome {
            CycleOutcome::Applied { .. }
            | CycleOutcome::Escalated { .. }
            | CycleOutcome::Rebuilt { .. }
            | CycleOutcome::ShareRemoved => {
                info!(share_id = share_id, outcome = ?outcome, "Incremental cycle finished")
            }
            CycleOutcome::Failed { error } => {
                warn!(share_id = share_id, error = %error, "Incremental cycle failed")
            }
            _ => debug!(share_id = share_id, outcome = ?outcome, "Incremental cycle finished"),
        }

        if let Some(slot) = self.existing_slot(share_id) {
            slot.record_cycle(&outcome, started.elapsed());
        }
        outcome
    }

    async fn cycle(self: &Arc<Self>, share_id: &str) -> CycleOutcome {
        let Some(share) = self.shares.get(share_id) else {
            self.remove_share(share_id).await;
            return CycleOutcome::ShareRemoved;
        };
        if !share.enabled {
            return CycleOutcome::Skipped {
                reason: "share is disabled".to_string(),
            };
        }

        let slot = self.slot(share_id);
        let generation = slot.generation();
        let _guard = slot.op_lock.lock().await;
        if slot.generation() != generation {
            return CycleOutcome::Superseded;
        }

        let Some(current) = slot.live() else {
            return match self.build_locked(&share, &slot).await {
                Ok(index) => {
                    self.ensure_schedule(share_id);
                    CycleOutcome::Rebuilt {
                        total_files: index.metadata.total_files,
                    }
                }
                Err(e) => CycleOutcome::failed(e),
            };
        };

        let threshold = self.incremental_config().full_rebuild_threshold;
        let crawler = self.builder.crawler(self.listers.for_kind(share.kind));
        let plan = match plan_cycle(&share, &current, &crawler, threshold).await {
            Ok(plan) => plan,
            Err(e) => return CycleOutcome::failed(e),
        };
        if slot.generation() != generation {
            return CycleOutcome::Superseded;
        }

        match plan {
            CyclePlan::NoChanges => CycleOutcome::NoChanges,
            CyclePlan::Escalate {
                change_ratio,
                counts,
            } => match self.build_locked(&share, &slot).await {
                Ok(index) => {
                    self.notify(share_id, counts, index.metadata.total_files);
                    CycleOutcome::Escalated {
                        change_ratio,
                        total_changes: counts.total(),
                    }
                }
                Err(e) => CycleOutcome::failed(e),
            },
            CyclePlan::Apply { next, counts } => {
                // On failure the live index stays as it was
                let next = match self.builder.persist(*next).await {
                    Ok(next) => next,
                    Err(e) => return CycleOutcome::failed(e.context("Incremental patch not persisted")),
                };
                let published = slot.publish(next);
                let total_files = published.metadata.total_files;
                self.notify(share_id, counts, total_files);
                CycleOutcome::Applied {
                    added: counts.added,
                    modified: counts.modified,
                    deleted: counts.deleted,
                    total_files,
                }
            }
        }
    }

    /// The share disappeared from configuration: forget everything about it.
    async fn remove_share(&self, share_id: &str) {
        if let Some(slot) = self.existing_slot(share_id) {
            slot.supersede();
            let _guard = slot.op_lock.lock().await;
            slot.clear();
            self.delete_artifacts(share_id).await;
        } else {
            self.delete_artifacts(share_id).await;
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(share_id);
        info!(share_id = share_id, "Share no longer exists, index removed");
        // Last: this may be the share's own timer task
        self.scheduler.stop(share_id);
    }

    async fn reload_from_disk(&self, share_id: &str, rewrite: bool) -> Result<()> {
        let slot = self.slot(share_id);
        slot.supersede();
        let _guard = slot.op_lock.lock().await;

        let persistence = self.persistence().clone();
        let id = share_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || persistence.read(&id, None))
            .await
            .context("Index reload panicked")??
            .ok_or_else(|| anyhow!("No persisted index to reload for share {}", share_id))?;

        // Rewriting persists the reconstructed fingerprint map
        let index = if rewrite {
            self.builder.persist(loaded).await?
        } else {
            loaded
        };
        slot.publish(index);
        Ok(())
    }

    async fn sync_to_disk(&self, share_id: &str) -> Result<()> {
        let slot = self
            .existing_slot(share_id)
            .ok_or_else(|| IndexError::ShareNotFound(share_id.to_string()))?;
        let _guard = slot.op_lock.lock().await;
        let live = slot
            .live()
            .ok_or_else(|| anyhow!("No index in memory for share {}", share_id))?;

        let persistence = self.persistence().clone();
        tokio::task::spawn_blocking(move || persistence.save(&live))
            .await
            .context("Index sync panicked")??;
        Ok(())
    }

    async fn delete_artifacts(&self, share_id: &str) {
        let persistence = self.persistence().clone();
        let id = share_id.to_string();
        let result = tokio::task::spawn_blocking(move || persistence.delete(&id)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(share_id = share_id, error = %e, "Failed to delete index artifacts"),
            Err(e) => error!(share_id = share_id, error = %e, "Artifact deletion panicked"),
        }
    }

    fn notify(&self, share_id: &str, counts: ChangeCounts, total_files: usize) {
        // No subscribers is fine
        let _ = self.notifications.send(ChangeNotification {
            share_id: share_id.to_string(),
            added: counts.added,
            modified: counts.modified,
            deleted: counts.deleted,
            total_files,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::crawler::test_support::MockLister;
    use crate::index::EntryKind;
    use crate::share::StaticShareRegistry;
    use tempfile::TempDir;

    struct Fixture {
        registry: Arc<IndexRegistry>,
        shares: Arc<StaticShareRegistry>,
        lister: Arc<MockLister>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(customize: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.index.index_dir = Some(dir.path().to_path_buf());
        config.index.incremental.enabled = false;
        config.server.auto_index = false;
        customize(&mut config);

        let shares = Arc::new(StaticShareRegistry::new(vec![ShareDescriptor::local(
            "docs", "/mock",
        )]));
        let lister = Arc::new(MockLister::new());
        let registry = IndexRegistry::new(&config, shares.clone(), Listers::uniform(lister.clone())).unwrap();

        Fixture {
            registry,
            shares,
            lister,
            _dir: dir,
        }
    }

    async fn wait_for_status(registry: &IndexRegistry, share_id: &str, status: IndexStatus) {
        for _ in 0..200 {
            if registry.get_status(share_id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("share {} never reached {:?}", share_id, status);
    }

    #[tokio::test]
    async fn test_end_to_end_incremental_scenario() {
        let f = fixture();
        f.lister.add_file("/a.txt", 10, 100);
        f.lister.add_file("/docs/b.pdf", 20, 100);

        let status = f.registry.rebuild_now("docs").await.unwrap();
        assert_eq!(status.status, IndexStatus::Completed);
        assert_eq!(status.total_files, 2);

        f.lister.add_file("/a.txt", 15, 100);
        f.lister.add_file("/docs/c.txt", 5, 100);

        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Applied {
                added: 1,
                modified: 1,
                deleted: 0,
                total_files: 3
            }
        );

        let status = f.registry.get_status("docs").unwrap();
        assert_eq!(
            status.last_change_counts,
            Some(ChangeCounts {
                added: 1,
                modified: 1,
                deleted: 0
            })
        );
        assert_eq!(status.total_files, 3);

        let options = SearchOptions::default().with_kind(EntryKind::File);
        let response = f.registry.search("docs", "doc", &options).unwrap();
        let mut names: Vec<&str> = response.results.iter().map(|h| h.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["b.pdf", "c.txt"]);
        assert!(!response.building);

        // The applied patch was persisted
        let on_disk = f.registry.persistence().load("docs").unwrap();
        assert_eq!(on_disk.metadata.total_files, 3);
    }

    #[tokio::test]
    async fn test_threshold_escalates_to_full_rebuild() {
        let f = fixture();
        for i in 0..10 {
            f.lister.add_file(&format!("/f{}.txt", i), 1, 1);
        }
        f.registry.rebuild_now("docs").await.unwrap();

        for i in 0..5 {
            f.lister.add_file(&format!("/f{}.txt", i), 2, 2);
        }
        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        match outcome {
            CycleOutcome::Escalated {
                change_ratio,
                total_changes,
            } => {
                assert_eq!(total_changes, 5);
                assert!(change_ratio > 0.30);
            }
            other => panic!("expected escalation, got {:?}", other),
        }

        let status = f.registry.get_status("docs").unwrap();
        assert_eq!(status.status, IndexStatus::Completed);
        // A full rebuild does not record incremental counts
        assert!(status.last_incremental_at.is_none());
        let stats = f.registry.get_incremental_stats("docs").unwrap();
        assert_eq!(stats.cycles.cycles_run, 1);
    }

    #[tokio::test]
    async fn test_first_access_builds_in_background() {
        let f = fixture();
        f.lister.add_file("/report.txt", 1, 1);

        let first = f.registry.search("docs", "report", &SearchOptions::default()).unwrap();
        assert!(first.building);
        assert!(first.results.is_empty());

        wait_for_status(&f.registry, "docs", IndexStatus::Completed).await;
        let second = f.registry.search("docs", "report", &SearchOptions::default()).unwrap();
        assert!(!second.building);
        assert_eq!(second.total, 1);
    }

    #[tokio::test]
    async fn test_failed_stale_rebuild_is_not_retried_by_searches() {
        let f = fixture_with(|config| config.index.max_cache_age_secs = 0);
        f.lister.add_file("/a.txt", 1, 1);
        f.registry.rebuild_now("docs").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The share becomes unreachable; the stale index triggers one rebuild
        f.lister.fail_dir("/");
        let first = f.registry.search("docs", "a", &SearchOptions::default()).unwrap();
        assert_eq!(first.total, 1);
        wait_for_status(&f.registry, "docs", IndexStatus::Failed).await;

        let listings = f.lister.calls.load(Ordering::SeqCst);
        for _ in 0..5 {
            let response = f.registry.search("docs", "a", &SearchOptions::default()).unwrap();
            // The previous index keeps serving
            assert_eq!(response.total, 1);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.lister.calls.load(Ordering::SeqCst), listings);
        assert_eq!(f.registry.get_status("docs").unwrap().status, IndexStatus::Failed);

        // An explicit rebuild still retries
        f.lister.heal_dir("/");
        let status = f.registry.rebuild_now("docs").await.unwrap();
        assert_eq!(status.status, IndexStatus::Completed);
    }

    #[tokio::test]
    async fn test_rebuild_supersedes_running_cycle() {
        let f = fixture();
        for i in 0..10 {
            f.lister.add_file(&format!("/f{}.txt", i), 1, 1);
        }
        f.registry.rebuild_now("docs").await.unwrap();
        f.lister.add_file("/f0.txt", 2, 2);

        // Park the cycle inside its diff crawl, holding the operation lock
        f.lister.block_listings();
        let registry = f.registry.clone();
        let cycle = tokio::spawn(async move { registry.trigger_incremental_update("docs").await });
        f.lister.wait_until_blocked().await;

        let slot = f.registry.slot("docs");
        let generation = slot.generation();
        let registry = f.registry.clone();
        let rebuild = tokio::spawn(async move { registry.rebuild_now("docs").await });
        while slot.generation() == generation {
            tokio::task::yield_now().await;
        }
        f.lister.release_listings();

        assert_eq!(cycle.await.unwrap().unwrap(), CycleOutcome::Superseded);
        let status = rebuild.await.unwrap().unwrap();
        assert_eq!(status.status, IndexStatus::Completed);

        // Memory and disk both hold the rebuild's index, not a patched one
        let live = slot.live().unwrap();
        assert!(live.metadata.last_incremental_at.is_none());
        assert!(live.entries.iter().any(|e| e.path == "/f0.txt" && e.size == 2));
        let on_disk = f.registry.persistence().load("docs").unwrap();
        assert!(on_disk.metadata.last_incremental_at.is_none());
        assert_eq!(on_disk.entries, live.entries);
        assert!(f.registry.check_integrity("docs").await.unwrap().is_healthy());

        let stats = f.registry.get_incremental_stats("docs").unwrap();
        assert_eq!(stats.cycles.last_outcome, Some(CycleOutcome::Superseded));
    }

    #[tokio::test]
    async fn test_delete_supersedes_running_cycle() {
        let f = fixture();
        for i in 0..10 {
            f.lister.add_file(&format!("/f{}.txt", i), 1, 1);
        }
        f.registry.rebuild_now("docs").await.unwrap();
        f.lister.add_file("/new.txt", 1, 1);

        f.lister.block_listings();
        let registry = f.registry.clone();
        let cycle = tokio::spawn(async move { registry.trigger_incremental_update("docs").await });
        f.lister.wait_until_blocked().await;

        let slot = f.registry.slot("docs");
        let generation = slot.generation();
        let registry = f.registry.clone();
        let delete = tokio::spawn(async move { registry.delete_index("docs").await });
        while slot.generation() == generation {
            tokio::task::yield_now().await;
        }
        f.lister.release_listings();

        assert_eq!(cycle.await.unwrap().unwrap(), CycleOutcome::Superseded);
        delete.await.unwrap().unwrap();

        assert!(slot.live().is_none());
        assert!(!f.registry.persistence().exists("docs"));
        assert_eq!(f.registry.get_status("docs").unwrap().status, IndexStatus::NotBuilt);
    }

    #[tokio::test]
    async fn test_torn_commit_is_reported_and_repaired() {
        let f = fixture();
        for i in 0..10 {
            f.lister.add_file(&format!("/f{}.txt", i), 1, 1);
        }
        f.registry.rebuild_now("docs").await.unwrap();
        let paths = f.registry.persistence().paths("docs");
        let old_hashes = std::fs::read(&paths.fingerprints).unwrap();
        let old_metadata = std::fs::read(&paths.metadata).unwrap();

        // One modification keeps the entry count unchanged
        f.lister.add_file("/f3.txt", 7, 9);
        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { modified: 1, .. }));

        // Crash after the entries rename: older hashes and metadata remain
        std::fs::write(&paths.fingerprints, old_hashes).unwrap();
        std::fs::write(&paths.metadata, old_metadata).unwrap();

        assert!(f.registry.persistence().load("docs").is_none());
        let report = f.registry.check_integrity("docs").await.unwrap();
        assert_eq!(report.action, RepairAction::Sync);
        assert!(!report.disk.commits_agree);

        let repaired = f.registry.repair("docs").await.unwrap();
        assert!(repaired.after.is_healthy());
        let on_disk = f.registry.persistence().load("docs").unwrap();
        assert!(on_disk.entries.iter().any(|e| e.path == "/f3.txt" && e.size == 7));
    }

    #[tokio::test]
    async fn test_no_changes_writes_nothing() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        f.registry.rebuild_now("docs").await.unwrap();
        let before = f.registry.get_status("docs").unwrap();

        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoChanges);
        assert_eq!(f.registry.get_status("docs").unwrap().last_updated_at, before.last_updated_at);
    }

    #[tokio::test]
    async fn test_cycle_without_index_runs_full_build() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        assert_eq!(outcome, CycleOutcome::Rebuilt { total_files: 1 });
    }

    #[tokio::test]
    async fn test_disabled_and_removed_shares() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        f.registry.rebuild_now("docs").await.unwrap();

        f.shares.set_enabled("docs", false);
        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped { .. }));
        assert!(matches!(
            f.registry.search("docs", "a", &SearchOptions::default()),
            Err(IndexError::ShareDisabled(_))
        ));

        f.shares.remove("docs");
        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        assert_eq!(outcome, CycleOutcome::ShareRemoved);
        assert!(!f.registry.persistence().exists("docs"));
        assert!(matches!(
            f.registry.get_status("docs"),
            Err(IndexError::ShareNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_share_id_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.registry.search("../x", "a", &SearchOptions::default()),
            Err(IndexError::InvalidShareId(_))
        ));
        assert!(matches!(
            f.registry.trigger_incremental_update("").await,
            Err(IndexError::InvalidShareId(_))
        ));
        assert!(matches!(
            f.registry.rebuild_index("nope"),
            Err(IndexError::ShareNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_live_index() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        for i in 0..9 {
            f.lister.add_file(&format!("/keep{}.txt", i), 1, 1);
        }
        f.registry.rebuild_now("docs").await.unwrap();

        // Make the index directory unusable
        let index_dir = f.registry.persistence().index_dir().to_path_buf();
        std::fs::remove_dir_all(&index_dir).unwrap();
        std::fs::write(&index_dir, b"not a directory").unwrap();

        f.lister.add_file("/b.txt", 1, 1);
        let outcome = f.registry.trigger_incremental_update("docs").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Failed { .. }));

        let status = f.registry.get_status("docs").unwrap();
        assert_eq!(status.status, IndexStatus::Completed);
        assert_eq!(status.total_files, 10);
        // The unpersisted addition never became searchable
        let response = f.registry.search("docs", "b", &SearchOptions::default()).unwrap();
        assert_eq!(response.total, 0);
    }

    #[tokio::test]
    async fn test_integrity_check_and_repair() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        f.lister.add_file("/b.txt", 1, 1);
        f.registry.rebuild_now("docs").await.unwrap();
        assert!(f.registry.check_integrity("docs").await.unwrap().is_healthy());

        // Truncate the entries artifact
        let entries_path = f.registry.persistence().paths("docs").entries;
        let bytes = std::fs::read(&entries_path).unwrap();
        std::fs::write(&entries_path, &bytes[..bytes.len() / 2]).unwrap();

        let report = f.registry.check_integrity("docs").await.unwrap();
        assert!(!report.is_healthy());
        assert_eq!(report.action, RepairAction::Sync);

        let repaired = f.registry.repair("docs").await.unwrap();
        assert_eq!(repaired.performed, RepairAction::Sync);
        assert!(repaired.after.is_healthy());
    }

    #[tokio::test]
    async fn test_missing_hashes_are_rebuilt() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        f.registry.rebuild_now("docs").await.unwrap();

        std::fs::remove_file(f.registry.persistence().paths("docs").fingerprints).unwrap();
        let report = f.registry.check_integrity("docs").await.unwrap();
        assert_eq!(report.action, RepairAction::RebuildHashes);

        let repaired = f.registry.repair("docs").await.unwrap();
        assert!(repaired.after.is_healthy());
        assert!(f.registry.persistence().paths("docs").fingerprints.exists());
    }

    #[tokio::test]
    async fn test_delete_index_clears_memory_and_disk() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        f.registry.rebuild_now("docs").await.unwrap();
        assert!(f.registry.persistence().exists("docs"));

        f.registry.delete_index("docs").await.unwrap();
        assert!(!f.registry.persistence().exists("docs"));
        assert_eq!(f.registry.get_status("docs").unwrap().status, IndexStatus::NotBuilt);
    }

    #[tokio::test]
    async fn test_applied_changes_are_broadcast() {
        let f = fixture();
        for i in 0..10 {
            f.lister.add_file(&format!("/f{}.txt", i), 1, 1);
        }
        f.registry.rebuild_now("docs").await.unwrap();
        let mut rx = f.registry.subscribe();

        f.lister.remove("/f0.txt");
        f.registry.trigger_incremental_update("docs").await.unwrap();

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.share_id, "docs");
        assert_eq!(notification.deleted, 1);
        assert_eq!(notification.total_files, 9);
    }

    #[tokio::test]
    async fn test_init_loads_persisted_index() {
        let f = fixture();
        f.lister.add_file("/a.txt", 1, 1);
        f.registry.rebuild_now("docs").await.unwrap();

        let mut config = Config::default();
        config.index.index_dir = Some(f.registry.persistence().index_dir().to_path_buf());
        config.index.incremental.enabled = false;
        config.server.auto_index = false;
        let restarted =
            IndexRegistry::new(&config, f.shares.clone(), Listers::uniform(f.lister.clone())).unwrap();
        restarted.init().await.unwrap();

        let status = restarted.get_status("docs").unwrap();
        assert_eq!(status.status, IndexStatus::Completed);
        assert_eq!(status.total_files, 1);
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfigure_restarts_timers() {
        let f = fixture();
        assert!(!f.registry.get_incremental_stats("docs").unwrap().scheduled);

        let config = IncrementalConfig {
            enabled: true,
            check_interval_secs: 3600,
            full_rebuild_threshold: 0.5,
        };
        f.registry.configure_incremental_update(config).await.unwrap();
        let stats = f.registry.get_incremental_stats("docs").unwrap();
        assert!(stats.scheduled);
        assert_eq!(stats.check_interval_secs, 3600);

        let invalid = IncrementalConfig {
            check_interval_secs: 0,
            ..config
        };
        assert!(f.registry.configure_incremental_update(invalid).await.is_err());

        f.registry
            .configure_incremental_update(IncrementalConfig {
                enabled: false,
                ..config
            })
            .await
            .unwrap();
        assert!(!f.registry.get_incremental_stats("docs").unwrap().scheduled);
    }
}
