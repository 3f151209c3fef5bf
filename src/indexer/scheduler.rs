//! Per-share periodic timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// One cancellable ticker task per share.
///
/// A tick runs to completion before the next one is awaited, so cycles of the
/// same share never overlap; a slow cycle delays the following tick instead
/// of queueing a burst.
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a timer for `share_id` unless a live one already exists.
    ///
    /// `tick` runs every `period`, first after one full period. It returns
    /// `false` to end the timer. Returns whether a new timer was started.
    pub fn ensure<F, Fut>(&self, share_id: &str, period: Duration, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers.get(share_id).is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let id = share_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick().await {
                    debug!(share_id = %id, "Timer finished");
                    break;
                }
            }
        });
        timers.insert(share_id.to_string(), handle);
        debug!(share_id = share_id, period_secs = period.as_secs(), "Timer started");
        true
    }

    /// Cancel the timer of `share_id`. Returns whether one was running.
    pub fn stop(&self, share_id: &str) -> bool {
        let handle = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(share_id);
        match handle {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                debug!(share_id = share_id, "Timer stopped");
                was_running
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let drained: Vec<(String, JoinHandle<()>)> = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let count = drained.len();
        for (_, handle) in drained {
            handle.abort();
        }
        count
    }

    pub fn is_scheduled(&self, share_id: &str) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(share_id)
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
