//! Persistent retry queue for failed position submissions
//!
//! Entries live in the state store under `location_queue` so they survive the
//! background task being respawned. Capacity is bounded: on overflow the
//! oldest entry is evicted regardless of its retry count.
//!
//! `drain` resends entries whose backoff (`2^retry_count` seconds since the
//! last attempt, or since enqueue) has elapsed. A failed entry is retried up
//! to `max_retries` times and then dropped. Only one drain runs at a time; a
//! second call while one is in flight returns `None` immediately.

use crate::domain::types::{QueuedSubmission, Submission};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::remote_api::RemoteLocationApi;
use crate::io::store::{keys, load_json, save_json, StateStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub capacity: usize,
    pub max_retries: u32,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self { capacity: config.queue_capacity(), max_retries: config.queue_max_retries() }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Outcome counts of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Skipped because their backoff has not elapsed
    pub deferred: usize,
}

#[derive(Debug)]
enum Outcome {
    Delivered,
    Failed { attempted_at_ms: u64 },
    Dropped,
}

/// Minimum wait before the next attempt of an entry
pub fn backoff_ms(retry_count: u32) -> u64 {
    1000u64.saturating_mul(1u64.checked_shl(retry_count).unwrap_or(u64::MAX))
}

fn is_due(entry: &QueuedSubmission, now_ms: u64) -> bool {
    let since = entry.last_attempt_at_ms.unwrap_or(entry.enqueued_at_ms);
    now_ms.saturating_sub(since) >= backoff_ms(entry.retry_count)
}

/// Clears the busy flag when a drain finishes or is cancelled
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RetryQueue {
    store: Arc<dyn StateStore>,
    settings: QueueSettings,
    metrics: Arc<Metrics>,
    /// Set while a drain is in flight
    draining: AtomicBool,
    /// Serializes read-modify-write of the persisted queue
    write_lock: Mutex<()>,
}

impl RetryQueue {
    pub fn new(store: Arc<dyn StateStore>, settings: QueueSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            settings,
            metrics,
            draining: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Current entries, oldest first
    ///
    /// A corrupt persisted queue reads as empty; the next write replaces it.
    pub async fn entries(&self) -> Vec<QueuedSubmission> {
        match load_json::<Vec<QueuedSubmission>>(self.store.as_ref(), keys::LOCATION_QUEUE).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "queue_load_failed");
                Vec::new()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub async fn enqueue(&self, submission: &Submission, now_ms: u64) -> Result<(), StoreError> {
        let _lock = self.write_lock.lock().await;

        let mut entries = self.entries().await;
        let entry = QueuedSubmission::new(submission, now_ms);
        let id = entry.id.clone();
        entries.push(entry);

        let overflow = entries.len().saturating_sub(self.settings.capacity);
        if overflow > 0 {
            let evicted: Vec<_> = entries.drain(..overflow).collect();
            for old in &evicted {
                warn!(
                    id = %old.id,
                    retry_count = %old.retry_count,
                    enqueued_at_ms = %old.enqueued_at_ms,
                    "queue_entry_evicted"
                );
            }
            self.metrics.record_queue_evicted(evicted.len() as u64);
        }

        save_json(self.store.as_ref(), keys::LOCATION_QUEUE, &entries).await?;
        debug!(id = %id, depth = %entries.len(), "queue_entry_added");
        Ok(())
    }

    /// Resend due entries; `None` if another drain is already running
    pub async fn drain(
        &self,
        api: &dyn RemoteLocationApi,
        now_ms: u64,
    ) -> Option<Result<DrainReport, StoreError>> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("queue_drain_already_running");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        Some(self.drain_inner(api, now_ms).await)
    }

    async fn drain_inner(
        &self,
        api: &dyn RemoteLocationApi,
        now_ms: u64,
    ) -> Result<DrainReport, StoreError> {
        let snapshot = self.entries().await;
        if snapshot.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        let mut outcomes: HashMap<String, Outcome> = HashMap::new();

        for entry in &snapshot {
            if !is_due(entry, now_ms) {
                report.deferred += 1;
                continue;
            }

            match api.submit_position(&entry.submission()).await {
                Ok(()) => {
                    report.delivered += 1;
                    outcomes.insert(entry.id.clone(), Outcome::Delivered);
                }
                Err(e) if entry.retry_count < self.settings.max_retries => {
                    report.failed += 1;
                    debug!(
                        id = %entry.id,
                        retry_count = %(entry.retry_count + 1),
                        error = %e,
                        "queue_entry_retry_failed"
                    );
                    outcomes.insert(entry.id.clone(), Outcome::Failed { attempted_at_ms: now_ms });
                }
                Err(e) => {
                    report.dropped += 1;
                    error!(
                        id = %entry.id,
                        latitude = %entry.latitude,
                        longitude = %entry.longitude,
                        out_of_zone = %entry.out_of_zone,
                        retry_count = %entry.retry_count,
                        error = %e,
                        "queue_entry_dropped"
                    );
                    outcomes.insert(entry.id.clone(), Outcome::Dropped);
                }
            }
        }

        if outcomes.is_empty() {
            return Ok(report);
        }

        // Re-read under the lock: entries enqueued while we were sending must survive
        let _lock = self.write_lock.lock().await;
        let mut current = self.entries().await;
        current.retain_mut(|entry| match outcomes.get(&entry.id) {
            Some(Outcome::Delivered) | Some(Outcome::Dropped) => false,
            Some(Outcome::Failed { attempted_at_ms }) => {
                entry.retry_count += 1;
                entry.last_attempt_at_ms = Some(*attempted_at_ms);
                true
            }
            None => true,
        });
        save_json(self.store.as_ref(), keys::LOCATION_QUEUE, &current).await?;

        self.metrics.record_queue_delivered(report.delivered as u64);
        self.metrics.record_queue_dropped(report.dropped as u64);
        info!(
            delivered = %report.delivered,
            failed = %report.failed,
            dropped = %report.dropped,
            deferred = %report.deferred,
            depth = %current.len(),
            "queue_drained"
        );
        Ok(report)
    }
}
