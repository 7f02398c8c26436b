//! Submission worker - sends positions off the callback path
//!
//! The session hands submissions to the worker through an mpsc channel so a
//! slow or unreachable backend never stalls geofence processing. A failed
//! direct send lands in the retry queue; a successful one piggy-backs a drain
//! of the queue, since the network is evidently up.

use crate::domain::types::{Submission, UserRole};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::io::remote_api::RemoteLocationApi;
use crate::io::store::{load_role, StateStore};
use crate::services::retry_queue::{DrainReport, RetryQueue};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A submission to be processed by the worker
#[derive(Debug)]
pub struct SubmitCmd {
    pub submission: Submission,
    /// When the command was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

impl SubmitCmd {
    pub fn new(submission: Submission) -> Self {
        Self { submission, enqueued_at: Instant::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent,
    Queued,
    /// This device does not belong to a patient
    Refused,
}

/// Direct send with retry-queue fallback
pub struct Submitter {
    api: Arc<dyn RemoteLocationApi>,
    queue: Arc<RetryQueue>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl Submitter {
    pub fn new(
        api: Arc<dyn RemoteLocationApi>,
        queue: Arc<RetryQueue>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { api, queue, store, clock, metrics }
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub async fn submit(&self, submission: &Submission) -> SubmitOutcome {
        // Re-checked here: the role may have changed since the callback ran
        match load_role(self.store.as_ref()).await {
            Ok(Some(UserRole::Patient)) => {}
            Ok(role) => {
                warn!(role = ?role.map(|r| r.as_str()), "submission_refused_not_patient");
                return SubmitOutcome::Refused;
            }
            Err(e) => {
                warn!(error = %e, "submission_refused_role_unreadable");
                return SubmitOutcome::Refused;
            }
        }

        let start = Instant::now();
        match self.api.submit_position(submission).await {
            Ok(()) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                self.metrics.record_submission_sent(latency_ms);
                info!(
                    latitude = %submission.latitude,
                    longitude = %submission.longitude,
                    out_of_zone = %submission.out_of_zone,
                    latency_ms = %latency_ms,
                    "location_submitted"
                );
                self.drain().await;
                SubmitOutcome::Sent
            }
            Err(e) => {
                self.metrics.record_submission_failed();
                warn!(
                    latitude = %submission.latitude,
                    longitude = %submission.longitude,
                    out_of_zone = %submission.out_of_zone,
                    error = %e,
                    "location_submit_failed_queued"
                );
                self.enqueue(submission).await;
                SubmitOutcome::Queued
            }
        }
    }

    /// Put a submission straight into the retry queue
    pub async fn enqueue(&self, submission: &Submission) {
        if let Err(e) = self.queue.enqueue(submission, self.clock.now_ms()).await {
            error!(error = %e, out_of_zone = %submission.out_of_zone, "queue_enqueue_failed");
        }
    }

    /// Drain the retry queue; `None` if a drain is already in flight
    pub async fn drain(&self) -> Option<DrainReport> {
        match self.queue.drain(self.api.as_ref(), self.clock.now_ms()).await? {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "queue_drain_failed");
                None
            }
        }
    }
}

/// Worker that processes submissions asynchronously
pub struct SubmissionWorker {
    submitter: Arc<Submitter>,
    cmd_rx: mpsc::Receiver<SubmitCmd>,
}

impl SubmissionWorker {
    pub fn new(submitter: Arc<Submitter>, cmd_rx: mpsc::Receiver<SubmitCmd>) -> Self {
        Self { submitter, cmd_rx }
    }

    /// Run the worker, processing submissions until the channel closes
    pub async fn run(mut self) {
        info!("submission_worker_started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            let queue_delay_ms = cmd.enqueued_at.elapsed().as_millis() as u64;
            let outcome = self.submitter.submit(&cmd.submission).await;

            debug!(outcome = ?outcome, queue_delay_ms = %queue_delay_ms, "submission_processed");

            if queue_delay_ms > 1000 {
                warn!(queue_delay_ms = %queue_delay_ms, "submission_queue_delay_high");
            }
        }

        info!("submission_worker_stopped");
    }
}

/// Create a submission channel and worker
///
/// Returns the sender (for the session) and the worker (to be spawned)
pub fn create_submission_worker(
    submitter: Arc<Submitter>,
    buffer_size: usize,
) -> (mpsc::Sender<SubmitCmd>, SubmissionWorker) {
    let (cmd_tx, cmd_rx) = mpsc::channel(buffer_size);
    (cmd_tx, SubmissionWorker::new(submitter, cmd_rx))
}
