//! Callback handlers for the session
//!
//! Each host callback goes through `handle`; the dwell poll goes through
//! `poll_timers`. Both end in `apply`, which runs one pure transition and
//! executes its effects.

use super::SafeZoneSession;
use crate::domain::types::{HostEvent, Submission};
use crate::io::location::ProviderError;
use crate::services::geofence::{transition, Disposition, Effect, Effects, GeofenceEvent, MachineState};
use crate::services::submitter::SubmitCmd;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

impl SafeZoneSession {
    /// Process one host callback
    pub async fn handle(&mut self, event: HostEvent) {
        self.ctx.metrics.record_event();

        if self.halted {
            debug!(kind = %event.kind(), "event_ignored_halted");
            return;
        }

        if !self.ensure_patient().await {
            return;
        }

        let geofence_event = match event {
            HostEvent::Enter { at } => GeofenceEvent::Enter { at },
            HostEvent::Exit { at } => GeofenceEvent::Exit { at },
            HostEvent::Position(sample) => GeofenceEvent::Position(sample),
            HostEvent::Error(message) => {
                self.ctx.metrics.record_provider_error();
                warn!(error = %message, "location_callback_error");
                return;
            }
        };

        self.apply(geofence_event).await;
    }

    /// Fire the dwell transition once its deadline has passed
    pub async fn poll_timers(&mut self) {
        if self.halted {
            return;
        }

        let state = self.load_state().await;
        let due = matches!(
            state.scheduler.dwell_deadline_ms,
            Some(deadline) if self.ctx.clock.now_ms() >= deadline
        );
        if due {
            self.apply(GeofenceEvent::DwellElapsed).await;
        }
    }

    /// Rehydrate, transition, persist, execute
    pub(crate) async fn apply(&mut self, event: GeofenceEvent) -> Disposition {
        let now_ms = self.ctx.clock.now_ms();
        let state = self.load_state().await;
        let safe_exit = self.load_safe_exit().await;

        let outcome = transition(&state, &event, now_ms, safe_exit, &self.settings);
        self.log_disposition(&event, outcome.disposition, &outcome.state);

        if outcome.state.activity.inactive != state.activity.inactive {
            if outcome.state.activity.inactive {
                info!(
                    still_since_ms = ?outcome.state.activity.last_movement_at_ms,
                    "patient_inactive"
                );
            } else {
                info!("patient_active");
            }
        }

        if outcome.state != state {
            self.save_state(&outcome.state).await;
        }
        self.execute(outcome.effects).await;
        outcome.disposition
    }

    fn log_disposition(&self, event: &GeofenceEvent, disposition: Disposition, next: &MachineState) {
        let metrics = &self.ctx.metrics;
        match disposition {
            Disposition::Entered => {
                metrics.record_transition();
                info!("zone_entered");
            }
            Disposition::Exited { alerting: true } => {
                metrics.record_transition();
                metrics.record_escalation();
                warn!(
                    dwell_deadline_ms = ?next.scheduler.dwell_deadline_ms,
                    "zone_breach"
                );
            }
            Disposition::Exited { alerting: false } => {
                metrics.record_transition();
                info!("zone_exited_safe_exit_active");
            }
            Disposition::Debounced => {
                metrics.record_debounced();
                debug!(
                    event = ?event,
                    last_processed_at_ms = ?next.last_processed_at_ms,
                    "geofence_event_debounced"
                );
            }
            Disposition::Duplicate => {
                metrics.record_duplicate();
                debug!(event = ?event, zone = %next.zone.as_str(), "geofence_event_duplicate");
            }
            Disposition::SampleSent => {
                debug!("position_sample_accepted");
            }
            Disposition::SampleSuppressed => {
                metrics.record_sample_suppressed();
                debug!("position_sample_suppressed");
            }
            Disposition::SampleIgnored => {
                debug!("position_sample_ignored_idle");
            }
            Disposition::DeEscalated => {
                metrics.record_deescalation();
                info!(intensity = %next.scheduler.intensity.as_str(), "tracking_de_escalated");
            }
            Disposition::TimerStale => {}
        }
    }

    /// Run effects in order
    ///
    /// A permission denial still lets the remaining submissions out, then
    /// halts the session.
    async fn execute(&mut self, effects: Effects) {
        let mut permission_denied = false;

        for effect in effects {
            match effect {
                Effect::StartPositionUpdates(_) if permission_denied => {}
                Effect::StartPositionUpdates(profile) => {
                    match self.ctx.provider.start_position_updates(&profile).await {
                        Ok(()) => info!(
                            accuracy = ?profile.accuracy,
                            interval_ms = %profile.min_interval_ms,
                            distance_m = %profile.min_distance_m,
                            "position_updates_started"
                        ),
                        Err(ProviderError::PermissionDenied) => permission_denied = true,
                        Err(e) => warn!(error = %e, "position_updates_start_failed"),
                    }
                }
                Effect::StopPositionUpdates => {
                    if let Err(e) = self.ctx.provider.stop_position_updates().await {
                        warn!(error = %e, "position_updates_stop_failed");
                    }
                }
                Effect::Submit(submission) => self.dispatch(submission).await,
                Effect::RecordLastKnown(sample) => self.record_last_known(&sample).await,
            }
        }

        if permission_denied {
            self.halt("location_permission_denied").await;
        }
    }

    /// Hand a submission to the worker without waiting on the network
    async fn dispatch(&self, submission: Submission) {
        match self.submit_tx.try_send(SubmitCmd::new(submission)) {
            Ok(()) => {}
            Err(TrySendError::Full(cmd)) => {
                self.ctx.metrics.record_submit_channel_full();
                warn!("submit_channel_full_queueing");
                self.submitter.enqueue(&cmd.submission).await;
            }
            Err(TrySendError::Closed(cmd)) => {
                warn!("submit_channel_closed_queueing");
                self.submitter.enqueue(&cmd.submission).await;
            }
        }
    }
}
