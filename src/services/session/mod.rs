//! Patient safe-zone session
//!
//! The session is the imperative shell around the pure geofence state
//! machine. For every host callback it:
//! - re-checks that this device belongs to a patient
//! - rehydrates machine state from the local store
//! - runs the transition and persists the result
//! - executes the effects (provider registrations, submissions, last-known)
//!
//! Nothing is assumed to survive in memory between callbacks except the halt
//! flag: the host may tear the background task down and respawn it.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::types::{
    HistoryEntry, HostEvent, PositionSample, SafeZone, TrackingIntensity, UserRole, ZoneState,
};
use crate::infra::clock::Clock;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::location::{LocationProvider, ProviderError};
use crate::io::remote_api::{sort_history, ApiError, RemoteLocationApi};
use crate::io::store::{keys, load_json, load_role, save_json, StateStore, StoreError};
use crate::services::geofence::{GeofenceSettings, MachineState};
use crate::services::submitter::{SubmitCmd, Submitter};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Duration, Instant};
use tracing::{error, info, warn};

/// External collaborators the session drives
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn StateStore>,
    pub provider: Arc<dyn LocationProvider>,
    pub api: Arc<dyn RemoteLocationApi>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
}

/// Result of `start`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartOutcome {
    /// Geofence registered for this zone
    Registered(SafeZone),
    /// No zone is configured for the patient
    NoZone,
    /// Not a patient device, or location permission denied
    Halted,
}

/// Read-only view for foreground consumers (map screen)
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneStatus {
    pub zone: Option<SafeZone>,
    pub last_known: Option<PositionSample>,
    pub distance_m: Option<f64>,
    pub outside: Option<bool>,
    pub safe_exit: bool,
    pub zone_state: ZoneState,
    pub intensity: TrackingIntensity,
}

/// Compute the foreground view straight from the store
///
/// Values may be slightly stale; callers re-read instead of subscribing.
pub async fn read_status(store: &dyn StateStore) -> ZoneStatus {
    let zone: Option<SafeZone> = load_json(store, keys::SAFE_ZONE).await.ok().flatten();
    let last_known: Option<PositionSample> =
        load_json(store, keys::LAST_KNOWN_POSITION).await.ok().flatten();
    let machine: MachineState =
        load_json(store, keys::SESSION_STATE).await.ok().flatten().unwrap_or_default();
    let safe_exit = load_json::<bool>(store, keys::SAFE_EXIT).await.ok().flatten().unwrap_or(false);

    let distance_m = match (zone, last_known) {
        (Some(zone), Some(pos)) => Some(zone.distance_from_center(pos.coordinates())),
        _ => None,
    };
    let outside = match (zone, distance_m) {
        (Some(zone), Some(d)) => Some(d > zone.radius_meters()),
        _ => None,
    };

    ZoneStatus {
        zone,
        last_known,
        distance_m,
        outside,
        safe_exit,
        zone_state: machine.zone,
        intensity: machine.scheduler.intensity,
    }
}

pub struct SafeZoneSession {
    pub(crate) ctx: SessionContext,
    pub(crate) submitter: Arc<Submitter>,
    /// Hand-off to the submission worker
    pub(crate) submit_tx: mpsc::Sender<SubmitCmd>,
    pub(crate) settings: GeofenceSettings,
    pub(crate) drain_interval: Option<Duration>,
    /// Set once the session stops processing for good
    pub(crate) halted: bool,
}

impl SafeZoneSession {
    pub fn new(
        config: &Config,
        ctx: SessionContext,
        submitter: Arc<Submitter>,
        submit_tx: mpsc::Sender<SubmitCmd>,
    ) -> Self {
        Self {
            ctx,
            submitter,
            submit_tx,
            settings: GeofenceSettings::from_config(config),
            drain_interval: config.drain_interval(),
            halted: false,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Load the zone and register the geofence
    ///
    /// The remote definition wins and is mirrored locally; the cached one is
    /// used when the backend is unreachable.
    pub async fn start(&mut self) -> StartOutcome {
        if !self.ensure_patient().await {
            return StartOutcome::Halted;
        }

        let Some(zone) = self.load_zone().await else {
            info!("session_no_zone");
            return StartOutcome::NoZone;
        };

        match self.ctx.provider.start_geofence(&zone).await {
            Ok(()) => {}
            Err(ProviderError::PermissionDenied) => {
                self.halt("location_permission_denied").await;
                return StartOutcome::Halted;
            }
            Err(e) => {
                warn!(error = %e, "geofence_register_failed");
                return StartOutcome::NoZone;
            }
        }

        // Resume polling after a respawn mid-excursion
        let state = self.load_state().await;
        let resume = match state.scheduler.intensity {
            TrackingIntensity::Idle => None,
            TrackingIntensity::HighAccuracy => Some(self.settings.tracking.high),
            TrackingIntensity::BalancedAccuracy => Some(self.settings.tracking.balanced),
        };
        if let Some(profile) = resume {
            if let Err(e) = self.ctx.provider.start_position_updates(&profile).await {
                warn!(error = %e, "position_updates_resume_failed");
            }
        }

        match self.ctx.provider.current_position().await {
            Ok(sample) => self.record_last_known(&sample).await,
            Err(e) => warn!(error = %e, "initial_position_unavailable"),
        }

        info!(
            center = %zone.center(),
            radius_m = %zone.radius_meters(),
            zone_state = %state.zone.as_str(),
            intensity = %state.scheduler.intensity.as_str(),
            "session_started"
        );
        StartOutcome::Registered(zone)
    }

    /// Cancel the dwell deadline and unregister everything; idempotent
    ///
    /// The zone state is forgotten too. The next registration reports the
    /// current side afresh and that report must not read as a duplicate.
    pub async fn stop(&mut self) {
        self.unregister().await;

        let state = self.load_state().await;
        let mut next = state;
        next.scheduler = Default::default();
        next.zone = ZoneState::Unknown;
        next.last_processed_at_ms = None;
        if next != state {
            self.save_state(&next).await;
        }
        info!("session_stopped");
    }

    /// Run until shutdown, consuming host callbacks
    ///
    /// When the callback channel closes the loop keeps running so pending
    /// dwell deadlines and queue drains still fire.
    pub async fn run(
        &mut self,
        mut event_rx: mpsc::Receiver<HostEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Dwell deadline poll (1 second)
        let mut tick_interval = interval(Duration::from_secs(1));
        let drain_period = self.drain_interval.unwrap_or(Duration::from_secs(3600));
        let mut drain_interval = interval_at(Instant::now() + drain_period, drain_period);
        let drain_enabled = self.drain_interval.is_some();
        let mut events_open = true;

        loop {
            tokio::select! {
                event = event_rx.recv(), if events_open => {
                    match event {
                        Some(e) => self.handle(e).await,
                        None => {
                            info!("host_event_channel_closed");
                            events_open = false;
                        }
                    }
                }
                _ = tick_interval.tick() => {
                    self.poll_timers().await;
                }
                _ = drain_interval.tick(), if drain_enabled => {
                    if !self.halted {
                        self.submitter.drain().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    /// Write the override flag locally and sync it to the backend
    pub async fn set_safe_exit(&self, active: bool) -> Result<(), StoreError> {
        save_json(self.ctx.store.as_ref(), keys::SAFE_EXIT, &active).await?;
        info!(active = %active, "safe_exit_set");

        if let Err(e) = self.ctx.api.set_safe_exit(active).await {
            warn!(active = %active, error = %e, "safe_exit_sync_failed");
        }
        Ok(())
    }

    pub async fn status(&self) -> ZoneStatus {
        read_status(self.ctx.store.as_ref()).await
    }

    /// Position history, oldest first by server timestamp
    pub async fn fetch_history(&self) -> Result<Vec<HistoryEntry>, ApiError> {
        Ok(sort_history(self.ctx.api.fetch_history().await?))
    }

    /// Zone from the backend, else the cached copy
    async fn load_zone(&self) -> Option<SafeZone> {
        let store = self.ctx.store.as_ref();

        match self.ctx.api.fetch_zone().await {
            Ok(Some(def)) => {
                let Some(zone) = def.safe_zone() else {
                    warn!(radius_m = %def.radius_meters, "zone_definition_invalid");
                    return None;
                };
                if let Err(e) = save_json(store, keys::SAFE_ZONE, &zone).await {
                    warn!(error = %e, "zone_cache_write_failed");
                }
                if let Err(e) = save_json(store, keys::SAFE_EXIT, &def.safe_exit_active).await {
                    warn!(error = %e, "safe_exit_cache_write_failed");
                }
                info!(
                    address = %def.address.as_deref().unwrap_or("-"),
                    safe_exit = %def.safe_exit_active,
                    "zone_fetched"
                );
                Some(zone)
            }
            Ok(None) => {
                if let Err(e) = store.remove(keys::SAFE_ZONE).await {
                    warn!(error = %e, "zone_cache_clear_failed");
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "zone_fetch_failed_using_cache");
                match load_json::<SafeZone>(store, keys::SAFE_ZONE).await {
                    Ok(zone) => zone,
                    Err(e) => {
                        warn!(error = %e, "zone_cache_unreadable");
                        None
                    }
                }
            }
        }
    }

    /// Role gate; halts the session unless the device is a patient's
    pub(crate) async fn ensure_patient(&mut self) -> bool {
        match load_role(self.ctx.store.as_ref()).await {
            Ok(Some(UserRole::Patient)) => true,
            Ok(Some(role)) => {
                self.halt_for_role(role.as_str()).await;
                false
            }
            Ok(None) => {
                self.halt_for_role("missing").await;
                false
            }
            Err(e) => {
                warn!(error = %e, "user_role_unreadable");
                self.halt_for_role("unreadable").await;
                false
            }
        }
    }

    async fn halt_for_role(&mut self, role: &str) {
        self.ctx.metrics.record_role_halt();
        error!(role = %role, "session_halted_not_patient");
        self.halt("not_patient").await;
    }

    /// Stop for good: unregister everything, ignore further callbacks
    pub(crate) async fn halt(&mut self, reason: &str) {
        if !self.halted {
            error!(reason = %reason, "session_halted");
        }
        self.halted = true;
        self.stop().await;
    }

    async fn unregister(&self) {
        if let Err(e) = self.ctx.provider.stop_position_updates().await {
            warn!(error = %e, "position_updates_stop_failed");
        }
        if let Err(e) = self.ctx.provider.stop_geofence().await {
            warn!(error = %e, "geofence_stop_failed");
        }
    }

    /// Rehydrate; unreadable state restarts from `Unknown`
    pub(crate) async fn load_state(&self) -> MachineState {
        let store = self.ctx.store.as_ref();
        let mut state = match load_json::<MachineState>(store, keys::SESSION_STATE).await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "session_state_unreadable");
                MachineState::default()
            }
        };
        match load_json(store, keys::LAST_SENT).await {
            Ok(cache) => state.cache = cache.unwrap_or_default(),
            Err(e) => warn!(error = %e, "last_sent_unreadable"),
        }
        state
    }

    pub(crate) async fn save_state(&self, state: &MachineState) {
        let store = self.ctx.store.as_ref();
        if let Err(e) = save_json(store, keys::SESSION_STATE, state).await {
            error!(error = %e, "session_state_write_failed");
        }
        if let Err(e) = save_json(store, keys::LAST_SENT, &state.cache).await {
            error!(error = %e, "last_sent_write_failed");
        }
    }

    pub(crate) async fn load_safe_exit(&self) -> bool {
        match load_json::<bool>(self.ctx.store.as_ref(), keys::SAFE_EXIT).await {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "safe_exit_unreadable");
                false
            }
        }
    }

    pub(crate) async fn record_last_known(&self, sample: &PositionSample) {
        if let Err(e) = save_json(self.ctx.store.as_ref(), keys::LAST_KNOWN_POSITION, sample).await {
            warn!(error = %e, "last_known_write_failed");
        }
    }
}
