//! Location provider seam
//!
//! The host OS owns geofencing and background position polling; the session
//! only registers and unregisters interest. `SimulatedLocationProvider` plays
//! the host's part for the agent binary and for tests: it is fed raw fixes and
//! turns them into the enter/exit/position callbacks a real platform would
//! deliver for the current registrations.

use crate::domain::geo::planar_distance_m;
use crate::domain::types::{HostEvent, PositionSample, SafeZone, TrackingProfile};
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self) -> Result<PositionSample, ProviderError>;

    /// Register the safe zone for enter/exit callbacks (replaces any previous one)
    async fn start_geofence(&self, zone: &SafeZone) -> Result<(), ProviderError>;

    /// Idempotent
    async fn stop_geofence(&self) -> Result<(), ProviderError>;

    /// Register continuous updates (replaces any previous registration)
    async fn start_position_updates(&self, profile: &TrackingProfile) -> Result<(), ProviderError>;

    /// Idempotent
    async fn stop_position_updates(&self) -> Result<(), ProviderError>;
}

#[derive(Debug, Default)]
struct HostState {
    geofence: Option<SafeZone>,
    inside: Option<bool>,
    profile: Option<TrackingProfile>,
    last_fix: Option<PositionSample>,
    last_delivered: Option<PositionSample>,
    permission_denied: bool,
    position_starts: u32,
    position_stops: u32,
}

/// In-process stand-in for the platform location service
#[derive(Debug, Default)]
pub struct SimulatedLocationProvider {
    state: Mutex<HostState>,
}

impl SimulatedLocationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw fix and return the callbacks the host would deliver for it
    ///
    /// Crossing the registered perimeter yields `Enter`/`Exit` (the first fix
    /// after registration reports the initial side). Continuous updates are
    /// delivered only while registered and throttled by the profile's
    /// interval and displacement.
    pub fn observe(&self, sample: PositionSample) -> Vec<HostEvent> {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        state.last_fix = Some(sample);

        if let Some(zone) = state.geofence {
            let inside = zone.contains(sample.coordinates());
            if state.inside != Some(inside) {
                state.inside = Some(inside);
                let at = sample.coordinates();
                events.push(if inside { HostEvent::Enter { at } } else { HostEvent::Exit { at } });
            }
        }

        if let Some(profile) = state.profile {
            let due = match state.last_delivered {
                None => true,
                Some(prev) => {
                    let elapsed = sample.captured_at_ms.saturating_sub(prev.captured_at_ms);
                    let moved = planar_distance_m(prev.coordinates(), sample.coordinates());
                    elapsed >= profile.min_interval_ms && moved >= profile.min_distance_m
                }
            };
            if due {
                state.last_delivered = Some(sample);
                events.push(HostEvent::Position(sample));
            }
        }

        events
    }

    /// Make every registration call fail with `PermissionDenied`
    pub fn set_permission_denied(&self, denied: bool) {
        self.state.lock().permission_denied = denied;
    }

    pub fn geofence(&self) -> Option<SafeZone> {
        self.state.lock().geofence
    }

    pub fn active_profile(&self) -> Option<TrackingProfile> {
        self.state.lock().profile
    }

    /// (start, stop) call counts for position updates
    pub fn position_update_calls(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.position_starts, state.position_stops)
    }
}

#[async_trait]
impl LocationProvider for SimulatedLocationProvider {
    async fn current_position(&self) -> Result<PositionSample, ProviderError> {
        let state = self.state.lock();
        if state.permission_denied {
            return Err(ProviderError::PermissionDenied);
        }
        state.last_fix.ok_or_else(|| ProviderError::Unavailable("no fix yet".to_string()))
    }

    async fn start_geofence(&self, zone: &SafeZone) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        if state.permission_denied {
            return Err(ProviderError::PermissionDenied);
        }
        state.geofence = Some(*zone);
        state.inside = None;
        info!(
            center = %zone.center(),
            radius_m = %zone.radius_meters(),
            "host_geofence_registered"
        );
        Ok(())
    }

    async fn stop_geofence(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        if state.geofence.take().is_some() {
            info!("host_geofence_unregistered");
        }
        state.inside = None;
        Ok(())
    }

    async fn start_position_updates(&self, profile: &TrackingProfile) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        if state.permission_denied {
            return Err(ProviderError::PermissionDenied);
        }
        state.profile = Some(*profile);
        state.last_delivered = None;
        state.position_starts += 1;
        debug!(
            accuracy = ?profile.accuracy,
            interval_ms = %profile.min_interval_ms,
            distance_m = %profile.min_distance_m,
            "host_position_updates_registered"
        );
        Ok(())
    }

    async fn stop_position_updates(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.profile = None;
        state.last_delivered = None;
        state.position_stops += 1;
        Ok(())
    }
}
