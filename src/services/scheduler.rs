//! Adaptive tracking scheduler
//!
//! Idle -> HighAccuracy on an alerting exit, HighAccuracy -> BalancedAccuracy
//! once the dwell deadline passes while still outside, anything -> Idle on
//! entry. A new exit after an entry always restarts at HighAccuracy.
//!
//! The dwell "timer" is a persisted deadline in epoch ms; the session polls it
//! so that it survives the background task being torn down and respawned.

use crate::domain::types::{TrackingIntensity, TrackingProfile};
use crate::infra::config::Config;
use crate::services::geofence::{Effect, Effects};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingSettings {
    pub dwell_ms: u64,
    pub high: TrackingProfile,
    pub balanced: TrackingProfile,
}

impl TrackingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dwell_ms: config.dwell_ms(),
            high: config.high_accuracy_profile(),
            balanced: config.balanced_accuracy_profile(),
        }
    }
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub intensity: TrackingIntensity,
    /// When the current excursion's tracking began
    pub tracking_started_at_ms: Option<u64>,
    /// Pending HighAccuracy -> BalancedAccuracy switch
    pub dwell_deadline_ms: Option<u64>,
}

impl SchedulerState {
    /// Start dense polling and arm the dwell deadline
    pub fn escalate(&mut self, now_ms: u64, settings: &TrackingSettings, effects: &mut Effects) {
        if self.intensity != TrackingIntensity::Idle {
            effects.push(Effect::StopPositionUpdates);
        }
        self.intensity = TrackingIntensity::HighAccuracy;
        self.tracking_started_at_ms = Some(now_ms);
        self.dwell_deadline_ms = Some(now_ms.saturating_add(settings.dwell_ms));
        effects.push(Effect::StartPositionUpdates(settings.high));
    }

    /// Disarm the deadline and stop polling
    ///
    /// Always emits the stop: after a respawn the host may still hold a
    /// registration this state no longer knows about, and stopping is
    /// idempotent on the host side.
    pub fn stop(&mut self, effects: &mut Effects) {
        *self = Self::default();
        effects.push(Effect::StopPositionUpdates);
    }

    /// Apply the dwell deadline if it has passed
    ///
    /// Returns `true` when the scheduler de-escalated. Stale or early firings
    /// are ignored.
    pub fn dwell_elapsed(
        &mut self,
        now_ms: u64,
        settings: &TrackingSettings,
        effects: &mut Effects,
    ) -> bool {
        let due = matches!(self.dwell_deadline_ms, Some(deadline) if now_ms >= deadline);
        if self.intensity != TrackingIntensity::HighAccuracy || !due {
            return false;
        }

        self.intensity = TrackingIntensity::BalancedAccuracy;
        self.dwell_deadline_ms = None;
        effects.push(Effect::StopPositionUpdates);
        effects.push(Effect::StartPositionUpdates(settings.balanced));
        true
    }

    pub fn is_tracking(&self) -> bool {
        self.intensity != TrackingIntensity::Idle
    }
}
