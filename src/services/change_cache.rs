//! Change-detection cache for the continuous polling stream
//!
//! A routine sample is sent only if nothing was sent yet, the last send is
//! older than `max_age_ms`, or the patient moved more than `min_distance_m`
//! from the last sent position. Enter/exit submissions bypass the cache.
//!
//! `ActivityMonitor` tracks how long the patient has been (nearly) still. It
//! is advisory only: it is logged but never changes the polling profile.

use crate::domain::geo::planar_distance_m;
use crate::domain::types::{Coordinates, PositionSample};
use crate::infra::config::Config;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    pub min_distance_m: f64,
    pub max_age_ms: u64,
    pub inactivity_speed_mps: f64,
    pub inactivity_ms: u64,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_distance_m: config.cache_min_distance_m(),
            max_age_ms: config.cache_max_age_ms(),
            inactivity_speed_mps: config.inactivity_speed_mps(),
            inactivity_ms: config.inactivity_ms(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Last position actually sent from the continuous stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeCache {
    pub last_sent: Option<Coordinates>,
    pub last_sent_at_ms: Option<u64>,
}

impl ChangeCache {
    pub fn should_send(&self, point: Coordinates, now_ms: u64, settings: &CacheSettings) -> bool {
        let (Some(last), Some(sent_at)) = (self.last_sent, self.last_sent_at_ms) else {
            return true;
        };

        if now_ms.saturating_sub(sent_at) > settings.max_age_ms {
            return true;
        }

        planar_distance_m(last, point) > settings.min_distance_m
    }

    pub fn record_sent(&mut self, point: Coordinates, now_ms: u64) {
        self.last_sent = Some(point);
        self.last_sent_at_ms = Some(now_ms);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityMonitor {
    pub last_movement_at_ms: Option<u64>,
    pub inactive: bool,
}

impl ActivityMonitor {
    /// Update from a sample; returns the new inactivity flag
    ///
    /// Samples without a speed reading count as not moving.
    pub fn observe(&mut self, sample: &PositionSample, now_ms: u64, settings: &CacheSettings) -> bool {
        let moving = sample.speed_mps.is_some_and(|speed| speed > settings.inactivity_speed_mps);

        let last_movement = match self.last_movement_at_ms {
            Some(_) if moving => now_ms,
            Some(at) => at,
            None => now_ms,
        };
        self.last_movement_at_ms = Some(last_movement);
        self.inactive = now_ms.saturating_sub(last_movement) > settings.inactivity_ms;
        self.inactive
    }
}
