//! Geofence state machine
//!
//! `transition` is pure: it takes the rehydrated machine state plus one event
//! and returns the next state with the side effects to execute. The session
//! owns everything imperative (store, provider, network).
//!
//! Rules, in order, for enter/exit:
//! 1. Within `debounce_ms` of the last processed enter/exit: dropped entirely.
//! 2. Same as the current zone state: duplicate, no-op.
//! 3. Otherwise applied; the debounce window restarts.
//!
//! Continuous samples never change the zone state. They refresh the last-known
//! position and may produce an `out_of_zone = true` submission through the
//! change cache while tracking is active.

use crate::domain::types::{Coordinates, PositionSample, Submission, TrackingProfile, ZoneState};
use crate::infra::config::Config;
use crate::services::change_cache::{ActivityMonitor, CacheSettings, ChangeCache};
use crate::services::scheduler::{SchedulerState, TrackingSettings};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Side effect requested by a transition, executed in order by the session
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartPositionUpdates(TrackingProfile),
    StopPositionUpdates,
    Submit(Submission),
    RecordLastKnown(PositionSample),
}

/// Most transitions emit at most three effects
pub type Effects = SmallVec<[Effect; 4]>;

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceEvent {
    Enter { at: Coordinates },
    Exit { at: Coordinates },
    Position(PositionSample),
    /// The session's poll found the dwell deadline passed
    DwellElapsed,
}

/// Durable state, persisted under `session_state` after every callback
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub zone: ZoneState,
    /// Last enter/exit that was actually applied
    pub last_processed_at_ms: Option<u64>,
    pub scheduler: SchedulerState,
    /// Persisted separately under `last_sent`
    #[serde(skip)]
    pub cache: ChangeCache,
    #[serde(default)]
    pub activity: ActivityMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceSettings {
    pub debounce_ms: u64,
    pub tracking: TrackingSettings,
    pub cache: CacheSettings,
}

impl GeofenceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce_ms: config.debounce_ms(),
            tracking: TrackingSettings::from_config(config),
            cache: CacheSettings::from_config(config),
        }
    }
}

impl Default for GeofenceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened to the event, for logging and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Entered,
    Exited { alerting: bool },
    Debounced,
    Duplicate,
    SampleSent,
    SampleSuppressed,
    /// Sample arrived while polling is idle (late delivery after a stop)
    SampleIgnored,
    DeEscalated,
    /// Dwell poll found nothing to do
    TimerStale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: MachineState,
    pub effects: Effects,
    pub disposition: Disposition,
}

impl Transition {
    fn unchanged(state: &MachineState, disposition: Disposition) -> Self {
        Self { state: *state, effects: Effects::new(), disposition }
    }
}

pub fn transition(
    state: &MachineState,
    event: &GeofenceEvent,
    now_ms: u64,
    safe_exit: bool,
    settings: &GeofenceSettings,
) -> Transition {
    match event {
        GeofenceEvent::Enter { at } => zone_event(state, ZoneState::Inside, *at, now_ms, safe_exit, settings),
        GeofenceEvent::Exit { at } => zone_event(state, ZoneState::Outside, *at, now_ms, safe_exit, settings),
        GeofenceEvent::Position(sample) => position_sample(state, sample, now_ms, settings),
        GeofenceEvent::DwellElapsed => dwell_elapsed(state, now_ms, settings),
    }
}

fn zone_event(
    state: &MachineState,
    target: ZoneState,
    at: Coordinates,
    now_ms: u64,
    safe_exit: bool,
    settings: &GeofenceSettings,
) -> Transition {
    if let Some(last) = state.last_processed_at_ms {
        if now_ms.saturating_sub(last) < settings.debounce_ms {
            return Transition::unchanged(state, Disposition::Debounced);
        }
    }

    if state.zone == target {
        return Transition::unchanged(state, Disposition::Duplicate);
    }

    let mut next = *state;
    let mut effects = Effects::new();
    next.zone = target;
    next.last_processed_at_ms = Some(now_ms);

    let disposition = match target {
        ZoneState::Inside => {
            next.scheduler.stop(&mut effects);
            effects.push(Effect::Submit(Submission::new(at, false)));
            Disposition::Entered
        }
        _ if safe_exit => {
            // Supervised outing: recorded, not flagged, no escalation
            effects.push(Effect::Submit(Submission::new(at, false)));
            Disposition::Exited { alerting: false }
        }
        _ => {
            next.scheduler.escalate(now_ms, &settings.tracking, &mut effects);
            effects.push(Effect::Submit(Submission::new(at, true)));
            Disposition::Exited { alerting: true }
        }
    };

    Transition { state: next, effects, disposition }
}

fn position_sample(
    state: &MachineState,
    sample: &PositionSample,
    now_ms: u64,
    settings: &GeofenceSettings,
) -> Transition {
    if !state.scheduler.is_tracking() {
        return Transition::unchanged(state, Disposition::SampleIgnored);
    }

    let mut next = *state;
    let mut effects = Effects::new();
    next.activity.observe(sample, now_ms, &settings.cache);
    effects.push(Effect::RecordLastKnown(*sample));

    let point = sample.coordinates();
    if !next.cache.should_send(point, now_ms, &settings.cache) {
        return Transition { state: next, effects, disposition: Disposition::SampleSuppressed };
    }

    next.cache.record_sent(point, now_ms);
    effects.push(Effect::Submit(Submission::new(point, true)));
    Transition { state: next, effects, disposition: Disposition::SampleSent }
}

fn dwell_elapsed(state: &MachineState, now_ms: u64, settings: &GeofenceSettings) -> Transition {
    if state.zone != ZoneState::Outside {
        return Transition::unchanged(state, Disposition::TimerStale);
    }

    let mut next = *state;
    let mut effects = Effects::new();
    if next.scheduler.dwell_elapsed(now_ms, &settings.tracking, &mut effects) {
        Transition { state: next, effects, disposition: Disposition::DeEscalated }
    } else {
        Transition::unchanged(state, Disposition::TimerStale)
    }
}
