//! Domain models - safe zone, position samples and tracking states
//!
//! This module contains the canonical data types used throughout the system:
//! - `SafeZone` - the caregiver-defined circular perimeter
//! - `PositionSample` - a single location fix from the host
//! - `ZoneState` / `TrackingIntensity` - state machine and scheduler states
//! - `Submission` / `QueuedSubmission` - payloads for the remote location API
//! - `geo` - equirectangular distance helpers

pub mod geo;
pub mod types;

pub use geo::{epoch_ms, planar_distance_m};
pub use types::{
    Accuracy, Coordinates, HistoryEntry, HostEvent, PositionSample, QueuedSubmission, SafeZone,
    Submission, TrackingIntensity, TrackingProfile, UserRole, ZoneDefinition, ZoneState,
};
