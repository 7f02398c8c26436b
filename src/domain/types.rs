//! Shared types for the safe-zone tracker

use crate::domain::geo::{planar_distance_m, round_coord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A latitude/longitude pair in signed decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude, self.longitude)
    }
}

/// Caregiver-defined circular perimeter around the patient's home
///
/// Construct through [`SafeZone::new`], which rejects non-positive radii.
/// Deserialization goes through the same check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SafeZoneRecord")]
pub struct SafeZone {
    center: Coordinates,
    radius_meters: f64,
}

/// Unchecked wire shape of [`SafeZone`]
#[derive(Deserialize)]
struct SafeZoneRecord {
    center: Coordinates,
    radius_meters: f64,
}

impl TryFrom<SafeZoneRecord> for SafeZone {
    type Error = String;

    fn try_from(record: SafeZoneRecord) -> Result<Self, Self::Error> {
        SafeZone::new(record.center, record.radius_meters)
            .ok_or_else(|| format!("safe zone radius must be positive, got {}", record.radius_meters))
    }
}

impl SafeZone {
    /// Returns `None` unless the radius is a positive finite number
    pub fn new(center: Coordinates, radius_meters: f64) -> Option<Self> {
        if radius_meters.is_finite() && radius_meters > 0.0 {
            Some(Self { center, radius_meters })
        } else {
            None
        }
    }

    pub fn center(&self) -> Coordinates {
        self.center
    }

    pub fn radius_meters(&self) -> f64 {
        self.radius_meters
    }

    /// Approximate distance from the zone center in meters
    pub fn distance_from_center(&self, point: Coordinates) -> f64 {
        planar_distance_m(self.center, point)
    }

    /// A point exactly on the perimeter counts as inside
    pub fn contains(&self, point: Coordinates) -> bool {
        self.distance_from_center(point) <= self.radius_meters
    }
}

/// A single location fix from the host platform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    pub captured_at_ms: u64,
}

impl PositionSample {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// Debounced patient position relative to the safe zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneState {
    #[default]
    Unknown,
    Inside,
    Outside,
}

impl ZoneState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneState::Unknown => "unknown",
            ZoneState::Inside => "inside",
            ZoneState::Outside => "outside",
        }
    }
}

/// Continuous polling profile currently requested from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingIntensity {
    #[default]
    Idle,
    HighAccuracy,
    BalancedAccuracy,
}

impl TrackingIntensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingIntensity::Idle => "idle",
            TrackingIntensity::HighAccuracy => "high_accuracy",
            TrackingIntensity::BalancedAccuracy => "balanced_accuracy",
        }
    }
}

/// Accuracy class requested from the location provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    High,
    Balanced,
}

/// Accuracy and throttling parameters for a position-update registration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackingProfile {
    pub accuracy: Accuracy,
    pub min_interval_ms: u64,
    pub min_distance_m: f64,
}

/// Position payload for the remote location API
///
/// Coordinates are rounded to 6 decimal places (~0.1 m) on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "is_out_of_zone")]
    pub out_of_zone: bool,
}

impl Submission {
    pub fn new(at: Coordinates, out_of_zone: bool) -> Self {
        Self {
            latitude: round_coord(at.latitude),
            longitude: round_coord(at.longitude),
            out_of_zone,
        }
    }
}

/// A submission waiting in the retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSubmission {
    /// UUIDv7, time-sortable
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub out_of_zone: bool,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
    #[serde(default)]
    pub last_attempt_at_ms: Option<u64>,
}

impl QueuedSubmission {
    pub fn new(submission: &Submission, now_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            latitude: submission.latitude,
            longitude: submission.longitude,
            out_of_zone: submission.out_of_zone,
            enqueued_at_ms: now_ms,
            retry_count: 0,
            last_attempt_at_ms: None,
        }
    }

    pub fn submission(&self) -> Submission {
        Submission {
            latitude: self.latitude,
            longitude: self.longitude,
            out_of_zone: self.out_of_zone,
        }
    }
}

/// Account type of the signed-in user on this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Patient,
    Caregiver,
}

impl UserRole {
    /// Accepts both raw (`Patient`) and JSON-quoted (`"Patient"`) values
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_matches('"') {
            "Patient" => Some(UserRole::Patient),
            "Caregiver" => Some(UserRole::Caregiver),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Patient => "Patient",
            UserRole::Caregiver => "Caregiver",
        }
    }
}

/// Raw callback delivered by the host location service
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Geofence entry reported at the given position
    Enter { at: Coordinates },
    /// Geofence exit reported at the given position
    Exit { at: Coordinates },
    /// Continuous position update (only while polling is registered)
    Position(PositionSample),
    /// The host failed to deliver a callback payload
    Error(String),
}

impl HostEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HostEvent::Enter { .. } => "enter",
            HostEvent::Exit { .. } => "exit",
            HostEvent::Position(_) => "position",
            HostEvent::Error(_) => "error",
        }
    }
}

/// Zone definition as served by the backend
///
/// Decimal fields arrive either as JSON numbers or as strings (`"-33.456900"`).
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneDefinition {
    #[serde(deserialize_with = "deserialize_decimal")]
    pub latitude: f64,
    #[serde(deserialize_with = "deserialize_decimal")]
    pub longitude: f64,
    #[serde(deserialize_with = "deserialize_decimal")]
    pub radius_meters: f64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub safe_exit_active: bool,
}

impl ZoneDefinition {
    pub fn safe_zone(&self) -> Option<SafeZone> {
        SafeZone::new(Coordinates::new(self.latitude, self.longitude), self.radius_meters)
    }
}

/// One row of the backend's position history
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(deserialize_with = "deserialize_decimal")]
    pub latitude: f64,
    #[serde(deserialize_with = "deserialize_decimal")]
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_out_of_zone: bool,
}

fn deserialize_decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct DecimalVisitor;

    impl<'de> Visitor<'de> for DecimalVisitor {
        type Value = f64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a decimal number or decimal string")
        }

        fn visit_str<E>(self, value: &str) -> Result<f64, E>
        where
            E: de::Error,
        {
            value.trim().parse::<f64>().map_err(|_| E::custom(format!("invalid decimal: {value}")))
        }

        fn visit_f64<E>(self, value: f64) -> Result<f64, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_u64<E>(self, value: u64) -> Result<f64, E>
        where
            E: de::Error,
        {
            Ok(value as f64)
        }

        fn visit_i64<E>(self, value: i64) -> Result<f64, E>
        where
            E: de::Error,
        {
            Ok(value as f64)
        }
    }

    deserializer.deserialize_any(DecimalVisitor)
}
