//! Flat-earth distance helpers
//!
//! Uses an equirectangular approximation with a fixed 111 km per degree on
//! both axes. Good enough at city scale; not geodesically exact.

use crate::domain::types::Coordinates;
use std::time::{SystemTime, UNIX_EPOCH};

/// Meters per degree of latitude (applied to longitude as well)
pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Approximate planar distance between two points in meters
#[inline]
pub fn planar_distance_m(a: Coordinates, b: Coordinates) -> f64 {
    let dlat = (a.latitude - b.latitude) * METERS_PER_DEGREE;
    let dlon = (a.longitude - b.longitude) * METERS_PER_DEGREE;
    dlat.hypot(dlon)
}

/// Round a coordinate to 6 decimal places
#[inline]
pub fn round_coord(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
