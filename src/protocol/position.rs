//! Vehicle position records.
//!
//! Positions arrive inside `vehicles`/`positions` event payloads, either as
//! comma-separated records:
//!
//! ```text
//! vehicle_id,route_id,lat,lon,direction,flag,timestamp
//! 12585093,12583358,50.50963,30.64338,0,0,1769342268
//! ```
//!
//! or as JSON objects with `lat`/`lon` fields. Parsed records are appended
//! to the sink verbatim, no transformation beyond an optional plausibility
//! filter on the coordinates.

// ============================================================================
// Imports
// ============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

/// Field count of the CSV position record.
const CSV_FIELD_COUNT: usize = 7;

// ============================================================================
// CoordinateBounds
// ============================================================================

/// Plausibility bounding box for parsed coordinates.
///
/// The default box covers the Kyiv service area; positions outside it are
/// feed glitches and get dropped (counted, not silent).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateBounds {
    /// Minimum latitude.
    pub lat_min: f64,
    /// Maximum latitude.
    pub lat_max: f64,
    /// Minimum longitude.
    pub lon_min: f64,
    /// Maximum longitude.
    pub lon_max: f64,
}

impl Default for CoordinateBounds {
    fn default() -> Self {
        Self {
            lat_min: 50.2,
            lat_max: 50.7,
            lon_min: 30.2,
            lon_max: 31.0,
        }
    }
}

impl CoordinateBounds {
    /// Returns `true` if the point lies inside the box.
    #[inline]
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.lat_min <= lat && lat <= self.lat_max && self.lon_min <= lon && lon <= self.lon_max
    }
}

// ============================================================================
// VehiclePosition
// ============================================================================

/// One vehicle position sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    /// Upstream vehicle identifier.
    pub vehicle_id: u64,
    /// Upstream route identifier.
    pub route_id: u64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Heading/direction flag as sent by the feed.
    pub direction: i32,
    /// Opaque feed flag.
    pub flag: i32,
    /// Sample time, epoch seconds.
    pub timestamp: i64,
}

impl VehiclePosition {
    /// Parses the comma-separated record format.
    ///
    /// Returns `None` on wrong arity or non-numeric fields; malformed
    /// records are dropped, never fatal.
    #[must_use]
    pub fn parse_csv(record: &str) -> Option<Self> {
        let parts: Vec<&str> = record.split(',').collect();
        if parts.len() != CSV_FIELD_COUNT {
            return None;
        }

        Some(Self {
            vehicle_id: parts[0].trim().parse().ok()?,
            route_id: parts[1].trim().parse().ok()?,
            lat: parts[2].trim().parse().ok()?,
            lon: parts[3].trim().parse().ok()?,
            direction: parts[4].trim().parse().ok()?,
            flag: parts[5].trim().parse().ok()?,
            timestamp: parts[6].trim().parse().ok()?,
        })
    }

    /// Builds a position from a JSON object carrying `lat`/`lon`.
    ///
    /// Field aliases (`id`, `routeId`) follow the shapes the feed has been
    /// observed to send; a missing timestamp falls back to now.
    #[must_use]
    pub fn from_json(item: &Value) -> Option<Self> {
        let lat = item.get("lat")?.as_f64()?;
        let lon = item.get("lon")?.as_f64()?;

        let vehicle_id = item
            .get("vehicle_id")
            .or_else(|| item.get("id"))
            .and_then(Value::as_u64)?;
        let route_id = item
            .get("route_id")
            .or_else(|| item.get("routeId"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Some(Self {
            vehicle_id,
            route_id,
            lat,
            lon,
            direction: item.get("direction").and_then(Value::as_i64).unwrap_or(0) as i32,
            flag: item.get("flag").and_then(Value::as_i64).unwrap_or(0) as i32,
            timestamp: item
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| Utc::now().timestamp()),
        })
    }
}

// ============================================================================
// Payload Extraction
// ============================================================================

/// Extraction result: accepted positions plus the count dropped by the
/// bounds filter.
#[derive(Debug, Default)]
pub struct ExtractedPositions {
    /// Positions that parsed and passed the bounds filter.
    pub positions: Vec<VehiclePosition>,
    /// Parsed positions rejected by the bounds filter.
    pub out_of_bounds: usize,
}

/// Extracts vehicle positions from an event payload.
///
/// The payload may be an array of CSV strings, an array of JSON objects, or
/// a single CSV string. Unparseable elements are skipped.
#[must_use]
pub fn extract_positions(payload: &Value, bounds: Option<&CoordinateBounds>) -> ExtractedPositions {
    let mut result = ExtractedPositions::default();

    match payload {
        Value::Array(items) => {
            for item in items {
                if let Some(position) = extract_single(item) {
                    accept(position, bounds, &mut result);
                }
            }
        }
        Value::String(record) => {
            if let Some(position) = VehiclePosition::parse_csv(record) {
                accept(position, bounds, &mut result);
            }
        }
        _ => {}
    }

    result
}

fn extract_single(item: &Value) -> Option<VehiclePosition> {
    match item {
        Value::String(record) => VehiclePosition::parse_csv(record),
        Value::Object(_) => VehiclePosition::from_json(item),
        _ => None,
    }
}

fn accept(
    position: VehiclePosition,
    bounds: Option<&CoordinateBounds>,
    result: &mut ExtractedPositions,
) {
    match bounds {
        Some(b) if !b.contains(position.lat, position.lon) => result.out_of_bounds += 1,
        _ => result.positions.push(position),
    }
}

// ============================================================================
// Event Names
// ============================================================================

/// Event names the feed uses for position pushes.
const POSITION_EVENTS: [&str; 4] = ["vehicles", "positions", "locations", "v"];

/// Returns `true` if the event name carries position data.
#[inline]
#[must_use]
pub fn is_position_event(event: &str) -> bool {
    POSITION_EVENTS.contains(&event)
}

// ============================================================================
// Tests
// ============================================================================
