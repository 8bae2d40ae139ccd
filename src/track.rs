use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A single recorded position within a track sequence.
///
/// `index` and `distance` describe the point's place within the sequence
/// that produced it; they are only meaningful relative to that sequence.
/// Stages that build a new sequence (parser, simplifier) assign both via
/// [`resequence`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    /// Meters. 0 when the source carried no elevation data.
    pub elevation: f64,
    /// Milliseconds since epoch. 0 means unknown.
    pub timestamp: i64,
    /// 0-based position within the originating sequence.
    pub index: usize,
    /// Cumulative km from the start of the originating sequence.
    pub distance: f64,
}

impl TrackPoint {
    pub fn lat_lng(&self) -> LatLng {
        LatLng {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

/// A bare WGS84 coordinate, used for distance math and query input.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

impl FromStr for LatLng {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(',').collect();
        if parts.len() != 2 {
            anyhow::bail!("expected format: latitude,longitude");
        }

        let lat: f64 = parts[0].trim().parse()?;
        let lon: f64 = parts[1].trim().parse()?;
        if !(-90.0..=90.0).contains(&lat) {
            anyhow::bail!("latitude must be between -90 and 90");
        }
        if !(-180.0..=180.0).contains(&lon) {
            anyhow::bail!("longitude must be between -180 and 180");
        }

        Ok(LatLng { lat, lon })
    }
}

/// Great-circle distance in km between two coordinates.
///
/// Identical coordinates return exactly 0.0, since both half-angle sines
/// collapse to zero.
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let sin_lat = ((b.lat - a.lat).to_radians() / 2.0).sin();
    let sin_lon = ((b.lon - a.lon).to_radians() / 2.0).sin();

    let h = sin_lat * sin_lat + a.lat.to_radians().cos() * b.lat.to_radians().cos() * sin_lon * sin_lon;
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Rebuild `index` and cumulative `distance` for a freshly produced sequence.
pub fn resequence(mut points: Vec<TrackPoint>) -> Vec<TrackPoint> {
    let mut total = 0.0;
    for i in 0..points.len() {
        if i > 0 {
            total += haversine_km(points[i - 1].lat_lng(), points[i].lat_lng());
        }
        points[i].index = i;
        points[i].distance = total;
    }
    points
}

/// Gate applied before stats are computed: an activity is only usable if it
/// has points and none of them carry the missing-timestamp sentinel.
pub fn has_usable_timestamps(points: &[TrackPoint]) -> bool {
    !points.is_empty() && points.iter().all(|p| p.timestamp != 0)
}

#[cfg(test)]
pub fn point(lat: f64, lon: f64, elevation: f64, timestamp: i64) -> TrackPoint {
    TrackPoint {
        lat,
        lon,
        elevation,
        timestamp,
        index: 0,
        distance: 0.0,
    }
}
