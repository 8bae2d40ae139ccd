use serde::{Deserialize, Serialize};

use crate::track::{TrackPoint, haversine_km};

/// Minimum instantaneous speed (km/h) for a step to count as movement.
/// Slower steps still contribute distance but not moving time.
pub const MOVING_SPEED_THRESHOLD_KMH: f64 = 0.5;

/// Width of the centered moving average applied to elevations before
/// classifying steps as gain or loss. Raw GPS/barometer elevations are too
/// noisy to difference directly.
pub const DEFAULT_SMOOTHING_WINDOW: usize = 5;

/// Milliseconds-per-hour factor for km/ms -> km/h conversions.
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Derived per-track statistics. Recomputed from points, never mutated in
/// place.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackStats {
    /// km
    pub distance: f64,
    /// meters
    pub elevation_gain: f64,
    /// meters
    pub elevation_loss: f64,
    /// ms
    pub duration: i64,
    /// ms
    pub moving_time: i64,
    /// km/h, derived from distance over moving time
    pub avg_speed: f64,
    /// ms since epoch
    pub start_time: i64,
    /// ms since epoch
    pub end_time: i64,
}

pub fn compute_stats(points: &[TrackPoint]) -> TrackStats {
    compute_stats_with_window(points, DEFAULT_SMOOTHING_WINDOW)
}

pub fn compute_stats_with_window(points: &[TrackPoint], window: usize) -> TrackStats {
    if points.is_empty() {
        return TrackStats::default();
    }

    let smoothed = smooth_elevations(points, window);

    let mut distance = 0.0;
    let mut moving_time: i64 = 0;
    let mut elevation_gain = 0.0;
    let mut elevation_loss = 0.0;

    for i in 1..points.len() {
        let d = haversine_km(points[i - 1].lat_lng(), points[i].lat_lng());
        distance += d;

        // Duplicate or out-of-order timestamps contribute distance only.
        let dt = points[i].timestamp - points[i - 1].timestamp;
        if dt > 0 {
            let speed_kmh = d / dt as f64 * MS_PER_HOUR;
            if speed_kmh > MOVING_SPEED_THRESHOLD_KMH {
                moving_time += dt;
            }
        }

        let elev_diff = smoothed[i] - smoothed[i - 1];
        if elev_diff > 0.0 {
            elevation_gain += elev_diff;
        } else {
            elevation_loss += -elev_diff;
        }
    }

    let start_time = points[0].timestamp;
    let end_time = points[points.len() - 1].timestamp;

    TrackStats {
        distance,
        elevation_gain,
        elevation_loss,
        duration: end_time - start_time,
        moving_time,
        avg_speed: average_speed(distance, moving_time),
        start_time,
        end_time,
    }
}

/// Sum stats across tracks. Distances, elevations and times add up; the
/// time span widens to cover every input; average speed is re-derived from
/// the summed distance and moving time rather than averaged.
pub fn aggregate_stats(stats: &[TrackStats]) -> TrackStats {
    let Some(first) = stats.first() else {
        return TrackStats::default();
    };

    let mut total = TrackStats {
        start_time: first.start_time,
        end_time: first.end_time,
        ..TrackStats::default()
    };

    for s in stats {
        total.distance += s.distance;
        total.elevation_gain += s.elevation_gain;
        total.elevation_loss += s.elevation_loss;
        total.duration += s.duration;
        total.moving_time += s.moving_time;
        total.start_time = total.start_time.min(s.start_time);
        total.end_time = total.end_time.max(s.end_time);
    }

    total.avg_speed = average_speed(total.distance, total.moving_time);
    total
}

fn average_speed(distance_km: f64, moving_time_ms: i64) -> f64 {
    if moving_time_ms > 0 {
        distance_km / moving_time_ms as f64 * MS_PER_HOUR
    } else {
        0.0
    }
}

/// Centered moving average over elevations, window clamped at both ends of
/// the sequence.
fn smooth_elevations(points: &[TrackPoint], window: usize) -> Vec<f64> {
    let half = window / 2;

    (0..points.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half).min(points.len() - 1);

            let sum: f64 = points[start..=end].iter().map(|p| p.elevation).sum();
            sum / (end - start + 1) as f64
        })
        .collect()
}
