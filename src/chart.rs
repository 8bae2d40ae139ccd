use crate::track::TrackPoint;

/// Reduce a track to at most `target_count` points for elevation-chart
/// rendering.
///
/// Largest-triangle bucketing over `(lat, elevation)`: the first and last
/// point always survive, and each intermediate bucket keeps the point
/// spanning the largest triangle between the previously kept point and the
/// next bucket's average. Peaks and drops survive where plain striding
/// would miss them.
///
/// Kept points pass through unchanged; their `index` and `distance` still
/// refer to the full sequence, which is what the chart's x-axis plots.
pub fn downsample_for_chart(points: &[TrackPoint], target_count: usize) -> Vec<TrackPoint> {
    if points.len() <= target_count {
        return points.to_vec();
    }

    // Budgets below three can't fit the endpoint-plus-buckets scheme.
    if target_count < 3 {
        let mut sampled = Vec::with_capacity(target_count);
        if target_count >= 1 {
            sampled.push(points[0]);
        }
        if target_count >= 2 {
            sampled.push(points[points.len() - 1]);
        }
        return sampled;
    }

    let len = points.len();
    let bucket_size = (len - 2) as f64 / (target_count - 2) as f64;

    let mut sampled = Vec::with_capacity(target_count);
    sampled.push(points[0]);

    let mut prev_idx = 0;
    for i in 0..target_count - 2 {
        // Average of the next bucket, the triangle's far corner.
        let next_start = ((i + 1) as f64 * bucket_size).floor() as usize + 1;
        let next_end = (((i + 2) as f64 * bucket_size).floor() as usize + 1).min(len - 1);

        let mut avg_lat = 0.0;
        let mut avg_elevation = 0.0;
        for pt in &points[next_start..next_end] {
            avg_lat += pt.lat;
            avg_elevation += pt.elevation;
        }
        let next_count = (next_end - next_start).max(1) as f64;
        avg_lat /= next_count;
        avg_elevation /= next_count;

        let range_start = (i as f64 * bucket_size).floor() as usize + 1;
        let range_end = ((i + 1) as f64 * bucket_size).floor() as usize + 1;

        let prev = points[prev_idx];
        let mut max_area = -1.0;
        let mut max_idx = range_start;

        let mut j = range_start;
        while j < range_end && j < len - 1 {
            let area = ((prev.lat - avg_lat) * (points[j].elevation - prev.elevation)
                - (prev.lat - points[j].lat) * (avg_elevation - prev.elevation))
                .abs();
            if area > max_area {
                max_area = area;
                max_idx = j;
            }
            j += 1;
        }

        sampled.push(points[max_idx]);
        prev_idx = max_idx;
    }

    sampled.push(points[len - 1]);
    sampled
}
