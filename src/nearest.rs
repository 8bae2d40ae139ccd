use crate::track::{EARTH_RADIUS_KM, LatLng, TrackPoint, haversine_km};

/// Closest point on the track polyline to a query coordinate: either an
/// original vertex or a point interpolated on a segment between two
/// consecutive vertices.
///
/// Vertices are compared by haversine distance; segments by a local
/// equirectangular projection (good for the short spans between recorded
/// points), scaled back to km so both phases compare in the same unit.
/// Ties keep the earlier candidate, vertices before segments.
pub fn find_nearest_point(points: &[TrackPoint], lat: f64, lon: f64) -> Option<TrackPoint> {
    let first = points.first()?;
    let query = LatLng { lat, lon };

    let mut nearest = *first;
    let mut min_dist = haversine_km(query, first.lat_lng());

    for pt in &points[1..] {
        let dist = haversine_km(query, pt.lat_lng());
        if dist < min_dist {
            min_dist = dist;
            nearest = *pt;
        }
    }

    for pair in points.windows(2) {
        let (candidate, dist) = project_onto_segment(query, &pair[0], &pair[1]);
        if dist < min_dist {
            min_dist = dist;
            nearest = candidate;
        }
    }

    Some(nearest)
}

/// Closest point to `query` on the segment from `a` to `b`, and its
/// distance in km.
///
/// Works in a local planar frame centered on the query: longitudes are
/// scaled by the cosine of the segment's mean latitude so east-west spans
/// keep their true proportions. The projection parameter is clamped to the
/// segment, and `elevation`, `timestamp` and `distance` are interpolated
/// linearly at it. The interpolated point inherits the index of whichever
/// endpoint it is closer to.
fn project_onto_segment(query: LatLng, a: &TrackPoint, b: &TrackPoint) -> (TrackPoint, f64) {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let lon1 = a.lon.to_radians();
    let lon2 = b.lon.to_radians();
    let lat_q = query.lat.to_radians();
    let lon_q = query.lon.to_radians();

    let cos_lat_mid = ((lat1 + lat2) / 2.0).cos();

    // Local x/y in radians, query at the origin.
    let x1 = (lon1 - lon_q) * cos_lat_mid;
    let y1 = lat1 - lat_q;
    let x2 = (lon2 - lon_q) * cos_lat_mid;
    let y2 = lat2 - lat_q;

    let dx = x2 - x1;
    let dy = y2 - y1;
    let len2 = dx * dx + dy * dy;

    // Clamp to [0, 1]: never extrapolate past the segment's ends. A
    // zero-length segment keeps t at 0 and degenerates to point A.
    let mut t = -x1 * dx - y1 * dy;
    if len2 > 0.0 {
        t /= len2;
    }
    let t = t.clamp(0.0, 1.0);

    let closest_x = x1 + t * dx;
    let closest_y = y1 + t * dy;

    let point = TrackPoint {
        lat: (lat_q + closest_y).to_degrees(),
        lon: (lon_q + closest_x / cos_lat_mid).to_degrees(),
        elevation: a.elevation + (b.elevation - a.elevation) * t,
        timestamp: a.timestamp + ((b.timestamp - a.timestamp) as f64 * t) as i64,
        distance: a.distance + (b.distance - a.distance) * t,
        index: if t < 0.5 { a.index } else { b.index },
    };

    let dist_km = closest_x.hypot(closest_y) * EARTH_RADIUS_KM;
    (point, dist_km)
}

/// Point whose cumulative `distance` is closest to `target_km`, via binary
/// search. Expects points ordered ascending by `distance`; prefers the
/// earlier neighbor when both sides are equally close.
pub fn find_point_by_distance(points: &[TrackPoint], target_km: f64) -> Option<TrackPoint> {
    if points.is_empty() {
        return None;
    }

    let mut low = 0;
    let mut high = points.len() - 1;
    while low < high {
        let mid = (low + high) / 2;
        if points[mid].distance < target_km {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    if low > 0 && (points[low - 1].distance - target_km).abs() <= (points[low].distance - target_km).abs() {
        return Some(points[low - 1]);
    }
    Some(points[low])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{point, resequence};

    #[test]
    fn test_empty_track() {
        assert_eq!(find_nearest_point(&[], 50.0, 14.0), None);
    }

    #[test]
    fn test_single_point() {
        let p = point(50.0, 14.0, 0.0, 0);
        assert_eq!(find_nearest_point(&[p], 51.0, 15.0), Some(p));
    }

    #[test]
    fn test_picks_closer_end_of_track() {
        let near = point(50.0, 14.0, 10.0, 1000);
        let far = point(51.0, 15.0, 20.0, 2000);

        // Queries beyond either end of the polyline resolve to that end,
        // whether through the vertex scan or the clamped projection.
        let hit = find_nearest_point(&[near, far], 49.99, 13.99).unwrap();
        assert!((hit.lat - near.lat).abs() < 1e-9, "lat was {}", hit.lat);
        assert_eq!(hit.elevation, near.elevation);
        assert_eq!(hit.timestamp, near.timestamp);

        let hit = find_nearest_point(&[near, far], 51.01, 15.01).unwrap();
        assert!((hit.lat - far.lat).abs() < 1e-9, "lat was {}", hit.lat);
        assert_eq!(hit.elevation, far.elevation);
        assert_eq!(hit.timestamp, far.timestamp);
    }

    #[test]
    fn test_query_beyond_segment_clamps_to_endpoint() {
        // Query lies on the line but before the segment start; the clamped
        // projection degenerates to the first vertex instead of
        // extrapolating past it.
        let a = point(50.0, 14.0, 100.0, 1000);
        let b = point(50.0, 14.002, 200.0, 2000);

        let hit = find_nearest_point(&[a, b], 50.0, 13.998).unwrap();
        assert!((hit.lat - a.lat).abs() < 1e-9);
        assert!((hit.lon - a.lon).abs() < 1e-9);
        assert_eq!(hit.elevation, a.elevation);
        assert_eq!(hit.timestamp, a.timestamp);
        assert_eq!(hit.index, a.index);
    }

    #[test]
    fn test_midpoint_interpolation() {
        let a = point(50.0, 14.0, 100.0, 0);
        let b = point(50.0, 14.002, 200.0, 10_000);
        let points = resequence(vec![a, b]);

        let hit = find_nearest_point(&points, 50.0005, 14.001).unwrap();

        // Interpolated halfway, not either endpoint.
        assert!((hit.lon - 14.001).abs() < 1e-9, "lon was {}", hit.lon);
        assert!((hit.lat - 50.0).abs() < 1e-9, "lat was {}", hit.lat);
        assert!((hit.elevation - 150.0).abs() < 1e-6);
        assert!((hit.timestamp - 5_000).abs() <= 1, "timestamp was {}", hit.timestamp);
        assert!((hit.distance - points[1].distance / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_interpolated_index_inherits_nearer_endpoint() {
        let a = point(50.0, 14.0, 0.0, 0);
        let b = point(50.0, 14.004, 0.0, 0);
        let points = resequence(vec![a, b]);

        let hit = find_nearest_point(&points, 50.0005, 14.001).unwrap();
        assert_eq!(hit.index, 0, "quarter-way projection should keep the earlier index");

        let hit = find_nearest_point(&points, 50.0005, 14.003).unwrap();
        assert_eq!(hit.index, 1);
    }

    #[test]
    fn test_find_point_by_distance() {
        let points: Vec<_> = (0..5)
            .map(|i| {
                let mut p = point(50.0, 14.0, 0.0, 0);
                p.index = i;
                p.distance = i as f64;
                p
            })
            .collect();

        assert_eq!(find_point_by_distance(&points, -1.0).unwrap().index, 0);
        assert_eq!(find_point_by_distance(&points, 0.0).unwrap().index, 0);
        assert_eq!(find_point_by_distance(&points, 1.4).unwrap().index, 1);
        assert_eq!(find_point_by_distance(&points, 1.6).unwrap().index, 2);
        assert_eq!(find_point_by_distance(&points, 9.9).unwrap().index, 4);

        // Exact tie between neighbors resolves to the earlier one.
        assert_eq!(find_point_by_distance(&points, 2.5).unwrap().index, 2);

        assert_eq!(find_point_by_distance(&[], 1.0), None);
    }
}
