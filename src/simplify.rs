use crate::track::{TrackPoint, resequence};

/// Ramer–Douglas–Peucker reduction of a track to a visually equivalent
/// subset.
///
/// Distances are planar over raw lat/lon degrees, so `tolerance` is in
/// degrees and must be picked per target resolution (see
/// [`tolerance_for_zoom`]). Worst case is O(n²) when every point is equally
/// deviant; fine at interactive track sizes.
///
/// Uses an explicit interval stack rather than recursion, so a
/// pathologically long noisy track can't exhaust the call stack.
pub fn simplify_track(points: &[TrackPoint], tolerance: f64) -> Vec<TrackPoint> {
    if points.len() <= 2 {
        return resequence(points.to_vec());
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    let mut intervals = vec![(0, points.len() - 1)];
    while let Some((start, end)) = intervals.pop() {
        if end - start < 2 {
            continue;
        }

        let mut max_dist = 0.0;
        let mut max_idx = start;

        for idx in start + 1..end {
            let dist = point_to_chord_dist(&points[idx], &points[start], &points[end]);
            if dist > max_dist {
                max_dist = dist;
                max_idx = idx;
            }
        }

        // Everything between start and end hugs the chord closely enough to
        // be dropped; otherwise keep the most deviant point and refine both
        // halves around it.
        if max_dist > tolerance {
            keep[max_idx] = true;
            intervals.push((start, max_idx));
            intervals.push((max_idx, end));
        }
    }

    let kept = points
        .iter()
        .zip(&keep)
        .filter(|(_, keep)| **keep)
        .map(|(pt, _)| *pt)
        .collect();

    resequence(kept)
}

/// Perpendicular distance from `pt` to the infinite line through `start`
/// and `end`, all in planar degree space (lat as x, lon as y).
fn point_to_chord_dist(pt: &TrackPoint, start: &TrackPoint, end: &TrackPoint) -> f64 {
    let dx = end.lat - start.lat;
    let dy = end.lon - start.lon;

    // Chord start and end are the same point, so just return the distance
    // to that point.
    if dx == 0.0 && dy == 0.0 {
        return (pt.lat - start.lat).hypot(pt.lon - start.lon);
    }

    let t = ((pt.lat - start.lat) * dx + (pt.lon - start.lon) * dy) / (dx * dx + dy * dy);
    let proj_lat = start.lat + t * dx;
    let proj_lon = start.lon + t * dy;

    (pt.lat - proj_lat).hypot(pt.lon - proj_lon)
}

/// RDP tolerance in degrees for a map zoom level, or `None` at high zoom
/// where the supplied points are used as-is.
pub fn tolerance_for_zoom(zoom: f64) -> Option<f64> {
    if zoom < 6.0 {
        Some(0.05)
    } else if zoom < 8.0 {
        Some(0.01)
    } else if zoom < 10.0 {
        Some(0.003)
    } else if zoom < 12.0 {
        Some(0.001)
    } else if zoom < 14.0 {
        Some(0.0003)
    } else {
        None
    }
}

/// Zoom-appropriate subset of points for map rendering.
pub fn simplify_for_zoom(points: &[TrackPoint], zoom: f64) -> Vec<TrackPoint> {
    match tolerance_for_zoom(zoom) {
        Some(tolerance) => simplify_track(points, tolerance),
        None => points.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::point;

    fn pt(lat: f64, lon: f64) -> TrackPoint {
        point(lat, lon, 0.0, 0)
    }

    #[test]
    fn test_simplify_collapses_collinear_points() {
        let line: Vec<_> = (0..10).map(|i| pt(i as f64 * 0.001, i as f64 * 0.001)).collect();

        let simplified = simplify_track(&line, 0.0005);
        assert_eq!(simplified.len(), 2);
        assert_eq!(simplified[0].lat, line[0].lat);
        assert_eq!(simplified[1].lat, line[9].lat);
    }

    #[test]
    fn test_simplify_retains_deviant_point() {
        let line = vec![pt(0.0, 0.0), pt(0.05, 0.1), pt(0.0, 0.2)];

        let simplified = simplify_track(&line, 0.01);
        assert_eq!(simplified.len(), 3);
    }

    #[test]
    fn test_simplify_short_input_unchanged() {
        let line = vec![pt(1.0, 2.0), pt(3.0, 4.0)];
        let simplified = simplify_track(&line, 100.0);

        assert_eq!(simplified.len(), 2);
        assert_eq!(simplified[0].lat, 1.0);
        assert_eq!(simplified[1].lat, 3.0);
    }

    #[test]
    fn test_simplify_keeps_endpoints_and_resequences() {
        let line = vec![
            pt(0.0, 0.0),
            pt(0.5, 0.5),
            pt(0.0, 1.0),
            pt(0.1, 1.5),
            pt(0.0, 2.0),
        ];

        let simplified = simplify_track(&line, 0.2);
        assert_eq!(simplified.first().map(|p| p.lon), Some(0.0));
        assert_eq!(simplified.last().map(|p| p.lon), Some(2.0));

        for (i, p) in simplified.iter().enumerate() {
            assert_eq!(p.index, i);
        }
        assert_eq!(simplified[0].distance, 0.0);
        for w in simplified.windows(2) {
            assert!(w[1].distance > w[0].distance);
        }
    }

    #[test]
    fn test_simplify_degenerate_chord() {
        // Loop: first and last are the same point, the spike must survive.
        let line = vec![pt(0.0, 0.0), pt(0.5, 0.5), pt(0.0, 0.0)];

        let simplified = simplify_track(&line, 0.1);
        assert_eq!(simplified.len(), 3);
    }

    #[test]
    fn test_point_to_chord_dist() {
        let start = pt(0.0, 0.0);
        let end = pt(10.0, 10.0);

        assert_eq!(point_to_chord_dist(&pt(5.0, 5.0), &start, &end), 0.0);

        let d = point_to_chord_dist(&pt(5.0, 0.0), &start, &end);
        assert!((d - 5.0 / 2.0_f64.sqrt()).abs() < 1e-12);

        // Projection falls beyond the chord end; distance is still measured
        // against the infinite line.
        let d = point_to_chord_dist(&pt(11.0, 11.0), &start, &end);
        assert!(d.abs() < 1e-12);
    }

    #[test]
    fn test_zoom_tolerance_table() {
        assert_eq!(tolerance_for_zoom(3.0), Some(0.05));
        assert_eq!(tolerance_for_zoom(5.9), Some(0.05));
        assert_eq!(tolerance_for_zoom(6.0), Some(0.01));
        assert_eq!(tolerance_for_zoom(8.0), Some(0.003));
        assert_eq!(tolerance_for_zoom(10.0), Some(0.001));
        assert_eq!(tolerance_for_zoom(12.0), Some(0.0003));
        assert_eq!(tolerance_for_zoom(13.9), Some(0.0003));
        assert_eq!(tolerance_for_zoom(14.0), None);
        assert_eq!(tolerance_for_zoom(18.0), None);
    }

    #[test]
    fn test_simplify_for_zoom_passthrough_at_high_zoom() {
        let line: Vec<_> = (0..50).map(|i| pt(i as f64 * 0.0001, 0.0)).collect();

        let high = simplify_for_zoom(&line, 16.0);
        assert_eq!(high.len(), line.len());

        let low = simplify_for_zoom(&line, 4.0);
        assert_eq!(low.len(), 2);
    }
}
