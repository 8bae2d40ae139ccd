use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use csv::StringRecord;
use fitparser::de::{DecodeOption, from_reader_with_options};
use fitparser::profile::MesgNum;
use flate2::read::GzDecoder;
use geo_types::Point;
use rayon::iter::{ParallelBridge, ParallelIterator};
use rusqlite::{Connection, OptionalExtension, params};
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::db::{self, Database};
use crate::stats::{TrackStats, compute_stats_with_window};
use crate::track::{TrackPoint, has_usable_timestamps, resequence};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    Gpx,
    Fit,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Gpx => "gpx",
            SourceFormat::Fit => "fit",
        }
    }
}

pub enum Compression {
    None,
    Gzip,
}

/// One track parsed out of a recording file. A single GPX file can hold
/// several.
#[derive(Clone, Debug)]
pub struct ParsedActivity {
    pub name: String,
    pub source_format: SourceFormat,
    pub points: Vec<TrackPoint>,
}

/// Allows us to treat `bar.gpx.gz` the same as `bar.gpx`. Extension
/// matching is case-insensitive.
pub fn get_file_type(file_name: &str) -> Option<(SourceFormat, Compression)> {
    let mut exts = file_name.rsplit('.');

    let (comp, ext) = match exts.next()?.to_ascii_lowercase().as_str() {
        "gz" => (Compression::Gzip, exts.next()?.to_ascii_lowercase()),
        ext => (Compression::None, ext.to_string()),
    };

    match ext.as_str() {
        "gpx" => Some((SourceFormat::Gpx, comp)),
        "fit" => Some((SourceFormat::Fit, comp)),
        _ => None,
    }
}

pub fn read<R>(rdr: R, kind: SourceFormat, comp: Compression, default_name: &str) -> Result<Vec<ParsedActivity>>
where
    R: Read + 'static,
{
    let mut reader: BufReader<Box<dyn Read>> = BufReader::new(match comp {
        Compression::None => Box::new(rdr),
        Compression::Gzip => Box::new(GzDecoder::new(rdr)),
    });

    match kind {
        SourceFormat::Gpx => parse_gpx(&mut reader, default_name),
        SourceFormat::Fit => parse_fit(&mut reader, default_name),
    }
}

/// Parse a recording file; unsupported file types come back as an empty
/// list rather than an error so directory walks can skip over them.
pub fn read_file(p: &Path) -> Result<Vec<ParsedActivity>> {
    let Some(file_name) = p.file_name().and_then(|f| f.to_str()) else {
        return Err(anyhow!("no file name"));
    };

    let Some((kind, comp)) = get_file_type(file_name) else {
        return Ok(vec![]);
    };

    let file = File::open(p)?;
    read(file, kind, comp, strip_format_suffix(file_name))
}

/// "day4.gpx.gz" -> "day4"
fn strip_format_suffix(file_name: &str) -> &str {
    let name = file_name.strip_suffix(".gz").unwrap_or(file_name);

    for ext in [".gpx", ".fit"] {
        if name.len() > ext.len() && name[name.len() - ext.len()..].eq_ignore_ascii_case(ext) {
            return &name[..name.len() - ext.len()];
        }
    }
    name
}

fn timestamp_ms(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Every `<trk>` becomes its own activity; segments within a track are
/// flattened into one point sequence.
fn parse_gpx<R: Read>(reader: &mut R, default_name: &str) -> Result<Vec<ParsedActivity>> {
    let gpx = gpx::read(reader)?;

    let mut activities = vec![];
    for (track_no, track) in gpx.tracks.into_iter().enumerate() {
        let name = track.name.clone().unwrap_or_else(|| {
            if track_no == 0 {
                default_name.to_string()
            } else {
                format!("{} #{}", default_name, track_no + 1)
            }
        });

        let points: Vec<TrackPoint> = track
            .segments
            .into_iter()
            .flat_map(|segment| segment.points)
            .map(|wpt| {
                let position = wpt.point();
                TrackPoint {
                    lat: position.y(),
                    lon: position.x(),
                    elevation: wpt.elevation.unwrap_or(0.0),
                    timestamp: wpt.time.map(OffsetDateTime::from).map(timestamp_ms).unwrap_or(0),
                    index: 0,
                    distance: 0.0,
                }
            })
            .collect();

        if points.is_empty() {
            continue;
        }

        activities.push(ParsedActivity {
            name,
            source_format: SourceFormat::Gpx,
            points: resequence(points),
        });
    }

    Ok(activities)
}

fn parse_fit<R: Read>(r: &mut R, default_name: &str) -> Result<Vec<ParsedActivity>> {
    // Semicircles to degrees.
    const SCALE_FACTOR: f64 = (1u64 << 32) as f64 / 360.0;

    let opts = [
        DecodeOption::SkipDataCrcValidation,
        DecodeOption::SkipHeaderCrcValidation,
    ]
    .into();

    let mut points = vec![];
    for data in from_reader_with_options(r, &opts)? {
        if data.kind() != MesgNum::Record {
            continue;
        }

        let mut lat: Option<i64> = None;
        let mut lng: Option<i64> = None;
        let mut elevation: Option<f64> = None;
        let mut timestamp: Option<i64> = None;

        for f in data.fields() {
            match f.name() {
                "position_lat" => lat = f.value().try_into().ok(),
                "position_long" => lng = f.value().try_into().ok(),
                "enhanced_altitude" => elevation = f.value().clone().try_into().ok().or(elevation),
                "altitude" => elevation = elevation.or_else(|| f.value().clone().try_into().ok()),
                "timestamp" => timestamp = f.value().try_into().ok(),
                _ => {}
            }
        }

        if let (Some(lat), Some(lng)) = (lat, lng) {
            let position = Point::new(lng as f64, lat as f64) / SCALE_FACTOR;
            points.push(TrackPoint {
                lat: position.y(),
                lon: position.x(),
                elevation: elevation.unwrap_or(0.0),
                timestamp: timestamp.map(|s| s * 1000).unwrap_or(0),
                index: 0,
                distance: 0.0,
            });
        }
    }

    if points.is_empty() {
        return Ok(vec![]);
    }

    Ok(vec![ParsedActivity {
        name: default_name.to_string(),
        source_format: SourceFormat::Fit,
        points: resequence(points),
    }])
}

/// Optional per-file import overrides joined from a CSV file: which trail
/// day an activity belongs to and a display title. Paths in the `filename`
/// column are relative to the CSV's directory.
#[derive(Default)]
pub struct Manifest {
    base_dir: PathBuf,
    entries: HashMap<PathBuf, ManifestEntry>,
}

#[derive(Clone, Debug, Default)]
pub struct ManifestEntry {
    pub day: Option<u32>,
    pub title: Option<String>,
}

impl Manifest {
    pub fn from_csv(csv_path: &Path) -> Result<Self> {
        const JOIN_COL: &str = "filename";

        let base_dir = csv_path.parent().unwrap_or(Path::new("/")).canonicalize()?;

        let mut rdr = csv::Reader::from_path(csv_path)?;
        let mut entries = HashMap::new();

        // Normalize header naming
        let headers = StringRecord::from_iter(
            rdr.headers()?
                .iter()
                .map(|hdr| hdr.to_lowercase().replace(' ', "_")),
        );
        rdr.set_headers(headers);

        for row in rdr.deserialize() {
            let mut row: HashMap<String, String> = row?;

            // Only keep the non-empty keys
            row.retain(|_k, v| !v.trim().is_empty());

            let Some(filename) = row.remove(JOIN_COL) else {
                tracing::warn!(?row, "missing {JOIN_COL} column");
                continue;
            };

            let day = match row.get("day").map(|v| v.trim().parse::<u32>()) {
                Some(Ok(n)) => Some(n),
                Some(Err(_)) => {
                    tracing::warn!(%filename, "ignoring unparseable day number");
                    None
                }
                None => None,
            };

            entries.insert(
                PathBuf::from(filename),
                ManifestEntry {
                    day,
                    title: row.remove("title"),
                },
            );
        }

        Ok(Self { base_dir, entries })
    }

    fn lookup(&self, path: &Path) -> Option<&ManifestEntry> {
        let path = path.canonicalize().ok()?;
        let rel = path.strip_prefix(&self.base_dir).ok()?;
        self.entries.get(rel)
    }
}

/// Insert or refresh a single parsed activity and its point blob. The row
/// id for a given `(file, track_no)` stays stable across re-imports so the
/// trackpoints row is replaced, never orphaned.
pub fn upsert(
    conn: &Connection,
    file: &str,
    track_no: u32,
    day_id: i64,
    name: &str,
    activity: &ParsedActivity,
    stats: &TrackStats,
) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM activities WHERE file = ? AND track_no = ?",
            params![file, track_no],
            |row| row.get(0),
        )
        .optional()?;

    let activity_id = match existing {
        Some(id) => {
            conn.execute(
                "\
                UPDATE activities SET \
                    trail_day_id = ?, name = ?, source_format = ?, \
                    distance_km = ?, elevation_gain_m = ?, elevation_loss_m = ?, \
                    duration_ms = ?, moving_time_ms = ?, avg_speed_kmh = ?, \
                    start_time = ?, end_time = ? \
                WHERE id = ?",
                params![
                    day_id,
                    name,
                    activity.source_format.as_str(),
                    stats.distance,
                    stats.elevation_gain,
                    stats.elevation_loss,
                    stats.duration,
                    stats.moving_time,
                    stats.avg_speed,
                    stats.start_time,
                    stats.end_time,
                    id,
                ],
            )?;
            id
        }
        None => {
            let sort_order: i64 = conn.query_row(
                "SELECT COUNT(*) FROM activities WHERE trail_day_id = ?",
                params![day_id],
                |row| row.get(0),
            )?;

            conn.execute(
                "\
                INSERT INTO activities \
                    (trail_day_id, file, track_no, name, source_format, sort_order, \
                     distance_km, elevation_gain_m, elevation_loss_m, duration_ms, \
                     moving_time_ms, avg_speed_kmh, start_time, end_time, created_at) \
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    day_id,
                    file,
                    track_no,
                    name,
                    activity.source_format.as_str(),
                    sort_order,
                    stats.distance,
                    stats.elevation_gain,
                    stats.elevation_loss,
                    stats.duration,
                    stats.moving_time,
                    stats.avg_speed,
                    stats.start_time,
                    stats.end_time,
                    OffsetDateTime::now_utc(),
                ],
            )?;
            conn.last_insert_rowid()
        }
    };

    conn.execute(
        "INSERT OR REPLACE INTO trackpoints (activity_id, points) VALUES (?, ?)",
        params![activity_id, db::encode_points(&activity.points)?],
    )?;

    Ok(activity_id)
}

fn start_date(timestamp_ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp_ms / 1000)
        .map(|t| t.date().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Walk a directory tree and import every recording into `trail`.
///
/// Activities land in the trail day named by the manifest, falling back to
/// their start date. Files already present in the database are skipped.
/// Activities without usable timestamps are rejected whole, with a warning.
pub fn import_path(p: &Path, db: &Database, trail: &str, manifest: &Manifest) -> Result<()> {
    let config = db.load_config()?;
    let conn = db.connection()?;
    let trail_id = db::upsert_trail(&conn, trail)?;

    // Skip any files that are already in the database.
    let known_files: HashSet<String> = conn
        .prepare("SELECT DISTINCT file FROM activities")?
        .query_map([], |row| row.get(0))?
        .filter_map(|n| n.ok())
        .collect();

    tracing::info!(
        path = ?p,
        trail,
        num_known = known_files.len(),
        "starting activity import"
    );

    let num_imported = AtomicU32::new(0);
    let num_rejected = AtomicU32::new(0);

    WalkDir::new(p)
        .into_iter()
        .par_bridge()
        .filter_map(|dir| {
            let dir = dir.ok()?;
            let path = dir.path();

            if !known_files.contains(path.to_str()?) {
                Some(path.to_owned())
            } else {
                None
            }
        })
        .filter_map(|path| {
            let activities = read_file(&path)
                .map_err(|err| tracing::error!(?path, ?err, "failed to read activity file"))
                .ok()?;

            if activities.is_empty() {
                None
            } else {
                Some((path, activities))
            }
        })
        .for_each_init(
            || db.shared_pool(),
            |pool, (path, activities)| {
                tracing::debug!(?path, "importing activities");

                let conn = pool.get().expect("db connection pool timed out");
                let entry = manifest.lookup(&path).cloned().unwrap_or_default();

                for (track_no, activity) in activities.into_iter().enumerate() {
                    if !has_usable_timestamps(&activity.points) {
                        tracing::warn!(
                            ?path,
                            name = %activity.name,
                            "skipping activity without usable timestamps"
                        );
                        num_rejected.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let stats = compute_stats_with_window(&activity.points, config.smoothing_window);

                    let day_name = match entry.day {
                        Some(n) => format!("Day {n}"),
                        None => start_date(stats.start_time),
                    };
                    let name = entry.title.clone().unwrap_or_else(|| activity.name.clone());

                    let day_id =
                        db::day_for_name(&conn, trail_id, &day_name).expect("resolve trail day");
                    upsert(
                        &conn,
                        path.to_str().unwrap(),
                        track_no as u32,
                        day_id,
                        &name,
                        &activity,
                        &stats,
                    )
                    .expect("insert activity");

                    num_imported.fetch_add(1, Ordering::Relaxed);
                }
            },
        );

    // Day numbers assigned during the parallel walk are provisional; fix
    // them up chronologically now that every activity is in.
    db::renumber_days(&conn, trail_id)?;

    conn.execute_batch("VACUUM")?;
    tracing::info!(?num_imported, ?num_rejected, "finished import");
    Ok(())
}
