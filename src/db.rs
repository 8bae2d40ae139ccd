use std::io::Cursor;
use std::path::Path;

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use time::OffsetDateTime;

use crate::stats::{DEFAULT_SMOOTHING_WINDOW, TrackStats};
use crate::track::TrackPoint;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS config (
      key   TEXT NOT NULL PRIMARY KEY
    , value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trails (
      id         INTEGER PRIMARY KEY
    , name       TEXT NOT NULL
    , created_at TEXT NOT NULL
    , updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS trails_name ON trails (name);

CREATE TABLE IF NOT EXISTS trail_days (
      id         INTEGER PRIMARY KEY
    , trail_id   INTEGER NOT NULL REFERENCES trails (id)
    , name       TEXT    NOT NULL
    , day_number INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS trail_days_trail_name ON trail_days (trail_id, name);

CREATE TABLE IF NOT EXISTS activities (
      id               INTEGER PRIMARY KEY
    , trail_day_id     INTEGER NOT NULL REFERENCES trail_days (id)
    , file             TEXT    NOT NULL
    , track_no         INTEGER NOT NULL DEFAULT 0
    , name             TEXT    NOT NULL
    , source_format    TEXT    NOT NULL
    , sort_order       INTEGER NOT NULL DEFAULT 0
    , distance_km      REAL    NOT NULL DEFAULT 0
    , elevation_gain_m REAL    NOT NULL DEFAULT 0
    , elevation_loss_m REAL    NOT NULL DEFAULT 0
    , duration_ms      INTEGER NOT NULL DEFAULT 0
    , moving_time_ms   INTEGER NOT NULL DEFAULT 0
    , avg_speed_kmh    REAL    NOT NULL DEFAULT 0
    , start_time       INTEGER NOT NULL DEFAULT 0
    , end_time         INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS activities_file_track ON activities (file, track_no);
CREATE INDEX IF NOT EXISTS activities_trail_day_id ON activities (trail_day_id);

CREATE TABLE IF NOT EXISTS trackpoints (
      activity_id INTEGER PRIMARY KEY REFERENCES activities (id)
    , points      BLOB    NOT NULL
);
";

const MIGRATIONS: [&str; 1] = [
    // Keep track of when activities are added to the DB separately from when
    // they occurred.
    "ALTER TABLE activities ADD COLUMN created_at TEXT;",
];

pub struct Database {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "OFF")?;
            Ok(())
        });

        Self::from_manager(manager)
    }

    pub fn memory() -> Result<Self> {
        // Every in-memory sqlite connection is its own database, so the
        // pool must never open a second one.
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        Self::from_pool(pool)
    }

    fn from_manager(manager: SqliteConnectionManager) -> Result<Self> {
        Self::from_pool(r2d2::Pool::new(manager)?)
    }

    fn from_pool(pool: r2d2::Pool<SqliteConnectionManager>) -> Result<Self> {
        let mut conn = pool.get()?;

        apply_schema(&mut conn)?;

        // Load config to ensure defaults are saved
        let config = Config::load_from(&conn)?;
        config.save(&conn)?;

        Ok(Database { pool })
    }

    /// Open an existing database, fail if it doesn't exist
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("database does not exist: {}", path.display());
        }

        Self::new(path)
    }

    pub fn load_config(&self) -> Result<Config> {
        let conn = self.connection()?;
        Config::load_from(&conn)
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        let conn = self.connection()?;
        config.save(&conn)
    }

    pub fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        let conn = self.pool.get()?;
        Ok(conn)
    }

    pub fn shared_pool(&self) -> r2d2::Pool<SqliteConnectionManager> {
        self.pool.clone()
    }
}

fn apply_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;

    let version: usize = tx.pragma_query_value(None, "user_version", |r| r.get::<_, i64>(0))? as usize;
    if version < MIGRATIONS.len() {
        for sql in MIGRATIONS.iter().skip(version) {
            tracing::info!("applying migration: `{}`", sql);
            tx.execute_batch(sql)?;
        }

        tx.pragma_update(None, "user_version", MIGRATIONS.len() as i64)?;
    }

    tx.commit()?;
    Ok(())
}

const DEFAULT_CHART_POINTS: usize = 500;

pub struct Config {
    /// Elevation smoothing window used when computing activity stats.
    pub smoothing_window: usize,
    /// Default point budget for elevation-chart downsampling.
    pub chart_points: usize,
}

impl Config {
    fn load_from(conn: &Connection) -> Result<Self> {
        let mut cfg = Config::default();

        let mut stmt = conn.prepare("SELECT key, value FROM config")?;
        let mut rows = stmt.query([])?;

        while let Some(row) = rows.next()? {
            let key: String = row.get_unwrap(0);
            let value: String = row.get_unwrap(1);

            match key.as_str() {
                "smoothing_window" => cfg.smoothing_window = value.parse()?,
                "chart_points" => cfg.chart_points = value.parse()?,
                key => tracing::warn!("Ignoring unknown config key: {}", key),
            }
        }

        Ok(cfg)
    }

    fn save(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(
            "\
            INSERT OR REPLACE INTO config (key, value) \
            VALUES (?, ?)",
        )?;
        stmt.execute(params!["smoothing_window", &self.smoothing_window.to_string()])?;
        stmt.execute(params!["chart_points", &self.chart_points.to_string()])?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
            chart_points: DEFAULT_CHART_POINTS,
        }
    }
}

/// Bytes per encoded trackpoint: lat, lon, elevation as f64, timestamp as
/// i64, then cumulative distance as f64.
const POINT_STRIDE: usize = 5 * 8;

/// Pack a point sequence into a fixed-stride little-endian blob. The index
/// is implied by position and not stored.
pub fn encode_points(points: &[TrackPoint]) -> Result<Vec<u8>> {
    let mut w = Vec::with_capacity(points.len() * POINT_STRIDE);
    for pt in points {
        w.write_f64::<LittleEndian>(pt.lat)?;
        w.write_f64::<LittleEndian>(pt.lon)?;
        w.write_f64::<LittleEndian>(pt.elevation)?;
        w.write_i64::<LittleEndian>(pt.timestamp)?;
        w.write_f64::<LittleEndian>(pt.distance)?;
    }
    Ok(w)
}

pub fn decode_points(bytes: &[u8]) -> Result<Vec<TrackPoint>> {
    let mut points = Vec::with_capacity(bytes.len() / POINT_STRIDE);
    let mut reader = Cursor::new(bytes);

    let mut index = 0;
    while (reader.position() as usize) < bytes.len() {
        points.push(TrackPoint {
            lat: reader.read_f64::<LittleEndian>()?,
            lon: reader.read_f64::<LittleEndian>()?,
            elevation: reader.read_f64::<LittleEndian>()?,
            timestamp: reader.read_i64::<LittleEndian>()?,
            index,
            distance: reader.read_f64::<LittleEndian>()?,
        });
        index += 1;
    }
    Ok(points)
}

pub fn upsert_trail(conn: &Connection, name: &str) -> Result<i64> {
    let now = OffsetDateTime::now_utc();
    conn.execute(
        "\
        INSERT INTO trails (name, created_at, updated_at) VALUES (?1, ?2, ?2) \
        ON CONFLICT (name) DO UPDATE SET updated_at = ?2",
        params![name, now],
    )?;

    let id = conn.query_row("SELECT id FROM trails WHERE name = ?", params![name], |row| {
        row.get(0)
    })?;
    Ok(id)
}

/// Find or create the named day within a trail. Racing importers may both
/// attempt the insert; the unique index makes the loser a no-op. Day
/// numbers assigned here are provisional until [`renumber_days`].
pub fn day_for_name(conn: &Connection, trail_id: i64, name: &str) -> Result<i64> {
    conn.execute(
        "\
        INSERT OR IGNORE INTO trail_days (trail_id, name, day_number) \
        VALUES (?1, ?2, (SELECT COUNT(*) + 1 FROM trail_days WHERE trail_id = ?1))",
        params![trail_id, name],
    )?;

    let id = conn.query_row(
        "SELECT id FROM trail_days WHERE trail_id = ? AND name = ?",
        params![trail_id, name],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Reassign a trail's day numbers chronologically by earliest activity
/// start time.
pub fn renumber_days(conn: &Connection, trail_id: i64) -> Result<()> {
    conn.execute(
        "\
        UPDATE trail_days SET day_number = numbered.seq \
        FROM ( \
            SELECT d.id AS id, \
                   ROW_NUMBER() OVER (ORDER BY MIN(a.start_time), d.name) AS seq \
            FROM trail_days d \
            JOIN activities a ON a.trail_day_id = d.id \
            WHERE d.trail_id = ? \
            GROUP BY d.id \
        ) AS numbered \
        WHERE trail_days.id = numbered.id",
        params![trail_id],
    )?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct TrailInfo {
    pub name: String,
    pub days: i64,
    pub activities: i64,
}

#[derive(Debug, Serialize)]
pub struct ActivityInfo {
    pub id: i64,
    pub file: String,
    pub name: String,
    pub trail: String,
    pub day_number: u32,
    pub day_name: String,
    pub source_format: String,
    pub stats: TrackStats,
}

impl Database {
    pub fn trails(&self) -> Result<Vec<TrailInfo>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "\
            SELECT t.name, COUNT(DISTINCT d.id), COUNT(a.id) \
            FROM trails t \
            LEFT JOIN trail_days d ON d.trail_id = t.id \
            LEFT JOIN activities a ON a.trail_day_id = d.id \
            GROUP BY t.id \
            ORDER BY t.name",
        )?;

        let mut trails = vec![];
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            trails.push(TrailInfo {
                name: row.get_unwrap(0),
                days: row.get_unwrap(1),
                activities: row.get_unwrap(2),
            });
        }
        Ok(trails)
    }

    pub fn activities(&self, trail: Option<&str>) -> Result<Vec<ActivityInfo>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "\
            SELECT a.id, a.file, a.name, t.name, d.day_number, d.name, a.source_format, \
                   a.distance_km, a.elevation_gain_m, a.elevation_loss_m, a.duration_ms, \
                   a.moving_time_ms, a.avg_speed_kmh, a.start_time, a.end_time \
            FROM activities a \
            JOIN trail_days d ON d.id = a.trail_day_id \
            JOIN trails t ON t.id = d.trail_id \
            WHERE ?1 IS NULL OR t.name = ?1 \
            ORDER BY t.name, d.day_number, a.sort_order, a.id",
        )?;

        let mut activities = vec![];
        let mut rows = stmt.query(params![trail])?;
        while let Some(row) = rows.next()? {
            activities.push(ActivityInfo {
                id: row.get_unwrap(0),
                file: row.get_unwrap(1),
                name: row.get_unwrap(2),
                trail: row.get_unwrap(3),
                day_number: row.get_unwrap(4),
                day_name: row.get_unwrap(5),
                source_format: row.get_unwrap(6),
                stats: stats_from_row(row, 7)?,
            });
        }
        Ok(activities)
    }

    /// Flattened stats rows for a trail, optionally narrowed to one day.
    /// Aggregation happens in [`crate::stats::aggregate_stats`], not SQL.
    pub fn day_stats(&self, trail: &str, day: Option<u32>) -> Result<Vec<TrackStats>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "\
            SELECT a.distance_km, a.elevation_gain_m, a.elevation_loss_m, a.duration_ms, \
                   a.moving_time_ms, a.avg_speed_kmh, a.start_time, a.end_time \
            FROM activities a \
            JOIN trail_days d ON d.id = a.trail_day_id \
            JOIN trails t ON t.id = d.trail_id \
            WHERE t.name = ?1 AND (?2 IS NULL OR d.day_number = ?2) \
            ORDER BY d.day_number, a.sort_order, a.id",
        )?;

        let mut stats = vec![];
        let mut rows = stmt.query(params![trail, day])?;
        while let Some(row) = rows.next()? {
            stats.push(stats_from_row(row, 0)?);
        }
        Ok(stats)
    }

    pub fn activity_points(&self, activity_id: i64) -> Result<Vec<TrackPoint>> {
        let conn = self.connection()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT points FROM trackpoints WHERE activity_id = ?",
                params![activity_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(blob) = blob else {
            anyhow::bail!("no such activity: {}", activity_id);
        };
        decode_points(&blob)
    }

    /// Every `rate`-th point of an activity, by stored index. Kept points
    /// retain the indices they were stored with.
    pub fn activity_points_sampled(&self, activity_id: i64, rate: usize) -> Result<Vec<TrackPoint>> {
        let rate = rate.max(1);
        let points = self.activity_points(activity_id)?;
        Ok(points.into_iter().filter(|p| p.index % rate == 0).collect())
    }
}

fn stats_from_row(row: &rusqlite::Row, offset: usize) -> Result<TrackStats> {
    Ok(TrackStats {
        distance: row.get(offset)?,
        elevation_gain: row.get(offset + 1)?,
        elevation_loss: row.get(offset + 2)?,
        duration: row.get(offset + 3)?,
        moving_time: row.get(offset + 4)?,
        avg_speed: row.get(offset + 5)?,
        start_time: row.get(offset + 6)?,
        end_time: row.get(offset + 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::point;

    #[test]
    fn test_point_codec() {
        let points = vec![
            TrackPoint {
                lat: 47.1234,
                lon: 11.5678,
                elevation: 1234.5,
                timestamp: 1_689_314_400_000,
                index: 0,
                distance: 0.0,
            },
            TrackPoint {
                lat: 47.125,
                lon: 11.569,
                elevation: 1240.0,
                timestamp: 1_689_314_460_000,
                index: 1,
                distance: 0.19,
            },
        ];

        let encoded = encode_points(&points).unwrap();
        assert_eq!(encoded.len(), points.len() * 40);

        let decoded = decode_points(&encoded).unwrap();
        assert_eq!(decoded, points);
    }

    #[test]
    fn test_config_defaults_persisted() {
        let db = Database::memory().unwrap();
        let config = db.load_config().unwrap();
        assert_eq!(config.smoothing_window, DEFAULT_SMOOTHING_WINDOW);
        assert_eq!(config.chart_points, 500);

        db.save_config(&Config {
            smoothing_window: 9,
            chart_points: 250,
        })
        .unwrap();

        let config = db.load_config().unwrap();
        assert_eq!(config.smoothing_window, 9);
        assert_eq!(config.chart_points, 250);
    }

    #[test]
    fn test_trail_and_day_upserts_are_idempotent() {
        let db = Database::memory().unwrap();
        let conn = db.connection().unwrap();

        let a = upsert_trail(&conn, "gr20").unwrap();
        let b = upsert_trail(&conn, "gr20").unwrap();
        assert_eq!(a, b);

        let d1 = day_for_name(&conn, a, "2023-07-14").unwrap();
        let d2 = day_for_name(&conn, a, "2023-07-14").unwrap();
        let d3 = day_for_name(&conn, a, "2023-07-15").unwrap();
        assert_eq!(d1, d2);
        assert_ne!(d1, d3);
    }

    #[test]
    fn test_renumber_days_is_chronological() {
        let db = Database::memory().unwrap();
        let conn = db.connection().unwrap();

        let trail_id = upsert_trail(&conn, "gr20").unwrap();

        // Create the later day first so provisional numbering is backwards.
        let late = day_for_name(&conn, trail_id, "2023-07-15").unwrap();
        let early = day_for_name(&conn, trail_id, "2023-07-14").unwrap();

        for (day_id, start) in [(late, 2_000_000), (early, 1_000_000)] {
            conn.execute(
                "\
                INSERT INTO activities \
                    (trail_day_id, file, track_no, name, source_format, start_time, end_time) \
                VALUES (?, ?, 0, 'walk', 'gpx', ?, ?)",
                params![day_id, format!("f{day_id}.gpx"), start, start + 1000],
            )
            .unwrap();
        }

        renumber_days(&conn, trail_id).unwrap();

        let number = |id: i64| -> u32 {
            conn.query_row(
                "SELECT day_number FROM trail_days WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(number(early), 1);
        assert_eq!(number(late), 2);
    }

    #[test]
    fn test_sampled_points_stride() {
        let db = Database::memory().unwrap();
        let conn = db.connection().unwrap();

        let trail_id = upsert_trail(&conn, "gr20").unwrap();
        let day_id = day_for_name(&conn, trail_id, "2023-07-14").unwrap();
        conn.execute(
            "\
            INSERT INTO activities (id, trail_day_id, file, track_no, name, source_format) \
            VALUES (1, ?, 'f.gpx', 0, 'walk', 'gpx')",
            params![day_id],
        )
        .unwrap();

        let points: Vec<_> = (0..10)
            .map(|i| point(47.0 + i as f64 * 0.001, 11.0, 0.0, 1 + i as i64))
            .collect();
        let points = crate::track::resequence(points);
        conn.execute(
            "INSERT INTO trackpoints (activity_id, points) VALUES (1, ?)",
            params![encode_points(&points).unwrap()],
        )
        .unwrap();

        // Hand the single pooled connection back before querying.
        drop(conn);

        let sampled = db.activity_points_sampled(1, 3).unwrap();
        let indices: Vec<_> = sampled.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 3, 6, 9]);

        assert!(db.activity_points(42).is_err());
    }
}
