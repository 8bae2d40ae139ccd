use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use crate::activity::Manifest;
use crate::db::Database;
use crate::track::LatLng;

mod activity;
mod chart;
mod db;
mod nearest;
mod simplify;
mod stats;
mod track;

#[derive(Parser)]
#[command(name = "waymark", version, about = "GPS trail journal: import GPX/FIT recordings, compute trip stats, render track geometry")]
struct Cli {
    /// Path to the sqlite database
    #[arg(long, default_value = "waymark.sqlite3")]
    db: PathBuf,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import recordings from a directory (or single file) into a trail
    Import {
        path: PathBuf,

        /// Trail to file the imported activities under
        #[arg(long, default_value = "imported")]
        trail: String,

        /// CSV with per-file day/title overrides
        #[arg(long)]
        join: Option<PathBuf>,
    },

    /// List trails
    Trails,

    /// List activities
    Activities {
        #[arg(long)]
        trail: Option<String>,

        /// Print only the number of activities
        #[arg(long)]
        count: bool,
    },

    /// Aggregate stats over a trail or a single day, as JSON
    Stats {
        #[arg(long)]
        trail: String,

        #[arg(long)]
        day: Option<u32>,
    },

    /// Print an activity's polyline simplified for a map zoom level
    Render {
        activity: i64,

        #[arg(long)]
        zoom: f64,
    },

    /// Print an activity's elevation profile, downsampled for charting
    Chart {
        activity: i64,

        /// Point budget (defaults to the configured chart_points)
        #[arg(long)]
        points: Option<usize>,
    },

    /// Find the track point nearest to a coordinate or a distance mark
    Locate {
        activity: i64,

        /// Coordinate as "lat,lon"
        #[arg(long)]
        at: Option<LatLng>,

        /// Distance from the start, in km
        #[arg(long)]
        km: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // Logs go to stderr; stdout is reserved for command output.
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Import { path, trail, join } => {
            let db = Database::new(&cli.db)?;
            let manifest = match join {
                Some(csv) => Manifest::from_csv(&csv)?,
                None => Manifest::default(),
            };
            activity::import_path(&path, &db, &trail, &manifest)?;
        }

        Commands::Trails => {
            let db = Database::open(&cli.db)?;
            for trail in db.trails()? {
                println!("{}\t{} days\t{} activities", trail.name, trail.days, trail.activities);
            }
        }

        Commands::Activities { trail, count } => {
            let db = Database::open(&cli.db)?;
            let activities = db.activities(trail.as_deref())?;

            if count {
                println!("{}", activities.len());
            } else {
                for a in activities {
                    println!(
                        "{}\t{}\tday {}\t{}\t{:.2}km\t{}",
                        a.id, a.trail, a.day_number, a.name, a.stats.distance, a.file
                    );
                }
            }
        }

        Commands::Stats { trail, day } => {
            let db = Database::open(&cli.db)?;
            let per_activity = db.day_stats(&trail, day)?;
            let total = stats::aggregate_stats(&per_activity);
            println!("{}", serde_json::to_string_pretty(&total)?);
        }

        Commands::Render { activity, zoom } => {
            let db = Database::open(&cli.db)?;
            let points = db.activity_points(activity)?;
            let simplified = simplify::simplify_for_zoom(&points, zoom);

            tracing::info!(
                input = points.len(),
                output = simplified.len(),
                zoom,
                "simplified track"
            );

            let coords: Vec<[f64; 2]> = simplified.iter().map(|p| [p.lon, p.lat]).collect();
            println!("{}", serde_json::to_string(&coords)?);
        }

        Commands::Chart { activity, points } => {
            let db = Database::open(&cli.db)?;
            let budget = match points {
                Some(n) => n,
                None => db.load_config()?.chart_points,
            };

            let track = db.activity_points(activity)?;
            let sampled = chart::downsample_for_chart(&track, budget);

            let profile: Vec<[f64; 2]> = sampled.iter().map(|p| [p.distance, p.elevation]).collect();
            println!("{}", serde_json::to_string(&profile)?);
        }

        Commands::Locate { activity, at, km } => {
            let db = Database::open(&cli.db)?;
            let points = db.activity_points(activity)?;

            let found = match (at, km) {
                (Some(coord), None) => nearest::find_nearest_point(&points, coord.lat, coord.lon),
                (None, Some(target)) => nearest::find_point_by_distance(&points, target),
                _ => anyhow::bail!("pass exactly one of --at or --km"),
            };

            let Some(found) = found else {
                anyhow::bail!("activity has no points");
            };
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
    }

    Ok(())
}
