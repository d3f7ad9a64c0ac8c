//! HelixTrack benchmark CLI.
//!
//! Generates deterministic events, runs the full tracking and V0 passes and
//! reports efficiency, fake rate and V0 yield.

use clap::Parser;
use helixtrack_core::{Geometry, MaterialConfig, Tracker, TrackerConfig, V0Config};
use helixtrack_sim::{EventConfig, EventGenerator, RunReport};
use nalgebra::Vector3;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "helixtrack-sim", about = "Deterministic tracking benchmark")]
struct Args {
    /// Master seed for the event stream
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of events to process
    #[arg(long, default_value_t = 20)]
    events: usize,

    /// Primary tracks per event
    #[arg(long, default_value_t = 12)]
    tracks: usize,

    /// Displaced pairs per event
    #[arg(long, default_value_t = 1)]
    v0_pairs: usize,

    /// Optional tracker configuration as JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter (tracing env-filter syntax)
    #[arg(long, default_value = "info")]
    log: String,
}

fn load_tracker_config(path: &PathBuf) -> Result<TrackerConfig, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| e.to_string())
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let tracker_config = match &args.config {
        Some(path) => match load_tracker_config(path) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, path = %path.display(), "failed to load tracker config");
                std::process::exit(1);
            }
        },
        None => TrackerConfig::default(),
    };
    let min_clusters = tracker_config.min_clusters as usize;
    let b_field = tracker_config.b_field;

    let geometry = Geometry::default_barrel();
    let mut tracker = Tracker::new(
        geometry.clone(),
        &MaterialConfig::default(),
        tracker_config,
        V0Config::default(),
    );

    let event_config = EventConfig {
        n_tracks: args.tracks,
        n_v0_pairs: args.v0_pairs,
        ..EventConfig::default()
    };
    let mut generator = EventGenerator::new(geometry, event_config, b_field, args.seed);

    let mut report = RunReport::default();
    for event_id in 0..args.events {
        let event = generator.generate();
        let summary = match tracker.load_clusters(&event.streams) {
            Ok(summary) => summary,
            Err(err) => {
                error!(%err, event_id, "cluster load failed");
                std::process::exit(1);
            }
        };
        let results = tracker.find_tracks(&event.seeds, Vector3::zeros());
        let v0s = tracker.find_vertices(&event.seeds, Vector3::zeros());
        report.record(&event, &results, &v0s, min_clusters);
        info!(
            event_id,
            clusters = summary.loaded,
            seeds = event.seeds.len(),
            reconstructed = results.iter().filter(|r| r.reconstructed).count(),
            v0s = v0s.len(),
            "event processed"
        );
    }

    info!(
        events = report.events,
        findable = report.findable,
        reconstructed = report.reconstructed,
        efficiency = format!("{:.3}", report.efficiency()),
        fake_rate = format!("{:.3}", report.fake_rate()),
        v0_generated = report.v0_generated,
        v0_found = report.v0_found,
        v0_good = report.v0_good,
        "run finished"
    );
}
