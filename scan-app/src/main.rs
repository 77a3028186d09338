//! Tangible Scan
//!
//! Command-line front end for the reconstruction pipeline.
//!
//! Features:
//! - Replays a recorded `depth_NNNNN.png` / `color_NNNNN.png` directory
//! - Falls back to a synthetic tabletop when no recording is given
//! - Periodic and final mesh export
//! - Status and frame-rate logging from published frames

mod app;

use clap::Parser;
use std::path::PathBuf;

/// Tangible Scan - depth sensor reconstruction with tracking recovery
#[derive(Parser, Debug)]
#[command(name = "tangible-scan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Recording directory to replay
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Mesh output file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON parameter file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export the mesh and reset the volume every N processed frames
    #[arg(long)]
    export_frames: Option<u32>,

    /// Playback frame rate
    #[arg(long, default_value_t = 30.0)]
    fps: f32,

    /// Restart the recording when it ends
    #[arg(long)]
    loop_playback: bool,

    /// Request the GPU reconstruction device
    #[arg(long)]
    gpu: bool,

    /// Enable the sensor's near range mode
    #[arg(long)]
    near_mode: bool,

    /// Integrate color into the reconstruction
    #[arg(long)]
    capture_color: bool,

    /// Keep a pose database for relocalization after tracking loss
    #[arg(long)]
    pose_database: bool,

    /// Export the mesh once more when playback ends
    #[arg(long)]
    final_mesh: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let config = app::ScanConfig {
        replay: args.replay,
        output: args.output,
        params_file: args.config,
        export_frames: args.export_frames,
        fps: args.fps,
        loop_playback: args.loop_playback,
        gpu: args.gpu,
        near_mode: args.near_mode,
        capture_color: args.capture_color,
        pose_database: args.pose_database,
        final_mesh: args.final_mesh,
        log_level: args.log_level,
    };

    if let Err(e) = app::run(config) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}
