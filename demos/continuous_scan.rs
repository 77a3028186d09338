//! Continuous scanning of a synthetic tabletop.
//!
//! Plays a looped recording through the processor, exporting a mesh every
//! 60 frames to the system temp directory.
//!
//! Run with: cargo run --example continuous_scan

use glam::Vec3;
use std::time::Duration;
use tangible_scan::capture::{PlaybackOptions, Recording, ReplayProvider, ReplaySensor};
use tangible_scan::fusion::{FusionParams, FusionProcessor, ProcessorEvent, StationaryEngine};
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let output = std::env::temp_dir().join("continuous_scan.txt");
    let mut params = FusionParams::default();
    params.export.path = Some(output.clone());
    params.export.frame_interval = 60;
    params.capture_color = true;

    let recording = Recording::synthetic_tabletop(160, 120, 45, 33, true)?;
    let (sensor, feed) = ReplaySensor::new(recording.geometry());
    let (provider, _devices) = ReplayProvider::with_sensor(sensor);
    let (mut processor, events) =
        FusionProcessor::new(Box::new(StationaryEngine::new()), Box::new(provider), params)?;
    processor.start()?;

    let mut playback = feed.spawn_playback(
        recording,
        PlaybackOptions {
            looped: true,
            ..PlaybackOptions::default()
        },
    );

    let mut exports = 0;
    while exports < 3 {
        match events.recv_timeout(Duration::from_secs(5)) {
            Ok(ProcessorEvent::MeshExported(summary)) => {
                exports += 1;
                info!(
                    "Export {}: {} vertices in {}",
                    exports,
                    summary.written_vertices,
                    summary.path.display()
                );
            }
            Ok(ProcessorEvent::ExportFailed(reason)) => warn!("Export failed: {}", reason),
            Ok(_) => {}
            Err(e) => {
                warn!("No export within 5 s: {}", e);
                break;
            }
        }
    }

    let pushed = playback.stop();
    let vertices = processor.calculate_mesh()?;
    let (min, max) = vertices
        .iter()
        .fold((Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    info!(
        "Pushed {} frames; current reconstruction has {} vertices spanning {:?} to {:?}",
        pushed,
        vertices.len(),
        min,
        max
    );
    processor.stop()?;
    Ok(())
}
