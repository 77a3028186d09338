//! Scan session setup and the main monitoring loop.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use scan_capture::{PlaybackOptions, Recording, ReplayProvider, ReplaySensor};
use scan_fusion::{
    FusionParams, FusionProcessor, ProcessorEvent, ProcessorType, StationaryEngine,
};
use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Frame interval used when playback runs unthrottled.
const DEFAULT_FRAME_INTERVAL_MS: i64 = 33;

/// Time without new frames after playback ends before the session closes.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one scan session needs.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub replay: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub params_file: Option<PathBuf>,
    pub export_frames: Option<u32>,
    pub fps: f32,
    pub loop_playback: bool,
    pub gpu: bool,
    pub near_mode: bool,
    pub capture_color: bool,
    pub pose_database: bool,
    pub final_mesh: bool,
    pub log_level: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            replay: None,
            output: None,
            params_file: None,
            export_frames: None,
            fps: 30.0,
            loop_playback: false,
            gpu: false,
            near_mode: false,
            capture_color: false,
            pose_database: false,
            final_mesh: false,
            log_level: "info".to_string(),
        }
    }
}

impl ScanConfig {
    /// Parameters from the JSON file (or defaults) with flags applied.
    pub fn fusion_params(&self) -> Result<FusionParams, Box<dyn Error>> {
        let mut params = match &self.params_file {
            Some(path) => FusionParams::from_json_file(path)?,
            None => FusionParams::default(),
        };

        if let Some(output) = &self.output {
            params.export.path = Some(output.clone());
        }
        if let Some(frames) = self.export_frames {
            params.export.frame_interval = frames;
        }
        if self.gpu {
            params.volume.processor = ProcessorType::Gpu;
        }
        params.near_mode |= self.near_mode;
        params.capture_color |= self.capture_color;
        params.pose_database.enabled |= self.pose_database;

        params.validate()?;
        Ok(params)
    }

    fn frame_interval_ms(&self) -> i64 {
        if self.fps > 0.0 {
            (1000.0 / self.fps).round() as i64
        } else {
            DEFAULT_FRAME_INTERVAL_MS
        }
    }

    fn playback_options(&self) -> PlaybackOptions {
        PlaybackOptions {
            fps: self.fps,
            looped: self.loop_playback,
            ..PlaybackOptions::default()
        }
    }
}

fn init_logging(level: &str) {
    #[cfg(feature = "tracy")]
    {
        use tracing_subscriber::Layer;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::registry()
            .with(tracing_tracy::TracyLayer::default())
            .with(
                tracing_subscriber::fmt::layer().with_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
                ),
            )
            .init();
    }

    #[cfg(not(feature = "tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
            )
            .with_target(false)
            .init();
    }
}

/// Run one scan session to the end of playback.
pub fn run(config: ScanConfig) -> Result<(), Box<dyn Error>> {
    init_logging(&config.log_level);
    info!("Starting tangible-scan v{}", env!("CARGO_PKG_VERSION"));

    let params = config.fusion_params()?;
    let recording = match &config.replay {
        Some(dir) => Recording::load_dir(dir, config.frame_interval_ms())?,
        None => {
            info!("No recording given, scanning a synthetic tabletop");
            Recording::synthetic_tabletop(160, 120, 150, config.frame_interval_ms(), true)?
        }
    };

    let (sensor, feed) = ReplaySensor::new(recording.geometry());
    let (provider, _devices) = ReplayProvider::with_sensor(sensor);
    let (mut processor, events) =
        FusionProcessor::new(Box::new(StationaryEngine::new()), Box::new(provider), params)?;
    processor.start()?;

    let mut playback = feed.spawn_playback(recording, config.playback_options());
    let exports = monitor(&processor, &events, || playback.is_finished());
    let pushed = playback.stop();
    info!("Replayed {} frames, {} periodic exports", pushed, exports);

    if config.final_mesh {
        match &config.output {
            Some(path) => {
                let summary = processor.export_mesh(path)?;
                info!(
                    "Final mesh: {} vertices written to {}",
                    summary.written_vertices,
                    summary.path.display()
                );
            }
            None => warn!("--final-mesh needs --output, skipping"),
        }
    }

    processor.stop()?;
    Ok(())
}

/// Log progress until playback has ended and the worker went quiet.
/// Returns the number of periodic exports.
fn monitor(
    processor: &FusionProcessor,
    events: &Receiver<ProcessorEvent>,
    playback_finished: impl Fn() -> bool,
) -> usize {
    let mut exports = 0;
    let mut last_report = Instant::now();
    let mut last_status = String::new();

    loop {
        let timeout = if playback_finished() {
            DRAIN_TIMEOUT
        } else {
            REPORT_INTERVAL
        };
        match events.recv_timeout(timeout) {
            Ok(ProcessorEvent::FrameReady) => {}
            Ok(ProcessorEvent::SensorStatus(status)) => info!("Sensor: {}", status),
            Ok(ProcessorEvent::MeshExported(summary)) => {
                exports += 1;
                info!(
                    "Exported {} vertices to {}",
                    summary.written_vertices,
                    summary.path.display()
                );
            }
            Ok(ProcessorEvent::ExportFailed(reason)) => warn!("Export failed: {}", reason),
            Err(RecvTimeoutError::Timeout) if playback_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            let frame = processor.lock_frame();
            info!(
                "{} frames, {:.1} fps, {}",
                frame.total_frames, frame.frames_per_second, frame.tracking_state
            );
            if frame.status != last_status {
                last_status.clone_from(&frame.status);
                if !last_status.is_empty() {
                    info!("Status: {}", last_status);
                }
            }
        }
    }
    exports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_params_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.json");
        std::fs::write(&file, r#"{ "max_depth": 3.0, "export": { "frame_interval": 10 } }"#)
            .unwrap();

        let config = ScanConfig {
            params_file: Some(file),
            output: Some(dir.path().join("mesh.txt")),
            export_frames: Some(50),
            gpu: true,
            pose_database: true,
            ..ScanConfig::default()
        };
        let params = config.fusion_params().unwrap();
        assert_eq!(params.max_depth, 3.0);
        assert_eq!(params.export.frame_interval, 50);
        assert_eq!(params.export.path, Some(dir.path().join("mesh.txt")));
        assert_eq!(params.volume.processor, ProcessorType::Gpu);
        assert!(params.pose_database.enabled);
        assert!(!params.capture_color);
    }

    #[test]
    fn test_invalid_params_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.json");
        std::fs::write(&file, r#"{ "min_depth": 4.0, "max_depth": 1.0 }"#).unwrap();

        let config = ScanConfig {
            params_file: Some(file),
            ..ScanConfig::default()
        };
        assert!(config.fusion_params().is_err());
    }

    #[test]
    fn test_frame_interval_from_fps() {
        let mut config = ScanConfig::default();
        assert_eq!(config.frame_interval_ms(), 33);
        config.fps = 0.0;
        assert_eq!(config.frame_interval_ms(), DEFAULT_FRAME_INTERVAL_MS);
        config.fps = 10.0;
        assert_eq!(config.frame_interval_ms(), 100);
    }
}
