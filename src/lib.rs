//! Tangible Scan
//!
//! Streaming depth-sensor reconstruction with tracking recovery and mesh
//! export. This crate re-exports the workspace members:
//!
//! - [`capture`]: sensors, recorded-sequence replay and color registration
//! - [`data`]: vertex ordering and lock-file guarded mesh export
//! - [`fusion`]: the frame-processing orchestrator and its control surface
//!
//! ## Example
//!
//! ```ignore
//! use tangible_scan::capture::{PlaybackOptions, Recording, ReplayProvider, ReplaySensor};
//! use tangible_scan::fusion::{FusionParams, FusionProcessor, StationaryEngine};
//!
//! let recording = Recording::synthetic_tabletop(160, 120, 90, 33, true)?;
//! let (sensor, feed) = ReplaySensor::new(recording.geometry());
//! let (provider, _devices) = ReplayProvider::with_sensor(sensor);
//! let (mut processor, events) = FusionProcessor::new(
//!     Box::new(StationaryEngine::new()),
//!     Box::new(provider),
//!     FusionParams::default(),
//! )?;
//! processor.start()?;
//! feed.spawn_playback(recording, PlaybackOptions::default()).join();
//! ```

pub use scan_capture as capture;
pub use scan_data as data;
pub use scan_fusion as fusion;

pub use scan_fusion::{FusionError, FusionParams, FusionProcessor, ProcessorEvent, PublishedFrame};
