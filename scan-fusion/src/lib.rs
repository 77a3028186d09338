//! Scan Fusion Crate
//!
//! The frame-processing orchestrator of the scanner. A single worker thread
//! pulls depth (and color) frames from a sensor, tracks the camera against
//! the reconstruction volume, fuses the frame in, and publishes display
//! images and status for a consumer on another thread.
//!
//! ## Modules
//!
//! - [`engine`]: the reconstruction engine seam and a CPU reference engine
//! - [`params`]: the complete parameter set, its defaults and validation
//! - [`staging`]: double-buffered parameter exchange with the control thread
//! - [`resync`]: depth/color timestamp pairing and stream resynchronization
//! - [`tracking`]: tracking state machine, trackers and relocalization
//! - [`pose_db`]: bounded store of past poses keyed by frame descriptors
//! - [`publisher`]: the single-slot published frame and consumer events
//! - [`visualize`]: conversion of working buffers to RGBA images
//! - [`processor`]: the control surface that owns the worker thread

pub mod buffers;
pub mod engine;
pub mod error;
pub mod params;
pub mod pose_db;
pub mod processor;
pub mod publisher;
pub mod resync;
pub mod staging;
pub mod timer;
pub mod tracking;
pub mod visualize;
mod worker;

#[cfg(test)]
mod test_support;

pub use engine::{
    Alignment, DepthFloatFrame, DeviceInfo, EngineError, PointCloudFrame, Pose,
    ReconstructionEngine, ReconstructionVolume, ResidualFrame, SensorIntrinsics, StationaryEngine,
};
pub use error::FusionError;
pub use params::{
    ExportParams, FusionParams, ParamsError, PoseDatabaseParams, ProcessorType, TrackingMethod,
    TrackingParams, VolumeParams,
};
pub use processor::FusionProcessor;
pub use publisher::{FrameGuard, ProcessorEvent, PublishedFrame};
pub use tracking::TrackingState;
pub use worker::{FPS_INTERVAL_SECS, RENDER_INTERVAL_SECS};
