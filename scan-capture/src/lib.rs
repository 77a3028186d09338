//! Scan Capture - Depth and color sensor streams
//!
//! This crate defines the sensor side of the reconstruction pipeline:
//!
//! - [`DepthSensor`]: a connected device with a depth stream and a color stream
//! - [`SensorProvider`]: device discovery and attach/detach/conflict reporting
//! - [`ReplaySensor`]: plays back recorded depth/color sequences
//! - [`align_color_to_depth`]: registers a color frame into depth image space
//!
//! ## Example
//!
//! ```ignore
//! use scan_capture::{PlaybackOptions, Recording, ReplayProvider, ReplaySensor};
//!
//! let recording = Recording::load_dir("captures/desk", 33)?;
//! let (sensor, feed) = ReplaySensor::new(recording.geometry());
//! let (provider, handle) = ReplayProvider::new();
//! handle.attach(sensor);
//! feed.spawn_playback(recording, PlaybackOptions::default());
//! ```

mod registration;
mod replay;
mod sequence;
mod source;

pub use registration::align_color_to_depth;
pub use replay::{Playback, PlaybackOptions, ProviderHandle, ReplayFeed, ReplayProvider, ReplaySensor};
pub use sequence::{RecordedFrame, Recording};
pub use source::{
    CaptureError, ColorFrame, DepthFrame, DepthImage, DepthSensor, SensorChange, SensorProvider,
    SensorStatus, StreamGeometry,
};
