//! Common sensor types and traits.

use crossbeam_channel::{Receiver, Sender};
use image::{ImageBuffer, Luma, RgbaImage};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to capture frame: {0}")]
    CaptureFailed(String),

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Stream ended")]
    StreamEnded,

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw depth image, one millimetre value per pixel (0 = no reading).
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// A depth frame from a sensor.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    /// Depth in millimetres.
    pub image: DepthImage,
    /// Device timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Frame number.
    pub frame_number: u64,
}

impl DepthFrame {
    /// Create a new depth frame.
    pub fn new(image: DepthImage, timestamp_ms: i64, frame_number: u64) -> Self {
        Self {
            image,
            timestamp_ms,
            frame_number,
        }
    }

    /// Get image dimensions (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// A color frame from a sensor.
#[derive(Debug, Clone)]
pub struct ColorFrame {
    /// RGBA image data.
    pub image: RgbaImage,
    /// Device timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Frame number.
    pub frame_number: u64,
}

impl ColorFrame {
    /// Create a new color frame.
    pub fn new(image: RgbaImage, timestamp_ms: i64, frame_number: u64) -> Self {
        Self {
            image,
            timestamp_ms,
            frame_number,
        }
    }

    /// Get image dimensions (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Fixed per-session stream resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub depth_width: u32,
    pub depth_height: u32,
    pub color_width: u32,
    pub color_height: u32,
}

impl StreamGeometry {
    /// Same resolution for depth and color.
    pub fn uniform(width: u32, height: u32) -> Self {
        Self {
            depth_width: width,
            depth_height: height,
            color_width: width,
            color_height: height,
        }
    }
}

impl Default for StreamGeometry {
    fn default() -> Self {
        Self::uniform(640, 480)
    }
}

/// Device status as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorStatus {
    Connected,
    NotConnected,
    Initializing,
    InUseByOther,
    NotPowered,
    Error(String),
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorStatus::Connected => write!(f, "Sensor connected"),
            SensorStatus::NotConnected => write!(f, "No ready sensor found"),
            SensorStatus::Initializing => write!(f, "Sensor is initializing"),
            SensorStatus::InUseByOther => {
                write!(f, "Sensor is in use by another application")
            }
            SensorStatus::NotPowered => write!(f, "Sensor is not powered"),
            SensorStatus::Error(msg) => write!(f, "Sensor error: {}", msg),
        }
    }
}

/// A change observed by a [`SensorProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorChange {
    /// Nothing new since the last poll.
    Unchanged,
    /// A device became available and can be connected.
    SensorAvailable,
    /// The connected device went away.
    SensorLost,
    /// Status changed without a device becoming usable.
    Status(SensorStatus),
}

/// A connected depth/color device.
///
/// Fetches are blocking with a timeout. Availability is signalled through
/// the channel returned by [`DepthSensor::frame_signal`]; the queue state
/// itself is read with the `*_pending` methods.
pub trait DepthSensor: Send {
    /// Stream resolutions for this session.
    fn geometry(&self) -> StreamGeometry;

    /// Receives a token whenever a new depth frame arrives.
    fn frame_signal(&self) -> Receiver<()>;

    /// Whether a depth frame can be fetched without blocking.
    fn depth_pending(&self) -> bool;

    /// Whether a color frame can be fetched without blocking.
    fn color_pending(&self) -> bool;

    /// Fetch the next depth frame.
    fn next_depth(&mut self, timeout: Duration) -> Result<DepthFrame, CaptureError>;

    /// Fetch the next color frame.
    fn next_color(&mut self, timeout: Duration) -> Result<ColorFrame, CaptureError>;

    /// Switch the depth range mode.
    fn set_near_mode(&mut self, near: bool) -> Result<(), CaptureError>;

    /// Release device resources.
    fn shutdown(&mut self);
}

/// Device discovery and status reporting.
pub trait SensorProvider: Send {
    /// Register a channel that receives a token on every status change.
    fn watch(&mut self, notify: Sender<()>);

    /// Take the oldest unobserved change.
    fn poll_change(&mut self) -> SensorChange;

    /// Open the first available device.
    fn connect(&mut self) -> Result<Box<dyn DepthSensor>, CaptureError>;

    /// Try to take over a device held by another application.
    ///
    /// Returns true when the conflict was resolved.
    fn resolve_conflict(&mut self) -> bool;

    /// Current device status.
    fn status(&self) -> SensorStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_geometry() {
        let g = StreamGeometry::uniform(320, 240);
        assert_eq!(g.depth_width, g.color_width);
        assert_eq!(g.depth_height, 240);
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(SensorStatus::NotConnected.to_string(), "No ready sensor found");
        assert!(
            SensorStatus::Error("usb reset".to_string())
                .to_string()
                .contains("usb reset")
        );
    }

    #[test]
    fn test_depth_frame_dimensions() {
        let frame = DepthFrame::new(DepthImage::new(4, 3), 33, 1);
        assert_eq!(frame.dimensions(), (4, 3));
    }
}
