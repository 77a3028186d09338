//! Reconstruction engine interface.
//!
//! The orchestrator drives volumetric reconstruction through two traits:
//! [`ReconstructionEngine`] for stateless image operations and device
//! queries, and [`ReconstructionVolume`] for one reconstruction volume.
//! All calls are synchronous and are only issued from the worker thread,
//! or from the control thread while holding the volume lock.

mod stationary;

pub use stationary::{SensorIntrinsics, StationaryEngine};

use crate::params::{ProcessorType, VolumeParams};
use glam::{Mat4, Vec3};
use image::RgbaImage;
use scan_capture::DepthImage;
use thiserror::Error;

/// Rigid world-to-camera transform.
pub type Pose = Mat4;

/// Errors reported by a reconstruction engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No compatible compute device: {0}")]
    DeviceUnavailable(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Alignment ran but did not converge.
    #[error("Camera tracking did not converge")]
    TrackingFailed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine call failed: {0}")]
    CallFailed(String),
}

/// Compute device description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub description: String,
    /// Memory available to the volume, in kilobytes.
    pub memory_kb: u64,
    pub processor: ProcessorType,
}

/// Result of an alignment call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// Refined world-to-camera pose.
    pub pose: Pose,
    /// Normalized residual energy; lower is better.
    pub energy: f32,
}

/// Depth in metres per pixel, 0 where there is no valid reading.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DepthFloatFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DepthFloatFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width * height) as usize],
        }
    }

    /// Depth at pixel (x, y).
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    /// Number of pixels with a valid depth.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|d| **d > 0.0).count()
    }
}

/// Camera-space points and normals laid out as an image.
///
/// Pixels without a surface hold a zero point.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointCloudFrame {
    pub width: u32,
    pub height: u32,
    pub points: Vec<Vec3>,
    pub normals: Vec<Vec3>,
}

impl PointCloudFrame {
    pub fn new(width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Self {
            width,
            height,
            points: vec![Vec3::ZERO; n],
            normals: vec![Vec3::ZERO; n],
        }
    }

    /// Whether pixel `index` holds a surface point.
    pub fn is_valid(&self, index: usize) -> bool {
        self.points[index].z > 0.0
    }

    /// Clear every pixel to "no surface".
    pub fn clear(&mut self) {
        self.points.fill(Vec3::ZERO);
        self.normals.fill(Vec3::ZERO);
    }
}

/// Per-pixel alignment residuals in [0, 1]; NaN where no comparison was possible.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResidualFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl ResidualFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![f32::NAN; (width * height) as usize],
        }
    }
}

/// Device-level operations that do not need a volume.
pub trait ReconstructionEngine: Send {
    /// Describe the device that `processor` / `device_index` selects.
    fn device_info(&self, processor: ProcessorType, device_index: i32)
    -> Result<DeviceInfo, EngineError>;

    /// Create a volume with the camera at `world_to_camera`.
    fn create_volume(
        &mut self,
        params: &VolumeParams,
        world_to_camera: &Pose,
    ) -> Result<Box<dyn ReconstructionVolume>, EngineError>;

    /// Convert millimetre depth to metres, zeroing values outside
    /// `[min_depth, max_depth]`.
    fn depth_to_float(
        &self,
        raw: &DepthImage,
        min_depth: f32,
        max_depth: f32,
        mirror: bool,
        out: &mut DepthFloatFrame,
    ) -> Result<(), EngineError>;

    /// Back-project a depth frame into a camera-space point cloud.
    fn depth_to_point_cloud(
        &self,
        depth: &DepthFloatFrame,
        out: &mut PointCloudFrame,
    ) -> Result<(), EngineError>;

    /// Align `observed` onto `reference` starting from `initial`.
    fn align_point_clouds(
        &self,
        reference: &PointCloudFrame,
        observed: &PointCloudFrame,
        iterations: u32,
        initial: &Pose,
        residuals: Option<&mut ResidualFrame>,
    ) -> Result<Alignment, EngineError>;
}

/// One reconstruction volume.
pub trait ReconstructionVolume: Send {
    /// Clear the volume and place the camera at `world_to_camera`.
    ///
    /// With `world_to_volume` set, the volume origin moves as well.
    fn reset(
        &mut self,
        world_to_camera: &Pose,
        world_to_volume: Option<&Mat4>,
    ) -> Result<(), EngineError>;

    /// Current world-to-volume transform.
    fn world_to_volume(&self) -> Mat4;

    /// Align a depth frame against the reconstruction.
    fn align_depth_to_volume(
        &mut self,
        depth: &DepthFloatFrame,
        iterations: u32,
        initial: &Pose,
        residuals: Option<&mut ResidualFrame>,
    ) -> Result<Alignment, EngineError>;

    /// Fuse a depth frame (and optionally depth-aligned color) at `world_to_camera`.
    fn integrate(
        &mut self,
        depth: &DepthFloatFrame,
        color: Option<&RgbaImage>,
        max_weight: u16,
        world_to_camera: &Pose,
    ) -> Result<(), EngineError>;

    /// Render the surface seen from `world_to_camera` into `cloud`, and its
    /// color into `color` when given.
    fn raycast(
        &mut self,
        world_to_camera: &Pose,
        cloud: &mut PointCloudFrame,
        color: Option<&mut RgbaImage>,
    ) -> Result<(), EngineError>;

    /// Triangle-soup vertices of the reconstructed surface in world space.
    fn calculate_mesh(&mut self) -> Result<Vec<Vec3>, EngineError>;
}
