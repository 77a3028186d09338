//! Per-frame working images owned by the worker.

use crate::engine::{DepthFloatFrame, PointCloudFrame, ResidualFrame};
use image::RgbaImage;
use tracing::debug;

/// Scratch frames reused across iterations.
///
/// Reallocated only when the depth geometry changes.
#[derive(Debug, Default)]
pub struct FrameBuffers {
    pub width: u32,
    pub height: u32,
    pub depth_float: DepthFloatFrame,
    pub depth_cloud: PointCloudFrame,
    pub raycast_cloud: PointCloudFrame,
    pub raycast_color: RgbaImage,
    pub residuals: ResidualFrame,
    /// Color resampled onto the depth grid.
    pub aligned_color: RgbaImage,
}

impl FrameBuffers {
    /// Make every buffer `width` x `height`. Returns whether anything was reallocated.
    pub fn ensure(&mut self, width: u32, height: u32) -> bool {
        if self.width == width && self.height == height {
            return false;
        }
        debug!("Allocating frame buffers for {}x{}", width, height);
        *self = Self {
            width,
            height,
            depth_float: DepthFloatFrame::new(width, height),
            depth_cloud: PointCloudFrame::new(width, height),
            raycast_cloud: PointCloudFrame::new(width, height),
            raycast_color: RgbaImage::new(width, height),
            residuals: ResidualFrame::new(width, height),
            aligned_color: RgbaImage::new(width, height),
        };
        true
    }
}
