//! Conversions from working buffers to displayable RGBA images.
//!
//! All functions write into an existing image and only reallocate it when
//! the size differs.

use crate::engine::{DepthFloatFrame, PointCloudFrame, ResidualFrame};
use image::{Rgba, RgbaImage};

/// Metres covered by one cycle of the depth gray ramp.
const DEPTH_RAMP_METERS: f32 = 4.0;

fn fit(out: &mut RgbaImage, width: u32, height: u32) {
    if out.dimensions() != (width, height) {
        *out = RgbaImage::new(width, height);
    }
}

fn depth_gray(z: f32) -> Rgba<u8> {
    if z <= 0.0 {
        return Rgba([0, 0, 0, 255]);
    }
    let v = ((z * 256.0 / DEPTH_RAMP_METERS) as u32 % 256) as u8;
    Rgba([v, v, v, 255])
}

/// Gray ramp of thresholded depth; invalid pixels are black.
pub fn depth_to_rgba(depth: &DepthFloatFrame, out: &mut RgbaImage) {
    fit(out, depth.width, depth.height);
    for (pixel, z) in out.pixels_mut().zip(&depth.data) {
        *pixel = depth_gray(*z);
    }
}

/// Gray ramp of raycast depth, shown while tracking is lost.
pub fn raycast_depth_to_rgba(cloud: &PointCloudFrame, out: &mut RgbaImage) {
    fit(out, cloud.width, cloud.height);
    for (pixel, p) in out.pixels_mut().zip(&cloud.points) {
        *pixel = depth_gray(p.z);
    }
}

/// Shaded raycast: normals mapped to RGB, or gray Lambert shading with a
/// light at the camera.
pub fn shade_surface(cloud: &PointCloudFrame, show_normals: bool, out: &mut RgbaImage) {
    fit(out, cloud.width, cloud.height);
    for (pixel, n) in out.pixels_mut().zip(&cloud.normals) {
        *pixel = if *n == glam::Vec3::ZERO {
            Rgba([0, 0, 0, 255])
        } else if show_normals {
            let c = (*n * 0.5 + 0.5) * 255.0;
            Rgba([c.x as u8, c.y as u8, c.z as u8, 255])
        } else {
            let v = (n.z.abs() * 255.0) as u8;
            Rgba([v, v, v, 255])
        };
    }
}

/// Residuals from green (good fit) to red (bad fit); black where unknown.
pub fn residuals_to_rgba(residuals: &ResidualFrame, out: &mut RgbaImage) {
    fit(out, residuals.width, residuals.height);
    for (pixel, r) in out.pixels_mut().zip(&residuals.data) {
        *pixel = if r.is_nan() {
            Rgba([0, 0, 0, 255])
        } else {
            let r = r.clamp(0.0, 1.0);
            Rgba([(255.0 * r) as u8, (255.0 * (1.0 - r)) as u8, 0, 255])
        };
    }
}

/// Copy `src` into `out`, reusing `out`'s allocation when sizes match.
pub fn copy_rgba(src: &RgbaImage, out: &mut RgbaImage) {
    fit(out, src.width(), src.height());
    out.copy_from_slice(src);
}
