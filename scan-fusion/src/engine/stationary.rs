//! CPU reference engine for a fixed-mount sensor.
//!
//! Built for scanning setups where the sensor hangs above a table and never
//! moves: alignment keeps the initial pose and only scores how well the new
//! depth frame agrees with the model. Surfaces are stored as a sparse set of
//! weighted voxels, each holding the mean of the samples that landed in it,
//! and rendered by splatting those samples back into the image.

use super::{
    Alignment, DepthFloatFrame, DeviceInfo, EngineError, PointCloudFrame, Pose,
    ReconstructionEngine, ReconstructionVolume, ResidualFrame,
};
use crate::params::{ProcessorType, VolumeParams};
use glam::{IVec3, Mat4, Vec3};
use image::{Rgba, RgbaImage};
use scan_capture::DepthImage;
use std::collections::HashMap;
use tracing::{debug, info};

/// Depth difference at which a pixel's residual saturates, in metres.
const RESIDUAL_TRUNCATION: f32 = 0.1;

/// Pinhole intrinsics normalized by image width and height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorIntrinsics {
    pub focal_x: f32,
    pub focal_y: f32,
    pub principal_x: f32,
    pub principal_y: f32,
}

impl SensorIntrinsics {
    /// Nominal depth camera intrinsics of a structured-light sensor.
    pub const NOMINAL: Self = Self {
        focal_x: 1.1535,
        focal_y: 1.5437,
        principal_x: 0.5,
        principal_y: 0.5,
    };

    fn for_size(&self, width: u32, height: u32) -> PixelIntrinsics {
        PixelIntrinsics {
            fx: self.focal_x * width as f32,
            fy: self.focal_y * height as f32,
            cx: self.principal_x * width as f32,
            cy: self.principal_y * height as f32,
        }
    }
}

impl Default for SensorIntrinsics {
    fn default() -> Self {
        Self::NOMINAL
    }
}

#[derive(Debug, Clone, Copy)]
struct PixelIntrinsics {
    fx: f32,
    fy: f32,
    cx: f32,
    cy: f32,
}

impl PixelIntrinsics {
    fn back_project(&self, x: u32, y: u32, z: f32) -> Vec3 {
        Vec3::new(
            (x as f32 - self.cx) / self.fx * z,
            (y as f32 - self.cy) / self.fy * z,
            z,
        )
    }

    fn project(&self, p: Vec3) -> (i32, i32) {
        (
            (self.fx * p.x / p.z + self.cx).round() as i32,
            (self.fy * p.y / p.z + self.cy).round() as i32,
        )
    }
}

/// Reference engine for a sensor that stays where the volume was reset.
#[derive(Debug, Clone)]
pub struct StationaryEngine {
    intrinsics: SensorIntrinsics,
    voxel_budget: u64,
    memory_kb: u64,
}

impl StationaryEngine {
    pub fn new() -> Self {
        Self {
            intrinsics: SensorIntrinsics::NOMINAL,
            voxel_budget: 512 * 512 * 512,
            memory_kb: 4 * 1024 * 1024,
        }
    }

    /// Use different camera intrinsics.
    pub fn with_intrinsics(mut self, intrinsics: SensorIntrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    /// Largest volume, in voxels, that [`create_volume`](ReconstructionEngine::create_volume) accepts.
    pub fn with_voxel_budget(mut self, voxels: u64) -> Self {
        self.voxel_budget = voxels;
        self
    }
}

impl Default for StationaryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconstructionEngine for StationaryEngine {
    fn device_info(
        &self,
        processor: ProcessorType,
        device_index: i32,
    ) -> Result<DeviceInfo, EngineError> {
        match processor {
            ProcessorType::Cpu if device_index <= 0 => Ok(DeviceInfo {
                description: "Stationary CPU reference engine".to_string(),
                memory_kb: self.memory_kb,
                processor,
            }),
            ProcessorType::Cpu => Err(EngineError::DeviceUnavailable(format!(
                "CPU device index {} does not exist",
                device_index
            ))),
            ProcessorType::Gpu => Err(EngineError::DeviceUnavailable(
                "the stationary engine has no GPU backend".to_string(),
            )),
        }
    }

    fn create_volume(
        &mut self,
        params: &VolumeParams,
        world_to_camera: &Pose,
    ) -> Result<Box<dyn ReconstructionVolume>, EngineError> {
        let voxels = params.voxel_count();
        if voxels > self.voxel_budget {
            return Err(EngineError::OutOfMemory(format!(
                "{} voxels requested, budget is {}",
                voxels, self.voxel_budget
            )));
        }

        info!(
            "Creating {}x{}x{} volume at {} voxels/m",
            params.resolution_x, params.resolution_y, params.resolution_z, params.voxels_per_meter
        );
        let mut volume = StationaryVolume::new(params, self.intrinsics);
        volume.reset(world_to_camera, None)?;
        Ok(Box::new(volume))
    }

    fn depth_to_float(
        &self,
        raw: &DepthImage,
        min_depth: f32,
        max_depth: f32,
        mirror: bool,
        out: &mut DepthFloatFrame,
    ) -> Result<(), EngineError> {
        let (width, height) = raw.dimensions();
        if out.width != width || out.height != height {
            *out = DepthFloatFrame::new(width, height);
        }

        for (x, y, pixel) in raw.enumerate_pixels() {
            let meters = pixel.0[0] as f32 / 1000.0;
            let value = if meters >= min_depth && meters <= max_depth {
                meters
            } else {
                0.0
            };
            let dest_x = if mirror { width - 1 - x } else { x };
            out.data[(y * width + dest_x) as usize] = value;
        }
        Ok(())
    }

    fn depth_to_point_cloud(
        &self,
        depth: &DepthFloatFrame,
        out: &mut PointCloudFrame,
    ) -> Result<(), EngineError> {
        if out.width != depth.width || out.height != depth.height {
            *out = PointCloudFrame::new(depth.width, depth.height);
        }
        let k = self.intrinsics.for_size(depth.width, depth.height);

        for y in 0..depth.height {
            for x in 0..depth.width {
                let i = (y * depth.width + x) as usize;
                let z = depth.data[i];
                out.points[i] = if z > 0.0 {
                    k.back_project(x, y, z)
                } else {
                    Vec3::ZERO
                };
            }
        }
        compute_normals(out);
        Ok(())
    }

    fn align_point_clouds(
        &self,
        reference: &PointCloudFrame,
        observed: &PointCloudFrame,
        _iterations: u32,
        initial: &Pose,
        residuals: Option<&mut ResidualFrame>,
    ) -> Result<Alignment, EngineError> {
        if reference.width != observed.width || reference.height != observed.height {
            return Err(EngineError::InvalidArgument(format!(
                "point cloud sizes differ: {}x{} vs {}x{}",
                reference.width, reference.height, observed.width, observed.height
            )));
        }

        let pairs = reference
            .points
            .iter()
            .zip(&observed.points)
            .map(|(r, o)| (r.z, o.z));
        let energy = residual_energy(pairs, observed.width, observed.height, true, residuals)
            .ok_or(EngineError::TrackingFailed)?;

        Ok(Alignment {
            pose: *initial,
            energy,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    weight: u16,
    /// Weighted mean of the world-space samples that fell into the voxel.
    point: Vec3,
    color: Option<[u8; 4]>,
}

/// Which position stands in for a voxel when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Surface {
    /// Fused sample positions.
    Fused,
    /// Voxel centres, i.e. the surface as the grid quantizes it.
    Quantized,
}

/// Sparse voxel volume owned by a [`StationaryEngine`].
struct StationaryVolume {
    intrinsics: SensorIntrinsics,
    resolution: IVec3,
    voxel_size: f32,
    default_world_to_volume: Mat4,
    world_to_volume: Mat4,
    cells: HashMap<IVec3, Cell>,
    scratch: PointCloudFrame,
}

impl StationaryVolume {
    fn new(params: &VolumeParams, intrinsics: SensorIntrinsics) -> Self {
        let resolution = IVec3::new(
            params.resolution_x as i32,
            params.resolution_y as i32,
            params.resolution_z as i32,
        );
        // Camera at the centre of the volume's front face, looking along +Z.
        let default_world_to_volume = Mat4::from_translation(Vec3::new(
            resolution.x as f32 / 2.0,
            resolution.y as f32 / 2.0,
            0.0,
        )) * Mat4::from_scale(Vec3::splat(params.voxels_per_meter));

        Self {
            intrinsics,
            resolution,
            voxel_size: 1.0 / params.voxels_per_meter,
            default_world_to_volume,
            world_to_volume: default_world_to_volume,
            cells: HashMap::new(),
            scratch: PointCloudFrame::default(),
        }
    }

    fn voxel_index(&self, world: Vec3) -> Option<IVec3> {
        let v = self.world_to_volume.transform_point3(world).floor();
        let index = IVec3::new(v.x as i32, v.y as i32, v.z as i32);
        (index.cmpge(IVec3::ZERO).all() && index.cmplt(self.resolution).all()).then_some(index)
    }

    fn render(
        &self,
        world_to_camera: &Pose,
        surface: Surface,
        cloud: &mut PointCloudFrame,
        mut color: Option<&mut RgbaImage>,
    ) {
        cloud.clear();
        if let Some(image) = color.as_deref_mut() {
            if image.dimensions() != (cloud.width, cloud.height) {
                *image = RgbaImage::new(cloud.width, cloud.height);
            } else {
                image.fill(0);
            }
        }

        let k = self.intrinsics.for_size(cloud.width, cloud.height);
        let volume_to_camera = *world_to_camera * self.world_to_volume.inverse();
        let (width, height) = (cloud.width as i32, cloud.height as i32);

        for (index, cell) in &self.cells {
            let p = match surface {
                Surface::Fused => world_to_camera.transform_point3(cell.point),
                Surface::Quantized => {
                    volume_to_camera.transform_point3(index.as_vec3() + Vec3::splat(0.5))
                }
            };
            if p.z <= 0.0 {
                continue;
            }
            let (u, v) = k.project(p);
            let radius = (0.5 * self.voxel_size * k.fx / p.z).floor().max(0.0) as i32;

            for py in (v - radius)..=(v + radius) {
                for px in (u - radius)..=(u + radius) {
                    if px < 0 || py < 0 || px >= width || py >= height {
                        continue;
                    }
                    let i = (py * width + px) as usize;
                    if cloud.is_valid(i) && cloud.points[i].z <= p.z {
                        continue;
                    }
                    cloud.points[i] = p;
                    if let (Some(image), Some(rgba)) = (color.as_deref_mut(), cell.color) {
                        image.put_pixel(px as u32, py as u32, Rgba(rgba));
                    }
                }
            }
        }
        compute_normals(cloud);
    }
}

impl ReconstructionVolume for StationaryVolume {
    fn reset(
        &mut self,
        _world_to_camera: &Pose,
        world_to_volume: Option<&Mat4>,
    ) -> Result<(), EngineError> {
        self.cells.clear();
        self.world_to_volume = world_to_volume
            .copied()
            .unwrap_or(self.default_world_to_volume);
        debug!("Volume reset");
        Ok(())
    }

    fn world_to_volume(&self) -> Mat4 {
        self.world_to_volume
    }

    fn align_depth_to_volume(
        &mut self,
        depth: &DepthFloatFrame,
        _iterations: u32,
        initial: &Pose,
        residuals: Option<&mut ResidualFrame>,
    ) -> Result<Alignment, EngineError> {
        let mut model = std::mem::take(&mut self.scratch);
        if model.width != depth.width || model.height != depth.height {
            model = PointCloudFrame::new(depth.width, depth.height);
        }
        self.render(initial, Surface::Quantized, &mut model, None);

        let pairs = model.points.iter().zip(&depth.data).map(|(m, d)| (m.z, *d));
        let energy = residual_energy(pairs, depth.width, depth.height, false, residuals);
        self.scratch = model;

        Ok(Alignment {
            pose: *initial,
            energy: energy.ok_or(EngineError::TrackingFailed)?,
        })
    }

    fn integrate(
        &mut self,
        depth: &DepthFloatFrame,
        color: Option<&RgbaImage>,
        max_weight: u16,
        world_to_camera: &Pose,
    ) -> Result<(), EngineError> {
        let color = color.filter(|c| c.dimensions() == (depth.width, depth.height));
        let k = self.intrinsics.for_size(depth.width, depth.height);
        let camera_to_world = world_to_camera.inverse();

        for y in 0..depth.height {
            for x in 0..depth.width {
                let z = depth.get(x, y);
                if z <= 0.0 {
                    continue;
                }
                let world = camera_to_world.transform_point3(k.back_project(x, y, z));
                let Some(index) = self.voxel_index(world) else {
                    continue;
                };
                let cell = self.cells.entry(index).or_default();
                let w = cell.weight as f32;
                cell.point = (cell.point * w + world) / (w + 1.0);
                cell.weight = cell.weight.saturating_add(1).min(max_weight);
                if let Some(image) = color {
                    cell.color = Some(image.get_pixel(x, y).0);
                }
            }
        }
        Ok(())
    }

    fn raycast(
        &mut self,
        world_to_camera: &Pose,
        cloud: &mut PointCloudFrame,
        color: Option<&mut RgbaImage>,
    ) -> Result<(), EngineError> {
        if cloud.width == 0 || cloud.height == 0 {
            return Err(EngineError::InvalidArgument(
                "raycast target has no pixels".to_string(),
            ));
        }
        self.render(world_to_camera, Surface::Fused, cloud, color);
        Ok(())
    }

    fn calculate_mesh(&mut self) -> Result<Vec<Vec3>, EngineError> {
        let volume_to_world = self.world_to_volume.inverse();
        let mut vertices = Vec::with_capacity(self.cells.len() * 6);

        // One camera-facing quad per voxel; neighbouring quads share corners.
        for index in self.cells.keys() {
            let o = index.as_vec3();
            let corners = [
                o,
                o + Vec3::X,
                o + Vec3::X + Vec3::Y,
                o + Vec3::Y,
            ]
            .map(|c| volume_to_world.transform_point3(c));
            vertices.extend_from_slice(&[
                corners[0], corners[1], corners[2], corners[0], corners[2], corners[3],
            ]);
        }
        Ok(vertices)
    }
}

fn compute_normals(cloud: &mut PointCloudFrame) {
    let (width, height) = (cloud.width as usize, cloud.height as usize);
    for y in 0..height {
        for x in 0..width {
            let i = y * width + x;
            cloud.normals[i] = Vec3::ZERO;
            if x + 1 >= width || y + 1 >= height || !cloud.is_valid(i) {
                continue;
            }
            let (right, down) = (i + 1, i + width);
            if !cloud.is_valid(right) || !cloud.is_valid(down) {
                continue;
            }
            let p = cloud.points[i];
            let n = (cloud.points[right] - p)
                .cross(cloud.points[down] - p)
                .normalize_or_zero();
            // Face the camera.
            cloud.normals[i] = if n.dot(p) > 0.0 { -n } else { n };
        }
    }
}

/// Mean per-pixel residual over pixels with an observation.
///
/// Pairs are (model depth, observed depth) with 0 meaning "no data". An
/// observation without model surface counts as a full mismatch.
fn residual_energy(
    pairs: impl Iterator<Item = (f32, f32)>,
    width: u32,
    height: u32,
    squared: bool,
    mut residuals: Option<&mut ResidualFrame>,
) -> Option<f32> {
    if let Some(frame) = residuals.as_deref_mut() {
        if frame.width != width || frame.height != height {
            *frame = ResidualFrame::new(width, height);
        }
    }

    let mut total = 0.0f64;
    let mut count = 0usize;
    for (i, (model, observed)) in pairs.enumerate() {
        let r = if observed <= 0.0 {
            f32::NAN
        } else if model <= 0.0 {
            1.0
        } else {
            ((observed - model).abs() / RESIDUAL_TRUNCATION).min(1.0)
        };
        if let Some(frame) = residuals.as_deref_mut() {
            frame.data[i] = r;
        }
        if !r.is_nan() {
            total += if squared { (r * r) as f64 } else { r as f64 };
            count += 1;
        }
    }
    (count > 0).then(|| (total / count as f64) as f32)
}
