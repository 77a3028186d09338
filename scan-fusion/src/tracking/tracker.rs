//! Interchangeable per-frame camera tracking strategies.

use crate::buffers::FrameBuffers;
use crate::engine::{Alignment, EngineError, Pose, ReconstructionEngine, ReconstructionVolume};
use crate::params::{TrackingMethod, TrackingParams};
use thiserror::Error;

/// Why a frame did not track.
#[derive(Debug, Error)]
pub enum TrackFailure {
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("Residual energy {0} above threshold")]
    EnergyTooHigh(f32),

    /// Exactly zero energy only happens when the engine skipped the alignment.
    #[error("Alignment reported zero residual energy")]
    ZeroEnergy,

    #[error("Camera moved {translation:.3} m / {rotation_degrees:.1} deg in one frame")]
    DeltaTooLarge {
        translation: f32,
        rotation_degrees: f32,
    },
}

impl TrackFailure {
    /// The engine call itself failed, as opposed to the camera being lost.
    pub fn is_call_failure(&self) -> bool {
        matches!(self, TrackFailure::Engine(e) if !matches!(e, EngineError::TrackingFailed))
    }
}

/// One way of estimating the camera pose for the current frame.
///
/// Inputs are the converted depth in `buffers.depth_float` and the previous
/// pose; the result is the new pose and its residual energy.
pub trait CameraTracker {
    fn track(
        &self,
        engine: &dyn ReconstructionEngine,
        volume: &mut dyn ReconstructionVolume,
        buffers: &mut FrameBuffers,
        previous: &Pose,
        successful_frames: u32,
        want_residuals: bool,
    ) -> Result<Alignment, TrackFailure>;
}

/// Aligns the frame's point cloud to a raycast of the volume.
#[derive(Debug, Clone)]
pub struct PointCloudTracker {
    pub iterations: u32,
    pub max_energy: f32,
    pub max_translation: f32,
    pub max_rotation_degrees: f32,
}

impl CameraTracker for PointCloudTracker {
    fn track(
        &self,
        engine: &dyn ReconstructionEngine,
        volume: &mut dyn ReconstructionVolume,
        buffers: &mut FrameBuffers,
        previous: &Pose,
        _successful_frames: u32,
        want_residuals: bool,
    ) -> Result<Alignment, TrackFailure> {
        engine.depth_to_point_cloud(&buffers.depth_float, &mut buffers.depth_cloud)?;
        volume.raycast(previous, &mut buffers.raycast_cloud, None)?;

        let residuals = want_residuals.then_some(&mut buffers.residuals);
        let alignment = engine.align_point_clouds(
            &buffers.raycast_cloud,
            &buffers.depth_cloud,
            self.iterations,
            previous,
            residuals,
        )?;

        if alignment.energy.is_nan() || alignment.energy > self.max_energy {
            return Err(TrackFailure::EnergyTooHigh(alignment.energy));
        }

        let (translation, rotation_degrees) = pose_delta(previous, &alignment.pose);
        if translation > self.max_translation || rotation_degrees > self.max_rotation_degrees {
            return Err(TrackFailure::DeltaTooLarge {
                translation,
                rotation_degrees,
            });
        }
        Ok(alignment)
    }
}

/// Aligns the frame's depth directly against the volume.
#[derive(Debug, Clone)]
pub struct VolumeTracker {
    pub iterations: u32,
    pub max_energy: f32,
}

impl CameraTracker for VolumeTracker {
    fn track(
        &self,
        _engine: &dyn ReconstructionEngine,
        volume: &mut dyn ReconstructionVolume,
        buffers: &mut FrameBuffers,
        previous: &Pose,
        successful_frames: u32,
        want_residuals: bool,
    ) -> Result<Alignment, TrackFailure> {
        let residuals = want_residuals.then_some(&mut buffers.residuals);
        let alignment =
            volume.align_depth_to_volume(&buffers.depth_float, self.iterations, previous, residuals)?;

        if alignment.energy.is_nan() || alignment.energy > self.max_energy {
            return Err(TrackFailure::EnergyTooHigh(alignment.energy));
        }
        if alignment.energy == 0.0 && successful_frames > 1 {
            return Err(TrackFailure::ZeroEnergy);
        }
        Ok(alignment)
    }
}

/// The tracker for a resolved (non-`Auto`) tracking method.
pub fn select_tracker(method: TrackingMethod, params: &TrackingParams) -> Box<dyn CameraTracker> {
    match method {
        TrackingMethod::PointClouds => Box::new(PointCloudTracker {
            iterations: params.align_iterations,
            max_energy: params.max_align_point_clouds_energy,
            max_translation: params.max_translation_delta,
            max_rotation_degrees: params.max_rotation_delta_degrees,
        }),
        TrackingMethod::DepthToVolume | TrackingMethod::Auto => Box::new(VolumeTracker {
            iterations: params.align_iterations,
            max_energy: params.max_align_to_volume_energy,
        }),
    }
}

/// Translation length and rotation angle between two poses.
fn pose_delta(previous: &Pose, current: &Pose) -> (f32, f32) {
    let relative = *current * previous.inverse();
    let translation = relative.w_axis.truncate().length();
    let trace = relative.x_axis.x + relative.y_axis.y + relative.z_axis.z;
    let angle = ((trace - 1.0) / 2.0).clamp(-1.0, 1.0).acos();
    (translation, angle.to_degrees())
}
