//! Scripted engine doubles for unit tests.

use crate::engine::{
    Alignment, DepthFloatFrame, DeviceInfo, EngineError, PointCloudFrame, Pose,
    ReconstructionEngine, ReconstructionVolume, ResidualFrame,
};
use crate::params::{ProcessorType, VolumeParams};
use glam::{Mat4, Vec3};
use image::RgbaImage;
use parking_lot::Mutex;
use scan_capture::DepthImage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

type Script = VecDeque<Result<Alignment, EngineError>>;

fn next_alignment(script: &mut Script) -> Result<Alignment, EngineError> {
    script.pop_front().unwrap_or(Err(EngineError::TrackingFailed))
}

/// Engine whose point-cloud alignments are replayed from a script.
#[derive(Default)]
pub struct ScriptedEngine {
    alignments: Mutex<Script>,
    /// Raycasts issued on every volume this engine created.
    raycasts: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn with_alignments(alignments: Vec<Result<Alignment, EngineError>>) -> Self {
        Self {
            alignments: Mutex::new(alignments.into()),
            ..Self::default()
        }
    }

    pub fn raycast_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.raycasts)
    }
}

impl ReconstructionEngine for ScriptedEngine {
    fn device_info(
        &self,
        processor: ProcessorType,
        _device_index: i32,
    ) -> Result<DeviceInfo, EngineError> {
        Ok(DeviceInfo {
            description: "scripted".to_string(),
            memory_kb: 0,
            processor,
        })
    }

    fn create_volume(
        &mut self,
        _params: &VolumeParams,
        _world_to_camera: &Pose,
    ) -> Result<Box<dyn ReconstructionVolume>, EngineError> {
        Ok(Box::new(ScriptedVolume {
            raycasts: Arc::clone(&self.raycasts),
            ..ScriptedVolume::default()
        }))
    }

    fn depth_to_float(
        &self,
        raw: &DepthImage,
        _min_depth: f32,
        _max_depth: f32,
        _mirror: bool,
        out: &mut DepthFloatFrame,
    ) -> Result<(), EngineError> {
        *out = DepthFloatFrame::new(raw.width(), raw.height());
        Ok(())
    }

    fn depth_to_point_cloud(
        &self,
        depth: &DepthFloatFrame,
        out: &mut PointCloudFrame,
    ) -> Result<(), EngineError> {
        *out = PointCloudFrame::new(depth.width, depth.height);
        Ok(())
    }

    fn align_point_clouds(
        &self,
        _reference: &PointCloudFrame,
        _observed: &PointCloudFrame,
        _iterations: u32,
        _initial: &Pose,
        _residuals: Option<&mut ResidualFrame>,
    ) -> Result<Alignment, EngineError> {
        next_alignment(&mut self.alignments.lock())
    }
}

/// Volume whose depth-to-volume alignments are replayed from a script.
#[derive(Default)]
pub struct ScriptedVolume {
    alignments: Script,
    raycasts: Arc<AtomicUsize>,
}

impl ScriptedVolume {
    pub fn with_alignments(alignments: Vec<Result<Alignment, EngineError>>) -> Self {
        Self {
            alignments: alignments.into(),
            ..Self::default()
        }
    }

    pub fn raycasts(&self) -> usize {
        self.raycasts.load(Ordering::SeqCst)
    }
}

impl ReconstructionVolume for ScriptedVolume {
    fn reset(
        &mut self,
        _world_to_camera: &Pose,
        _world_to_volume: Option<&Mat4>,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn world_to_volume(&self) -> Mat4 {
        Mat4::IDENTITY
    }

    fn align_depth_to_volume(
        &mut self,
        _depth: &DepthFloatFrame,
        _iterations: u32,
        _initial: &Pose,
        _residuals: Option<&mut ResidualFrame>,
    ) -> Result<Alignment, EngineError> {
        next_alignment(&mut self.alignments)
    }

    fn integrate(
        &mut self,
        _depth: &DepthFloatFrame,
        _color: Option<&RgbaImage>,
        _max_weight: u16,
        _world_to_camera: &Pose,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn raycast(
        &mut self,
        _world_to_camera: &Pose,
        _cloud: &mut PointCloudFrame,
        _color: Option<&mut RgbaImage>,
    ) -> Result<(), EngineError> {
        self.raycasts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn calculate_mesh(&mut self) -> Result<Vec<Vec3>, EngineError> {
        Ok(Vec::new())
    }
}
