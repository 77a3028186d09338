//! Reconstruction parameters.
//!
//! Every struct uses `#[serde(default)]`, so a configuration file only needs
//! the fields it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Timestamp jump that forces a reset when reconstructing on a GPU.
pub const LARGE_SKIP_GPU_MS: i64 = 2000;

/// Timestamp jump that forces a reset on the slower CPU path.
pub const LARGE_SKIP_CPU_MS: i64 = 6000;

/// Errors from loading or validating parameters.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid parameter {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Compute device class for the reconstruction volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorType {
    #[default]
    Cpu,
    Gpu,
}

/// Which alignment strategy drives per-frame camera tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMethod {
    /// Point clouds when the pose database is enabled, depth-to-volume otherwise.
    #[default]
    Auto,
    PointClouds,
    DepthToVolume,
}

/// Reconstruction volume geometry and device selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeParams {
    pub voxels_per_meter: f32,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub resolution_z: u32,
    pub processor: ProcessorType,
    /// Device index; -1 picks the first suitable device.
    pub device_index: i32,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            voxels_per_meter: 256.0,
            resolution_x: 384,
            resolution_y: 384,
            resolution_z: 384,
            processor: ProcessorType::Cpu,
            device_index: -1,
        }
    }
}

impl VolumeParams {
    /// Total voxel count.
    pub fn voxel_count(&self) -> u64 {
        self.resolution_x as u64 * self.resolution_y as u64 * self.resolution_z as u64
    }
}

/// Camera tracking thresholds and reset policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParams {
    pub method: TrackingMethod,
    pub align_iterations: u32,
    pub max_align_to_volume_energy: f32,
    pub min_align_to_volume_energy: f32,
    pub max_align_point_clouds_energy: f32,
    pub min_align_point_clouds_energy: f32,
    /// Largest plausible camera translation between frames, in metres.
    pub max_translation_delta: f32,
    /// Largest plausible camera rotation between frames, in degrees.
    pub max_rotation_delta_degrees: f32,
    pub auto_reset_when_lost: bool,
    pub lost_frames_before_reset: u32,
    pub auto_reset_on_timestamp_skip: bool,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            method: TrackingMethod::Auto,
            align_iterations: 7,
            max_align_to_volume_energy: 0.27,
            min_align_to_volume_energy: 0.005,
            max_align_point_clouds_energy: 0.006,
            min_align_point_clouds_energy: 0.0,
            max_translation_delta: 0.3,
            max_rotation_delta_degrees: 20.0,
            auto_reset_when_lost: false,
            lost_frames_before_reset: 100,
            auto_reset_on_timestamp_skip: true,
        }
    }
}

/// Pose database used to relocalize after tracking loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseDatabaseParams {
    pub enabled: bool,
    /// Frames at least this far from every stored entry are added.
    pub accept_distance: f32,
    /// Relocalization gives up when the closest entry is at least this far.
    pub reject_distance: f32,
    pub max_history: usize,
    pub max_tests: usize,
    pub feature_samples: usize,
    /// Depth that maps to 1.0 in frame descriptors, in metres.
    pub max_descriptor_depth: f32,
    pub min_successful_frames: u32,
    pub min_frames_after_failure: u32,
    pub process_interval: u32,
}

impl Default for PoseDatabaseParams {
    fn default() -> Self {
        Self {
            enabled: false,
            accept_distance: 0.1,
            reject_distance: 1.0,
            max_history: 10_000,
            max_tests: 5,
            feature_samples: 1000,
            max_descriptor_depth: 4.0,
            min_successful_frames: 45,
            min_frames_after_failure: 200,
            process_interval: 5,
        }
    }
}

/// Periodic mesh export.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportParams {
    /// Output file; no periodic export when unset.
    pub path: Option<PathBuf>,
    /// Successfully processed frames between exports; 0 disables.
    pub frame_interval: u32,
}

/// Complete parameter set exchanged between the control thread and the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    pub near_mode: bool,
    pub mirror_depth: bool,
    pub capture_color: bool,
    pub pause_integration: bool,
    pub display_surface_normals: bool,
    /// Minimum depth in metres.
    pub min_depth: f32,
    /// Maximum depth in metres.
    pub max_depth: f32,
    pub max_integration_weight: u16,
    pub translate_reset_pose_by_min_depth: bool,
    pub color_integration_interval: u32,
    pub delta_frame_interval: u32,
    pub volume: VolumeParams,
    pub tracking: TrackingParams,
    pub pose_database: PoseDatabaseParams,
    pub export: ExportParams,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            near_mode: false,
            mirror_depth: false,
            capture_color: false,
            pause_integration: false,
            display_surface_normals: false,
            min_depth: 0.35,
            max_depth: 8.0,
            max_integration_weight: 200,
            translate_reset_pose_by_min_depth: true,
            color_integration_interval: 2,
            delta_frame_interval: 2,
            volume: VolumeParams::default(),
            tracking: TrackingParams::default(),
            pose_database: PoseDatabaseParams::default(),
            export: ExportParams::default(),
        }
    }
}

impl FusionParams {
    /// Load parameters from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse parameters from a JSON string and validate them.
    pub fn from_json_str(text: &str) -> Result<Self, ParamsError> {
        let params: Self = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String, ParamsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject parameter sets the worker cannot run with.
    pub fn validate(&self) -> Result<(), ParamsError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ParamsError> {
            Err(ParamsError::Invalid {
                field,
                reason: reason.into(),
            })
        }

        if !(self.min_depth >= 0.0 && self.min_depth < self.max_depth) {
            return invalid(
                "min_depth",
                format!("must be in [0, max_depth), got {} / {}", self.min_depth, self.max_depth),
            );
        }
        if self.color_integration_interval == 0 {
            return invalid("color_integration_interval", "must be at least 1");
        }
        if self.delta_frame_interval == 0 {
            return invalid("delta_frame_interval", "must be at least 1");
        }
        if self.max_integration_weight == 0 {
            return invalid("max_integration_weight", "must be at least 1");
        }
        if self.volume.voxel_count() == 0 {
            return invalid("volume", "voxel resolution must be non-zero on every axis");
        }
        if !(self.volume.voxels_per_meter > 0.0) {
            return invalid("volume.voxels_per_meter", "must be positive");
        }
        if self.tracking.lost_frames_before_reset == 0 {
            return invalid("tracking.lost_frames_before_reset", "must be at least 1");
        }
        if self.pose_database.enabled {
            if self.pose_database.max_history == 0 {
                return invalid("pose_database.max_history", "must be at least 1");
            }
            if self.pose_database.process_interval == 0 {
                return invalid("pose_database.process_interval", "must be at least 1");
            }
            if self.pose_database.feature_samples == 0 {
                return invalid("pose_database.feature_samples", "must be at least 1");
            }
        }
        Ok(())
    }

    /// Whether switching from `self` to `next` requires a new volume.
    pub fn volume_changed(&self, next: &FusionParams) -> bool {
        self.volume != next.volume || self.mirror_depth != next.mirror_depth
    }

    /// Timestamp jump treated as a stream discontinuity.
    pub fn large_skip_threshold_ms(&self) -> i64 {
        match self.volume.processor {
            ProcessorType::Gpu => LARGE_SKIP_GPU_MS,
            ProcessorType::Cpu => LARGE_SKIP_CPU_MS,
        }
    }

    /// Tracking method after resolving [`TrackingMethod::Auto`].
    pub fn effective_tracking_method(&self) -> TrackingMethod {
        match self.tracking.method {
            TrackingMethod::Auto if self.pose_database.enabled => TrackingMethod::PointClouds,
            TrackingMethod::Auto => TrackingMethod::DepthToVolume,
            method => method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        FusionParams::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params = FusionParams::from_json_str(
            r#"{ "capture_color": true, "volume": { "processor": "gpu" }, "export": { "path": "out.txt", "frame_interval": 50 } }"#,
        )
        .unwrap();
        assert!(params.capture_color);
        assert_eq!(params.volume.processor, ProcessorType::Gpu);
        assert_eq!(params.volume.resolution_x, 384);
        assert_eq!(params.export.frame_interval, 50);
        assert_eq!(params.large_skip_threshold_ms(), LARGE_SKIP_GPU_MS);
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let mut params = FusionParams::default();
        params.pose_database.enabled = true;
        std::fs::write(&path, params.to_json_string().unwrap()).unwrap();
        assert_eq!(FusionParams::from_json_file(&path).unwrap(), params);
    }

    #[test]
    fn test_invalid_depth_range() {
        let json = r#"{ "min_depth": 2.0, "max_depth": 1.0 }"#;
        assert!(matches!(
            FusionParams::from_json_str(json),
            Err(ParamsError::Invalid { field: "min_depth", .. })
        ));
    }

    #[test]
    fn test_volume_changed() {
        let a = FusionParams::default();
        let mut b = a.clone();
        b.capture_color = true;
        assert!(!a.volume_changed(&b));
        b.volume.voxels_per_meter = 128.0;
        assert!(a.volume_changed(&b));
        let mut c = a.clone();
        c.mirror_depth = true;
        assert!(a.volume_changed(&c));
    }

    #[test]
    fn test_auto_method_follows_pose_database() {
        let mut params = FusionParams::default();
        assert_eq!(params.effective_tracking_method(), TrackingMethod::DepthToVolume);
        params.pose_database.enabled = true;
        assert_eq!(params.effective_tracking_method(), TrackingMethod::PointClouds);
        params.tracking.method = TrackingMethod::DepthToVolume;
        assert_eq!(params.effective_tracking_method(), TrackingMethod::DepthToVolume);
    }
}
