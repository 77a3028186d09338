//! Recorded depth/color sequences.
//!
//! A recording directory holds `depth_00000.png`, `depth_00001.png`, ...
//! (16-bit grayscale, millimetres) and optionally `color_00000.png`, ...
//! with matching indices. Frames are numbered contiguously from zero.

use crate::source::{CaptureError, DepthImage, StreamGeometry};
use image::{Luma, Rgba, RgbaImage};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One recorded frame pair.
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    /// Depth in millimetres.
    pub depth: DepthImage,
    /// Color, when it was captured.
    pub color: Option<RgbaImage>,
    /// Timestamp relative to the start of the recording.
    pub timestamp_ms: i64,
}

/// An in-memory recorded sequence with a fixed geometry.
#[derive(Debug, Clone)]
pub struct Recording {
    frames: Vec<RecordedFrame>,
    geometry: StreamGeometry,
}

impl Recording {
    /// Build a recording, checking that every frame shares one geometry.
    pub fn new(frames: Vec<RecordedFrame>) -> Result<Self, CaptureError> {
        let first = frames
            .first()
            .ok_or_else(|| CaptureError::UnsupportedFormat("recording has no frames".to_string()))?;
        let (depth_width, depth_height) = first.depth.dimensions();
        let (color_width, color_height) = frames
            .iter()
            .find_map(|f| f.color.as_ref().map(|c| c.dimensions()))
            .unwrap_or((depth_width, depth_height));

        for (i, frame) in frames.iter().enumerate() {
            if frame.depth.dimensions() != (depth_width, depth_height) {
                return Err(CaptureError::UnsupportedFormat(format!(
                    "depth frame {} is {:?}, expected {}x{}",
                    i,
                    frame.depth.dimensions(),
                    depth_width,
                    depth_height
                )));
            }
            if let Some(color) = &frame.color {
                if color.dimensions() != (color_width, color_height) {
                    return Err(CaptureError::UnsupportedFormat(format!(
                        "color frame {} is {:?}, expected {}x{}",
                        i,
                        color.dimensions(),
                        color_width,
                        color_height
                    )));
                }
            }
        }

        Ok(Self {
            frames,
            geometry: StreamGeometry {
                depth_width,
                depth_height,
                color_width,
                color_height,
            },
        })
    }

    /// Load `depth_NNNNN.png` / `color_NNNNN.png` pairs from a directory.
    ///
    /// Timestamps are synthesised as `index * frame_interval_ms`.
    #[tracing::instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn load_dir(dir: impl AsRef<Path>, frame_interval_ms: i64) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CaptureError::DeviceNotFound(format!(
                "recording directory {} does not exist",
                dir.display()
            )));
        }

        let mut frames = Vec::new();
        loop {
            let index = frames.len();
            let depth_path = frame_path(dir, "depth", index);
            if !depth_path.exists() {
                break;
            }

            let depth = image::open(&depth_path)?.into_luma16();
            let color_path = frame_path(dir, "color", index);
            let color = if color_path.exists() {
                Some(image::open(&color_path)?.into_rgba8())
            } else {
                None
            };
            debug!("Loaded frame {} (color: {})", index, color.is_some());

            frames.push(RecordedFrame {
                depth,
                color,
                timestamp_ms: index as i64 * frame_interval_ms,
            });
        }

        if frames.is_empty() {
            return Err(CaptureError::DeviceNotFound(format!(
                "no depth_00000.png in {}",
                dir.display()
            )));
        }

        let recording = Self::new(frames)?;
        info!(
            "Loaded recording: {} frames, depth {}x{}",
            recording.len(),
            recording.geometry.depth_width,
            recording.geometry.depth_height
        );
        Ok(recording)
    }

    /// Write the recording in the layout read by [`Recording::load_dir`].
    pub fn save_dir(&self, dir: impl AsRef<Path>) -> Result<(), CaptureError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        for (index, frame) in self.frames.iter().enumerate() {
            frame.depth.save(frame_path(dir, "depth", index))?;
            if let Some(color) = &frame.color {
                color.save(frame_path(dir, "color", index))?;
            }
        }
        Ok(())
    }

    /// A synthetic tabletop seen from above: a flat surface with a raised
    /// block in the middle. Every frame is identical apart from its timestamp.
    pub fn synthetic_tabletop(
        width: u32,
        height: u32,
        frame_count: usize,
        frame_interval_ms: i64,
        with_color: bool,
    ) -> Result<Self, CaptureError> {
        let depth = DepthImage::from_fn(width, height, |x, y| {
            let in_block = x > width / 3 && x < 2 * width / 3 && y > height / 3 && y < 2 * height / 3;
            Luma([if in_block { 850 } else { 1000 }])
        });
        let color = with_color.then(|| {
            RgbaImage::from_fn(width, height, |x, y| {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                Rgba([r, g, 128, 255])
            })
        });

        let frames = (0..frame_count)
            .map(|i| RecordedFrame {
                depth: depth.clone(),
                color: color.clone(),
                timestamp_ms: i as i64 * frame_interval_ms,
            })
            .collect();
        Self::new(frames)
    }

    /// Recorded frames in order.
    pub fn frames(&self) -> &[RecordedFrame] {
        &self.frames
    }

    /// Stream geometry shared by every frame.
    pub fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether there are no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Time from the first to the last frame.
    pub fn duration_ms(&self) -> i64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
            _ => 0,
        }
    }
}

fn frame_path(dir: &Path, kind: &str, index: usize) -> PathBuf {
    dir.join(format!("{}_{:05}.png", kind, index))
}
