//! Bounded pose database for relocalization.
//!
//! Stores (pose, descriptor) pairs for frames that tracked well and were
//! sufficiently different from everything already stored. After tracking
//! loss, the closest stored descriptors propose poses to re-align from.

use crate::engine::{DepthFloatFrame, Pose};
use image::RgbaImage;
use std::collections::{TryReserveError, VecDeque};
use tracing::debug;

/// Compact appearance signature of one frame.
///
/// Samples a fixed grid of normalized image locations. Depth is always
/// sampled, scaled into [0, 1]; luminance is sampled on the same grid when
/// color is available and is only compared when both sides carry it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameDescriptor {
    depth: Vec<f32>,
    luminance: Option<Vec<f32>>,
}

impl FrameDescriptor {
    /// Depth-only descriptor from already normalized samples.
    pub fn from_values(depth: Vec<f32>) -> Self {
        Self {
            depth,
            luminance: None,
        }
    }

    pub fn with_luminance(mut self, luminance: Vec<f32>) -> Self {
        self.luminance = Some(luminance);
        self
    }

    /// Sample `samples` grid points of `depth` (and `color`, if it has the
    /// same size).
    pub fn from_frame(
        depth: &DepthFloatFrame,
        color: Option<&RgbaImage>,
        samples: usize,
        max_depth: f32,
    ) -> Self {
        if depth.width == 0 || depth.height == 0 || samples == 0 {
            return Self::default();
        }
        let color = color.filter(|c| c.dimensions() == (depth.width, depth.height));

        // Grid with the image aspect ratio and roughly `samples` cells.
        let aspect = depth.width as f32 / depth.height as f32;
        let rows = ((samples as f32 / aspect).sqrt().round() as u32).clamp(1, depth.height);
        let cols = ((samples as u32).div_ceil(rows)).clamp(1, depth.width);

        let cells = (rows * cols) as usize;
        let mut depth_values = Vec::with_capacity(cells);
        let mut luminance = color.map(|_| Vec::with_capacity(cells));
        for r in 0..rows {
            let y = ((r as f32 + 0.5) / rows as f32 * depth.height as f32) as u32;
            for c in 0..cols {
                let x = ((c as f32 + 0.5) / cols as f32 * depth.width as f32) as u32;
                depth_values.push((depth.get(x, y) / max_depth).clamp(0.0, 1.0));
                if let (Some(image), Some(luma)) = (color, luminance.as_mut()) {
                    let [red, green, blue, _] = image.get_pixel(x, y).0;
                    let value = 0.299 * red as f32 + 0.587 * green as f32 + 0.114 * blue as f32;
                    luma.push(value / 255.0);
                }
            }
        }
        Self {
            depth: depth_values,
            luminance,
        }
    }

    pub fn depth(&self) -> &[f32] {
        &self.depth
    }

    pub fn luminance(&self) -> Option<&[f32]> {
        self.luminance.as_deref()
    }

    /// Mean absolute difference in [0, 1]; 1.0 when the descriptors cannot
    /// be compared. Luminance counts only when both descriptors have it.
    pub fn distance(&self, other: &Self) -> f32 {
        if self.depth.is_empty() || self.depth.len() != other.depth.len() {
            return 1.0;
        }
        let (sum, count) = match (self.luminance(), other.luminance()) {
            (Some(a), Some(b)) if a.len() == b.len() => (
                abs_diff_sum(&self.depth, &other.depth) + abs_diff_sum(a, b),
                self.depth.len() + a.len(),
            ),
            _ => (abs_diff_sum(&self.depth, &other.depth), self.depth.len()),
        };
        sum / count as f32
    }
}

fn abs_diff_sum(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

#[derive(Debug, Clone)]
struct Entry {
    pose: Pose,
    descriptor: FrameDescriptor,
}

/// Outcome of [`PoseDatabase::process_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub added: bool,
    /// The oldest entry was evicted to make room.
    pub trimmed: bool,
}

/// One stored pose proposed for relocalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub pose: Pose,
    pub distance: f32,
}

/// Nearest stored entries, closest first.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    pub candidates: Vec<Candidate>,
    /// Distance to the closest entry in the whole database.
    pub min_distance: f32,
}

/// Insertion-ordered, fixed-capacity pose history.
#[derive(Debug)]
pub struct PoseDatabase {
    entries: VecDeque<Entry>,
    capacity: usize,
}

impl PoseDatabase {
    /// Allocate room for `capacity` entries up front.
    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut entries = VecDeque::new();
        entries.try_reserve_exact(capacity)?;
        Ok(Self { entries, capacity })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Store `pose` if `descriptor` is at least `accept_distance` from every
    /// stored entry, evicting the oldest entry when full.
    pub fn process_frame(
        &mut self,
        descriptor: &FrameDescriptor,
        pose: &Pose,
        accept_distance: f32,
    ) -> ProcessResult {
        let novel = self
            .entries
            .iter()
            .all(|e| e.descriptor.distance(descriptor) >= accept_distance);
        if !novel || self.capacity == 0 {
            return ProcessResult {
                added: false,
                trimmed: false,
            };
        }

        let trimmed = self.entries.len() >= self.capacity;
        if trimmed {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry {
            pose: *pose,
            descriptor: descriptor.clone(),
        });
        debug!("Pose database: {} entries", self.entries.len());
        ProcessResult {
            added: true,
            trimmed,
        }
    }

    /// Up to `max_candidates` entries closest to `descriptor`.
    ///
    /// Equal distances keep insertion order.
    pub fn find_candidates(&self, descriptor: &FrameDescriptor, max_candidates: usize) -> CandidateSet {
        let mut candidates: Vec<Candidate> = self
            .entries
            .iter()
            .map(|e| Candidate {
                pose: e.pose,
                distance: e.descriptor.distance(descriptor),
            })
            .collect();
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        let min_distance = candidates.first().map_or(f32::INFINITY, |c| c.distance);
        candidates.truncate(max_candidates);
        CandidateSet {
            candidates,
            min_distance,
        }
    }
}
