//! Recovery from tracking loss through the pose database.

use crate::engine::{Alignment, EngineError, Pose};
use crate::params::FusionParams;
use crate::pose_db::{FrameDescriptor, PoseDatabase};
use tracing::{debug, info};

/// Thresholds for one relocalization attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelocalizationSettings {
    /// Give up when the closest stored frame is at least this far.
    pub reject_distance: f32,
    /// Candidates aligned at most.
    pub max_tests: usize,
    /// Accept only energies below this.
    pub max_energy: f32,
    /// And above this, to skip degenerate matches.
    pub min_energy: f32,
}

impl RelocalizationSettings {
    pub fn from_params(params: &FusionParams) -> Self {
        Self {
            reject_distance: params.pose_database.reject_distance,
            max_tests: params.pose_database.max_tests,
            max_energy: params.tracking.max_align_point_clouds_energy,
            min_energy: params.tracking.min_align_point_clouds_energy,
        }
    }
}

/// Outcome of [`relocalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Relocalization {
    /// The database is empty; nothing was aligned.
    NoCandidates,
    /// Even the closest stored frame looks too different.
    Rejected { min_distance: f32 },
    Found {
        pose: Pose,
        energy: f32,
        /// Index of the accepted candidate, closest first.
        candidate: usize,
        tested: usize,
    },
    /// No candidate met the thresholds. `fallback_pose` is the stored pose
    /// that aligned with the smallest energy, if any alignment ran at all.
    Failed {
        fallback_pose: Option<Pose>,
        smallest_energy: f32,
        tested: usize,
    },
}

/// Try to recover the camera pose for the frame described by `descriptor`.
///
/// `align` aligns the current frame starting from a candidate pose.
/// Candidates are tried closest first; the lowest energy inside
/// `(min_energy, max_energy)` wins and ties keep the earlier candidate.
/// Candidates whose alignment errors are skipped.
pub fn relocalize(
    db: &PoseDatabase,
    descriptor: &FrameDescriptor,
    settings: &RelocalizationSettings,
    mut align: impl FnMut(&Pose) -> Result<Alignment, EngineError>,
) -> Relocalization {
    if db.is_empty() {
        return Relocalization::NoCandidates;
    }

    let set = db.find_candidates(descriptor, settings.max_tests);
    if set.min_distance >= settings.reject_distance {
        debug!(
            "Relocalization rejected: closest pose at distance {:.3}",
            set.min_distance
        );
        return Relocalization::Rejected {
            min_distance: set.min_distance,
        };
    }

    let mut best: Option<(usize, Alignment)> = None;
    let mut best_energy = settings.max_energy;
    let mut smallest: Option<(usize, f32)> = None;
    let mut tested = 0;

    for (i, candidate) in set.candidates.iter().enumerate() {
        tested += 1;
        let alignment = match align(&candidate.pose) {
            Ok(a) => a,
            Err(e) => {
                debug!("Candidate {} alignment failed: {}", i, e);
                continue;
            }
        };
        if alignment.energy.is_nan() {
            debug!("Candidate {} alignment has no residual energy", i);
            continue;
        }

        if alignment.energy < best_energy && alignment.energy > settings.min_energy {
            best_energy = alignment.energy;
            best = Some((i, alignment));
        }
        if smallest.is_none_or(|(_, e)| alignment.energy < e) {
            smallest = Some((i, alignment.energy));
        }
    }

    match best {
        Some((candidate, alignment)) => {
            info!(
                "Relocalized on candidate {} of {} (energy {:.5})",
                candidate, tested, alignment.energy
            );
            Relocalization::Found {
                pose: alignment.pose,
                energy: alignment.energy,
                candidate,
                tested,
            }
        }
        None => Relocalization::Failed {
            fallback_pose: smallest.map(|(i, _)| set.candidates[i].pose),
            smallest_energy: smallest.map_or(f32::INFINITY, |(_, e)| e),
            tested,
        },
    }
}
