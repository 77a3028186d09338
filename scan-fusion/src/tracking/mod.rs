//! Camera tracking state machine.
//!
//! [`TrackingMachine`] owns the loss/success counters and decides, per frame,
//! whether to integrate, compute residuals, feed the pose database or reset.
//! The alignment itself is delegated to a [`CameraTracker`] strategy, and
//! recovery to [`relocalize`].

mod relocalizer;
mod tracker;

pub use relocalizer::{Relocalization, RelocalizationSettings, relocalize};
pub use tracker::{CameraTracker, PointCloudTracker, TrackFailure, VolumeTracker, select_tracker};

use std::fmt;

/// Tracking status of the current reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No frame processed since the last reset.
    #[default]
    Initializing,
    Tracking,
    Lost,
    /// Searching the pose database for a pose to re-align from.
    Relocalizing,
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackingState::Initializing => "initializing",
            TrackingState::Tracking => "tracking",
            TrackingState::Lost => "lost",
            TrackingState::Relocalizing => "relocalizing",
        };
        f.write_str(name)
    }
}

/// Per-volume tracking counters and transitions.
#[derive(Debug, Clone, Default)]
pub struct TrackingMachine {
    state: TrackingState,
    lost_frames: u32,
    successful_frames: u32,
    has_failed_previously: bool,
    processed_frames: u64,
}

impl TrackingMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// Consecutive failed frames.
    pub fn lost_frames(&self) -> u32 {
        self.lost_frames
    }

    /// Consecutive successful frames.
    pub fn successful_frames(&self) -> u32 {
        self.successful_frames
    }

    /// Tracking failed at some point since data was last integrated.
    pub fn has_failed_previously(&self) -> bool {
        self.has_failed_previously
    }

    /// Frames completed since the last reset.
    pub fn processed_frames(&self) -> u64 {
        self.processed_frames
    }

    /// The next frame is the first since the last reset and always succeeds.
    pub fn is_first_frame(&self) -> bool {
        self.processed_frames == 0
    }

    pub fn is_lost(&self) -> bool {
        self.state == TrackingState::Lost
    }

    pub fn record_success(&mut self) {
        self.state = TrackingState::Tracking;
        self.lost_frames = 0;
        self.successful_frames = self.successful_frames.saturating_add(1);
    }

    pub fn record_failure(&mut self) {
        self.state = TrackingState::Lost;
        self.lost_frames = self.lost_frames.saturating_add(1);
        self.successful_frames = 0;
        self.has_failed_previously = true;
    }

    pub fn begin_relocalization(&mut self) {
        self.state = TrackingState::Relocalizing;
    }

    /// Relocalization did not find a pose; the frame stays counted as lost.
    pub fn relocalization_failed(&mut self) {
        self.state = TrackingState::Lost;
    }

    /// Lost for long enough that the volume should start over.
    pub fn should_auto_reset(&self, enabled: bool, lost_frames_before_reset: u32) -> bool {
        enabled && self.is_lost() && self.lost_frames >= lost_frames_before_reset
    }

    /// Whether this frame may be fused into the volume.
    ///
    /// Without a pose database integration follows the pause flag. With one,
    /// integration waits for `min_frames_after_failure` successes after a loss.
    pub fn should_integrate(
        &self,
        pose_database_active: bool,
        paused: bool,
        min_frames_after_failure: u32,
    ) -> bool {
        if self.is_lost() {
            return false;
        }
        if pose_database_active {
            !(self.has_failed_previously && self.successful_frames < min_frames_after_failure)
        } else {
            !paused
        }
    }

    pub fn mark_integrated(&mut self) {
        self.has_failed_previously = false;
    }

    /// Whether to request per-pixel residuals this frame.
    pub fn should_calculate_delta(&self, interval: u32) -> bool {
        self.processed_frames % interval.max(1) as u64 == 0
            || (self.has_failed_previously && self.successful_frames <= 2)
    }

    /// Whether this frame should be offered to the pose database.
    pub fn should_update_pose_database(
        &self,
        min_successful_frames: u32,
        interval: u32,
        color_usable: bool,
    ) -> bool {
        !self.has_failed_previously
            && self.successful_frames > min_successful_frames
            && self.processed_frames % interval.max(1) as u64 == 0
            && color_usable
    }

    pub fn complete_frame(&mut self) {
        self.processed_frames += 1;
    }

    /// Back to [`TrackingState::Initializing`] with all counters cleared.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_then_tracking() {
        let mut machine = TrackingMachine::new();
        assert_eq!(machine.state(), TrackingState::Initializing);
        assert!(machine.is_first_frame());
        machine.record_success();
        machine.complete_frame();
        assert_eq!(machine.state(), TrackingState::Tracking);
        assert!(!machine.is_first_frame());
    }

    #[test]
    fn test_failure_counters() {
        let mut machine = TrackingMachine::new();
        machine.record_success();
        machine.record_success();
        machine.record_failure();
        machine.record_failure();
        assert_eq!(machine.state(), TrackingState::Lost);
        assert_eq!(machine.lost_frames(), 2);
        assert_eq!(machine.successful_frames(), 0);
        assert!(machine.has_failed_previously());

        machine.record_success();
        assert_eq!(machine.lost_frames(), 0);
        assert!(machine.has_failed_previously());
    }

    #[test]
    fn test_auto_reset_at_threshold() {
        let mut machine = TrackingMachine::new();
        for _ in 0..2 {
            machine.record_failure();
            assert!(!machine.should_auto_reset(true, 3));
        }
        machine.record_failure();
        assert!(!machine.should_auto_reset(false, 3));
        assert!(machine.should_auto_reset(true, 3));

        machine.reset();
        assert_eq!(machine.lost_frames(), 0);
        assert_eq!(machine.state(), TrackingState::Initializing);
        assert!(!machine.should_auto_reset(true, 3));
    }

    #[test]
    fn test_relocalization_states() {
        let mut machine = TrackingMachine::new();
        machine.record_failure();
        machine.begin_relocalization();
        assert_eq!(machine.state(), TrackingState::Relocalizing);
        machine.relocalization_failed();
        assert_eq!(machine.state(), TrackingState::Lost);
        assert_eq!(machine.lost_frames(), 1);
    }

    #[test]
    fn test_integration_gating() {
        let mut machine = TrackingMachine::new();
        machine.record_success();
        assert!(machine.should_integrate(false, false, 200));
        assert!(!machine.should_integrate(false, true, 200));
        // Pause only applies without a pose database.
        assert!(machine.should_integrate(true, true, 200));

        machine.record_failure();
        assert!(!machine.should_integrate(false, false, 200));

        machine.record_success();
        assert!(machine.should_integrate(false, false, 2));
        assert!(!machine.should_integrate(true, false, 2));
        machine.record_success();
        assert!(machine.should_integrate(true, false, 2));

        machine.mark_integrated();
        assert!(!machine.has_failed_previously());
    }

    #[test]
    fn test_delta_interval_and_recovery() {
        let mut machine = TrackingMachine::new();
        assert!(machine.should_calculate_delta(2));
        machine.complete_frame();
        assert!(!machine.should_calculate_delta(2));

        machine.record_failure();
        machine.record_success();
        assert!(machine.should_calculate_delta(2));
        machine.record_success();
        machine.record_success();
        assert!(!machine.should_calculate_delta(2));
    }

    #[test]
    fn test_pose_database_gating() {
        let mut machine = TrackingMachine::new();
        for _ in 0..3 {
            machine.record_success();
        }
        assert!(machine.should_update_pose_database(2, 1, true));
        assert!(!machine.should_update_pose_database(3, 1, true));
        assert!(!machine.should_update_pose_database(2, 1, false));

        machine.complete_frame();
        assert!(!machine.should_update_pose_database(2, 2, true));
    }
}
