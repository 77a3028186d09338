//! Depth/color stream resynchronization.
//!
//! Depth and color arrive on independent streams with their own timestamps.
//! Each iteration takes one depth frame and whatever color frame is ready,
//! and when the two drift apart by more than [`RESYNC_THRESHOLD_MS`] makes
//! at most one corrective fetch on the lagging stream.

use scan_capture::{CaptureError, ColorFrame, DepthFrame, DepthSensor};
use std::time::Duration;
use tracing::debug;

/// Largest depth/color timestamp difference still treated as synchronized.
pub const RESYNC_THRESHOLD_MS: i64 = 17;

/// Which stream was re-read to close a timestamp gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectiveFetch {
    Depth,
    Color,
}

/// Frames taken from the sensor for one iteration.
#[derive(Debug)]
pub struct AcquiredFrames {
    pub depth: DepthFrame,
    /// Color frame fetched this iteration, if any.
    pub color: Option<ColorFrame>,
    /// Color may be integrated together with `depth`.
    pub color_synchronized: bool,
    /// The sensor has not produced a single color frame yet.
    pub depth_only: bool,
    pub corrected: Option<CorrectiveFetch>,
    /// Color minus depth timestamp after any correction.
    pub timestamp_diff_ms: i64,
    /// Depth timestamp change since the previous iteration.
    pub timestamp_jump_ms: Option<i64>,
}

/// Tracks stream timestamps across iterations.
#[derive(Debug, Clone)]
pub struct Resynchronizer {
    threshold_ms: i64,
    last_depth_ts: Option<i64>,
    last_color_ts: Option<i64>,
}

impl Resynchronizer {
    pub fn new() -> Self {
        Self {
            threshold_ms: RESYNC_THRESHOLD_MS,
            last_depth_ts: None,
            last_color_ts: None,
        }
    }

    pub fn with_threshold(mut self, threshold_ms: i64) -> Self {
        self.threshold_ms = threshold_ms;
        self
    }

    /// Forget timestamps from a previous sensor.
    pub fn reset(&mut self) {
        self.last_depth_ts = None;
        self.last_color_ts = None;
    }

    /// Take the next depth frame and try to pair it with color.
    ///
    /// `track` runs on the current depth frame before a corrective depth
    /// fetch, so tracking keeps up while the depth stream is being skipped
    /// forward. A failed initial depth fetch aborts the iteration; every
    /// later fetch failure only marks color as unsynchronized.
    pub fn acquire(
        &mut self,
        sensor: &mut dyn DepthSensor,
        resync_allowed: bool,
        mut track: impl FnMut(&DepthFrame),
    ) -> Result<AcquiredFrames, CaptureError> {
        let previous_depth_ts = self.last_depth_ts;
        let mut depth = sensor.next_depth(Duration::ZERO)?;
        self.last_depth_ts = Some(depth.timestamp_ms);

        let mut color = None;
        let mut color_failed = false;
        match sensor.next_color(Duration::ZERO) {
            Ok(frame) => {
                self.last_color_ts = Some(frame.timestamp_ms);
                color = Some(frame);
            }
            Err(e) => {
                debug!("No color frame: {}", e);
                color_failed = true;
            }
        }

        let Some(mut color_ts) = self.last_color_ts else {
            return Ok(AcquiredFrames {
                timestamp_jump_ms: previous_depth_ts.map(|p| depth.timestamp_ms - p),
                depth,
                color: None,
                color_synchronized: false,
                depth_only: true,
                corrected: None,
                timestamp_diff_ms: 0,
            });
        };

        let mut diff = color_ts - depth.timestamp_ms;
        let mut corrected = None;
        let mut depth_failed = false;

        if diff.abs() >= self.threshold_ms && resync_allowed {
            if diff > 0 {
                // Color is ahead: keep tracking on this frame, then skip depth forward.
                track(&depth);
                corrected = Some(CorrectiveFetch::Depth);
                match sensor.next_depth(Duration::from_millis(diff as u64)) {
                    Ok(frame) => {
                        self.last_depth_ts = Some(frame.timestamp_ms);
                        depth = frame;
                    }
                    Err(e) => {
                        debug!("Corrective depth fetch failed: {}", e);
                        depth_failed = true;
                    }
                }
            } else if sensor.color_pending() {
                corrected = Some(CorrectiveFetch::Color);
                match sensor.next_color(Duration::ZERO) {
                    Ok(frame) => {
                        color_ts = frame.timestamp_ms;
                        self.last_color_ts = Some(color_ts);
                        color = Some(frame);
                        color_failed = false;
                    }
                    Err(e) => {
                        debug!("Corrective color fetch failed: {}", e);
                        color_failed = true;
                    }
                }
            }
            diff = color_ts - depth.timestamp_ms;
        }

        let within = if corrected.is_some() {
            diff.abs() <= self.threshold_ms
        } else {
            diff.abs() < self.threshold_ms
        };
        let color_synchronized = within && !color_failed && !depth_failed;
        if !color_synchronized {
            debug!("Color not synchronized (diff {} ms)", diff);
        }

        Ok(AcquiredFrames {
            timestamp_jump_ms: previous_depth_ts.map(|p| depth.timestamp_ms - p),
            depth,
            color,
            color_synchronized,
            depth_only: false,
            corrected,
            timestamp_diff_ms: diff,
        })
    }
}

impl Default for Resynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use scan_capture::{DepthImage, ReplayFeed, ReplaySensor, StreamGeometry};

    fn sensor() -> (ReplaySensor, ReplayFeed) {
        ReplaySensor::new(StreamGeometry::uniform(2, 2))
    }

    fn depth(ts: i64) -> DepthFrame {
        DepthFrame::new(DepthImage::new(2, 2), ts, 0)
    }

    fn color(ts: i64) -> ColorFrame {
        ColorFrame::new(RgbaImage::new(2, 2), ts, 0)
    }

    #[test]
    fn test_close_timestamps_are_synchronized() {
        let (mut sensor, feed) = sensor();
        feed.push_color(color(10));
        feed.push_depth(depth(0));

        let mut resync = Resynchronizer::new();
        let frames = resync.acquire(&mut sensor, true, |_| {}).unwrap();
        assert!(frames.color_synchronized);
        assert!(frames.corrected.is_none());
        assert_eq!(frames.timestamp_diff_ms, 10);
        assert_eq!(frames.timestamp_jump_ms, None);
    }

    #[test]
    fn test_color_ahead_makes_one_corrective_depth_fetch() {
        let (mut sensor, feed) = sensor();
        feed.push_color(color(100));
        for ts in [0, 33, 66] {
            feed.push_depth(depth(ts));
        }

        let mut resync = Resynchronizer::new();
        let mut tracked = Vec::new();
        let frames = resync
            .acquire(&mut sensor, true, |d| tracked.push(d.timestamp_ms))
            .unwrap();

        assert_eq!(tracked, vec![0]);
        assert_eq!(frames.corrected, Some(CorrectiveFetch::Depth));
        assert_eq!(frames.depth.timestamp_ms, 33);
        assert!(!frames.color_synchronized);
        assert!(sensor.depth_pending());
        sensor.next_depth(Duration::ZERO).unwrap();
        assert!(!sensor.depth_pending());
    }

    #[test]
    fn test_depth_ahead_fetches_pending_color() {
        let (mut sensor, feed) = sensor();
        feed.push_color(color(0));
        feed.push_color(color(95));
        feed.push_depth(depth(100));

        let mut resync = Resynchronizer::new();
        let frames = resync.acquire(&mut sensor, true, |_| {}).unwrap();
        assert_eq!(frames.corrected, Some(CorrectiveFetch::Color));
        assert_eq!(frames.color.unwrap().timestamp_ms, 95);
        assert!(frames.color_synchronized);
    }

    #[test]
    fn test_resync_not_allowed_leaves_frame_unsynchronized() {
        let (mut sensor, feed) = sensor();
        feed.push_color(color(100));
        feed.push_depth(depth(0));
        feed.push_depth(depth(33));

        let mut resync = Resynchronizer::new();
        let mut calls = 0;
        let frames = resync.acquire(&mut sensor, false, |_| calls += 1).unwrap();
        assert_eq!(calls, 0);
        assert!(frames.corrected.is_none());
        assert!(!frames.color_synchronized);
        assert!(sensor.depth_pending());
    }

    #[test]
    fn test_failed_corrective_fetch_keeps_original_depth() {
        let (mut sensor, feed) = sensor();
        feed.push_color(color(40));
        feed.push_depth(depth(0));

        let mut resync = Resynchronizer::new();
        let frames = resync.acquire(&mut sensor, true, |_| {}).unwrap();
        assert_eq!(frames.depth.timestamp_ms, 0);
        assert_eq!(frames.corrected, Some(CorrectiveFetch::Depth));
        assert!(!frames.color_synchronized);
    }

    #[test]
    fn test_depth_only_stream() {
        let (mut sensor, feed) = sensor();
        feed.push_depth(depth(0));
        feed.push_depth(depth(7000));

        let mut resync = Resynchronizer::new();
        let first = resync.acquire(&mut sensor, true, |_| {}).unwrap();
        assert!(first.depth_only);
        assert!(!first.color_synchronized);

        let second = resync.acquire(&mut sensor, true, |_| {}).unwrap();
        assert_eq!(second.timestamp_jump_ms, Some(7000));
    }

    #[test]
    fn test_missing_depth_aborts() {
        let (mut sensor, _feed) = sensor();
        let mut resync = Resynchronizer::new();
        assert!(matches!(
            resync.acquire(&mut sensor, true, |_| {}),
            Err(CaptureError::Timeout)
        ));
    }
}
