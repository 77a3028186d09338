//! Monotonic wall-clock source.

use std::time::Instant;

/// Seconds elapsed since the timer was created.
///
/// Used for frame-rate computation and render-interval gating; never goes
/// backwards.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    origin: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Absolute time in seconds since creation.
    pub fn absolute_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
