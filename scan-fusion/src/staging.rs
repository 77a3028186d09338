//! Double-buffered parameter exchange between the control thread and the worker.
//!
//! The control thread only ever writes the "next" set and raises one-shot
//! command flags. The worker copies "next" into its own "current" set at the
//! top of each iteration, under the same lock, and takes the flags with it.

use crate::params::FusionParams;
use parking_lot::Mutex;

/// Edge-triggered changes observed by one [`ParameterStaging::latch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatchedCommands {
    pub near_mode_changed: bool,
    pub volume_changed: bool,
    pub reset_requested: bool,
    pub resolve_conflict: bool,
    /// Integration was paused and is now running again.
    pub integration_resumed: bool,
}

impl LatchedCommands {
    /// Merge commands latched later, keeping any not yet handled.
    pub fn absorb(&mut self, later: LatchedCommands) {
        self.near_mode_changed |= later.near_mode_changed;
        self.volume_changed |= later.volume_changed;
        self.reset_requested |= later.reset_requested;
        self.resolve_conflict |= later.resolve_conflict;
        self.integration_resumed |= later.integration_resumed;
    }
}

#[derive(Debug)]
struct Staged {
    next: FusionParams,
    reset_requested: bool,
    resolve_conflict: bool,
}

/// The staging area shared by the control thread and the worker.
#[derive(Debug)]
pub struct ParameterStaging {
    inner: Mutex<Staged>,
}

impl ParameterStaging {
    pub fn new(params: FusionParams) -> Self {
        Self {
            inner: Mutex::new(Staged {
                next: params,
                reset_requested: false,
                resolve_conflict: false,
            }),
        }
    }

    /// Replace the next parameter set. Never waits on the worker.
    pub fn set_next(&self, params: FusionParams) {
        self.inner.lock().next = params;
    }

    /// Copy of the next parameter set.
    pub fn next(&self) -> FusionParams {
        self.inner.lock().next.clone()
    }

    /// Ask the worker to reset the reconstruction on its next iteration.
    pub fn request_reset(&self) {
        self.inner.lock().reset_requested = true;
    }

    /// Ask the worker to take over a sensor held by another application.
    pub fn request_conflict_resolution(&self) {
        self.inner.lock().resolve_conflict = true;
    }

    /// Clear the pause flag in the next set after a reconstruction reset.
    pub fn clear_pause(&self) {
        self.inner.lock().next.pause_integration = false;
    }

    /// Copy next into `current` and take pending one-shot commands.
    ///
    /// Flags are cleared as they are returned, so each command is delivered
    /// exactly once however many updates arrived since the last latch.
    pub fn latch(&self, current: &mut FusionParams) -> LatchedCommands {
        let mut staged = self.inner.lock();
        let commands = LatchedCommands {
            near_mode_changed: current.near_mode != staged.next.near_mode,
            volume_changed: current.volume_changed(&staged.next),
            reset_requested: std::mem::take(&mut staged.reset_requested),
            resolve_conflict: std::mem::take(&mut staged.resolve_conflict),
            integration_resumed: current.pause_integration && !staged.next.pause_integration,
        };
        current.clone_from(&staged.next);
        commands
    }
}
