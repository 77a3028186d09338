//! The fusion worker thread.
//!
//! One thread owns the engine, the sensor and every piece of per-frame
//! state. It blocks on a multiplexed wait over the stop channel, the
//! sensor's frame signal and provider status notifications, and runs the
//! frame pipeline once for each available depth frame:
//!
//! acquire → convert → track → integrate → raycast → update pose database
//!
//! followed by publishing the visualization and the periodic mesh export.

use crate::buffers::FrameBuffers;
use crate::engine::{EngineError, Pose, ReconstructionEngine, ReconstructionVolume};
use crate::error::FusionError;
use crate::params::FusionParams;
use crate::pose_db::{FrameDescriptor, PoseDatabase};
use crate::publisher::{FramePublisher, ProcessorEvent};
use crate::resync::{AcquiredFrames, Resynchronizer};
use crate::staging::{LatchedCommands, ParameterStaging};
use crate::timer::Timer;
use crate::tracking::{
    Relocalization, RelocalizationSettings, TrackingMachine, relocalize, select_tracker,
};
use crate::visualize;
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use glam::Mat4;
use parking_lot::Mutex;
use scan_capture::{DepthFrame, DepthSensor, SensorChange, SensorProvider, align_color_to_depth};
use scan_data::{ExportJob, ExportSummary};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum time between visualization raycasts while frames are queued, in seconds.
pub const RENDER_INTERVAL_SECS: f64 = 0.1;

/// Seconds between frame-rate updates.
pub const FPS_INTERVAL_SECS: f64 = 1.0;

const TRACKING_FAILED: &str = "Camera tracking failed! Align the camera to the last tracked position.";
const SEARCHING_POSE_DATABASE: &str =
    "Camera tracking lost. Move the camera back to a previously scanned position.";

/// The volume slot. Locked by the worker for a whole frame and by the
/// control thread for mesh calculation.
#[derive(Default)]
pub(crate) struct VolumeState {
    pub volume: Option<Box<dyn ReconstructionVolume>>,
    /// A mesh was calculated since the last frame, so the next timestamp
    /// jump is expected.
    pub mesh_calculated: bool,
}

/// State shared between the control surface and the worker.
pub(crate) struct Shared {
    pub staging: ParameterStaging,
    pub publisher: FramePublisher,
    pub volume: Mutex<VolumeState>,
}

/// Resources the worker owns while running and hands back when it stops.
pub(crate) struct WorkerParts {
    pub engine: Box<dyn ReconstructionEngine>,
    pub provider: Box<dyn SensorProvider>,
}

/// A failure that ends the current frame early.
#[derive(Debug, Error)]
#[error("{0}")]
struct FrameError(String);

enum Flow {
    Continue,
    /// Nothing more to do this frame; publish what there is.
    SkipRest,
    /// Reset the reconstruction with this status, then carry on.
    ResetRequired(&'static str),
}

enum WorkerEvent {
    Stop,
    Frame,
    Status,
}

/// What the stages of one frame learned so far.
#[derive(Default)]
struct FrameContext {
    frames: Option<AcquiredFrames>,
    depth_available: bool,
    color_aligned: bool,
    calculate_delta: bool,
    raycast_done: bool,
}

#[derive(Debug, Default)]
struct StatusLine {
    message: String,
}

impl StatusLine {
    fn set(&mut self, message: impl Into<String>) {
        let message = message.into();
        if message != self.message {
            info!("{}", message);
            self.message = message;
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if message != self.message {
            warn!("{}", message);
            self.message = message;
        }
    }
}

#[derive(Default)]
struct FusionState {
    pose: Pose,
    default_world_to_volume: Mat4,
    machine: TrackingMachine,
    pose_db: Option<PoseDatabase>,
    pose_db_alloc_failed: bool,
    /// Volume creation failed; retried only when volume parameters change.
    volume_failed: bool,
    engine_initialized: bool,
    timer: Timer,
    last_raycast: f64,
    fps_frames: u32,
    fps_since: f64,
    export_frames: u32,
    status: StatusLine,
    integration_resumed: bool,
    color_captured: bool,
    device_memory_kb: u64,
    total_frames: u64,
    resets: u64,
    buffers: FrameBuffers,
}

type Stage = fn(&mut Worker, &mut VolumeState, &mut FrameContext) -> Result<Flow, FrameError>;

pub(crate) struct Worker {
    engine: Box<dyn ReconstructionEngine>,
    provider: Box<dyn SensorProvider>,
    sensor: Option<Box<dyn DepthSensor>>,
    frame_signal: Option<Receiver<()>>,
    resync: Resynchronizer,
    stop_rx: Receiver<()>,
    status_tx: Sender<()>,
    status_rx: Receiver<()>,
    shared: Arc<Shared>,
    params: FusionParams,
    pending: LatchedCommands,
    state: FusionState,
}

impl Worker {
    const STAGES: [Stage; 6] = [
        Self::acquire,
        Self::convert,
        Self::track,
        Self::integrate,
        Self::raycast,
        Self::update_pose_database,
    ];

    pub fn new(
        parts: WorkerParts,
        shared: Arc<Shared>,
        stop_rx: Receiver<()>,
        status_tx: Sender<()>,
        status_rx: Receiver<()>,
    ) -> Self {
        let params = shared.staging.next();
        // A restarted worker rebuilds the volume a previous run left behind.
        let pending = LatchedCommands {
            volume_changed: shared.volume.lock().volume.is_some(),
            ..LatchedCommands::default()
        };
        Self {
            engine: parts.engine,
            provider: parts.provider,
            sensor: None,
            frame_signal: None,
            resync: Resynchronizer::new(),
            stop_rx,
            status_tx,
            status_rx,
            shared,
            params,
            pending,
            state: FusionState::default(),
        }
    }

    /// Process frames until stopped, then hand the engine and provider back.
    #[tracing::instrument(skip_all, name = "fusion_worker")]
    pub fn run(mut self) -> WorkerParts {
        info!("Fusion worker started");
        self.provider.watch(self.status_tx.clone());
        self.latch();
        self.handle_status();
        self.notify_if_no_sensor();

        loop {
            match self.next_event() {
                WorkerEvent::Stop => break,
                WorkerEvent::Frame => {
                    self.latch();
                    self.handle_frame();
                }
                WorkerEvent::Status => {
                    self.latch();
                    self.handle_status();
                }
            }
            self.notify_if_no_sensor();
        }

        self.release_sensor();
        info!(
            "Fusion worker stopped after {} frames",
            self.state.total_frames
        );
        WorkerParts {
            engine: self.engine,
            provider: self.provider,
        }
    }

    fn latch(&mut self) {
        let mut commands = self.shared.staging.latch(&mut self.params);
        if std::mem::take(&mut commands.integration_resumed) {
            self.state.integration_resumed = true;
        }
        self.pending.absorb(commands);
    }

    /// Wait for the next thing to do. Stop wins over queued frames, and
    /// queued frames win over status changes.
    fn next_event(&mut self) -> WorkerEvent {
        loop {
            match self.stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return WorkerEvent::Stop,
                Err(TryRecvError::Empty) => {}
            }

            if self.sensor.as_ref().is_some_and(|s| s.depth_pending()) {
                if let Some(signal) = &self.frame_signal {
                    while signal.try_recv().is_ok() {}
                }
                return WorkerEvent::Frame;
            }

            if self.status_rx.try_recv().is_ok() {
                while self.status_rx.try_recv().is_ok() {}
                return WorkerEvent::Status;
            }

            let signal_closed = {
                let mut select = Select::new();
                select.recv(&self.stop_rx);
                select.recv(&self.status_rx);
                let frame_index = self.frame_signal.as_ref().map(|rx| select.recv(rx));
                let ready = select.ready();
                match (frame_index, &self.frame_signal) {
                    (Some(index), Some(rx)) if index == ready => {
                        matches!(rx.try_recv(), Err(TryRecvError::Disconnected))
                    }
                    _ => false,
                }
            };
            if signal_closed {
                debug!("Frame signal closed");
                self.frame_signal = None;
            }
        }
    }

    fn notify_if_no_sensor(&self) {
        if self.sensor.is_none() {
            self.shared
                .publisher
                .notify_empty_frame(&self.state.status.message);
        }
    }

    // ---------------------------------------------------------------------
    // Sensor lifecycle
    // ---------------------------------------------------------------------

    fn handle_status(&mut self) {
        if std::mem::take(&mut self.pending.resolve_conflict) {
            if self.provider.resolve_conflict() {
                info!("Sensor conflict resolved");
            } else {
                debug!("No sensor conflict to resolve");
            }
        }

        loop {
            match self.provider.poll_change() {
                SensorChange::Unchanged => break,
                SensorChange::SensorAvailable => self.connect_sensor(),
                SensorChange::SensorLost => self.release_sensor(),
                SensorChange::Status(status) => debug!("Sensor status: {}", status),
            }
        }

        let status = self.provider.status();
        if self.sensor.is_none() {
            self.state.status.warn(status.to_string());
        }
        self.shared
            .publisher
            .notify(ProcessorEvent::SensorStatus(status));
    }

    fn connect_sensor(&mut self) {
        if self.sensor.is_some() {
            return;
        }
        let mut sensor = match self.provider.connect() {
            Ok(sensor) => sensor,
            Err(e) => {
                self.state
                    .status
                    .warn(format!("Failed to open the sensor: {}", e));
                return;
            }
        };
        if let Err(e) = sensor.set_near_mode(self.params.near_mode) {
            warn!("Near mode unavailable: {}", e);
        }

        let geometry = sensor.geometry();
        self.frame_signal = Some(sensor.frame_signal());
        self.sensor = Some(sensor);
        self.resync.reset();
        self.state
            .buffers
            .ensure(geometry.depth_width, geometry.depth_height);
        self.shared
            .publisher
            .lock()
            .initialize(geometry.depth_width, geometry.depth_height);
        self.state.engine_initialized = true;
        self.state.status.set(format!(
            "Sensor connected ({}x{} depth, {}x{} color)",
            geometry.depth_width, geometry.depth_height, geometry.color_width, geometry.color_height
        ));
    }

    fn release_sensor(&mut self) {
        if let Some(mut sensor) = self.sensor.take() {
            sensor.shutdown();
            info!("Sensor released");
        }
        self.frame_signal = None;
        self.state.engine_initialized = false;
    }

    // ---------------------------------------------------------------------
    // Per-frame setup
    // ---------------------------------------------------------------------

    fn handle_frame(&mut self) {
        if !self.state.engine_initialized {
            if let Some(sensor) = self.sensor.as_mut() {
                let _ = sensor.next_depth(std::time::Duration::ZERO);
            }
            return;
        }

        if std::mem::take(&mut self.pending.near_mode_changed) {
            if let Some(sensor) = self.sensor.as_mut() {
                if let Err(e) = sensor.set_near_mode(self.params.near_mode) {
                    self.state
                        .status
                        .warn(format!("Failed to switch near mode: {}", e));
                }
            }
        }
        let volume_changed = std::mem::take(&mut self.pending.volume_changed);
        let reset_requested = std::mem::take(&mut self.pending.reset_requested);

        let shared = Arc::clone(&self.shared);
        let mut slot = shared.volume.lock();
        if volume_changed || (slot.volume.is_none() && !self.state.volume_failed) {
            self.recreate_volume(&mut slot);
        } else if reset_requested {
            self.reset_reconstruction(&mut slot);
            self.state.status.set("Reconstruction has been reset.");
        }
        self.sync_pose_database();
        self.process_depth(&mut slot);
        drop(slot);

        self.shared.publisher.notify(ProcessorEvent::FrameReady);
    }

    /// Create, drop or resize the pose database to match the parameters.
    fn sync_pose_database(&mut self) {
        let settings = &self.params.pose_database;
        let state = &mut self.state;
        if !settings.enabled {
            if state.pose_db.take().is_some() {
                debug!("Pose database released");
            }
            state.pose_db_alloc_failed = false;
            return;
        }
        let current = state
            .pose_db
            .as_ref()
            .is_some_and(|db| db.capacity() == settings.max_history);
        if current || state.pose_db_alloc_failed {
            return;
        }

        match PoseDatabase::with_capacity(settings.max_history) {
            Ok(db) => {
                debug!("Pose database holds up to {} poses", settings.max_history);
                state.pose_db = Some(db);
            }
            Err(e) => {
                state.pose_db = None;
                state.pose_db_alloc_failed = true;
                state.status.warn(format!(
                    "Out of memory allocating the pose database, relocalization is disabled: {}",
                    e
                ));
            }
        }
    }

    #[tracing::instrument(skip_all)]
    fn recreate_volume(&mut self, slot: &mut VolumeState) {
        slot.volume = None;
        self.state.volume_failed = true;
        self.state.pose_db = None;
        self.state.pose_db_alloc_failed = false;

        let volume_params = &self.params.volume;
        match self
            .engine
            .device_info(volume_params.processor, volume_params.device_index)
        {
            Ok(device) => {
                info!(
                    "Reconstruction device: {} ({} KB)",
                    device.description, device.memory_kb
                );
                self.state.device_memory_kb = device.memory_kb;
            }
            Err(e) => {
                self.state.status.warn(format!(
                    "Failed to find a compatible reconstruction device: {}",
                    e
                ));
                return;
            }
        }

        match self.engine.create_volume(volume_params, &Pose::IDENTITY) {
            Ok(volume) => {
                self.state.default_world_to_volume = volume.world_to_volume();
                slot.volume = Some(volume);
                self.state.volume_failed = false;
                info!(
                    "Created {}x{}x{} volume at {} voxels per meter",
                    volume_params.resolution_x,
                    volume_params.resolution_y,
                    volume_params.resolution_z,
                    volume_params.voxels_per_meter
                );
            }
            Err(EngineError::OutOfMemory(detail)) => {
                self.state.status.warn(format!(
                    "Out of memory creating the reconstruction volume, try a smaller size: {}",
                    detail
                ));
                return;
            }
            Err(e) => {
                self.state
                    .status
                    .warn(format!("Failed to create the reconstruction volume: {}", e));
                return;
            }
        }

        self.reset_reconstruction(slot);
    }

    /// Start the reconstruction over at the identity pose.
    fn reset_reconstruction(&mut self, slot: &mut VolumeState) {
        self.state.pose = Pose::IDENTITY;

        if let Some(volume) = slot.volume.as_deref_mut() {
            let params = &self.params;
            let world_to_volume = params.translate_reset_pose_by_min_depth.then(|| {
                let mut shifted = self.state.default_world_to_volume;
                shifted.w_axis.z -=
                    params.min_depth.min(params.max_depth) * params.volume.voxels_per_meter;
                shifted
            });
            if let Err(e) = volume.reset(&self.state.pose, world_to_volume.as_ref()) {
                self.state
                    .status
                    .warn(format!("Failed to reset the reconstruction: {}", e));
                return;
            }
        }

        self.state.machine.reset();
        if let Some(db) = self.state.pose_db.as_mut() {
            db.clear();
        }
        self.state.fps_frames = 0;
        self.state.fps_since = self.state.timer.absolute_time();
        self.state.export_frames = 0;
        self.state.integration_resumed = true;
        self.state.color_captured = false;
        self.state.resets += 1;

        self.params.pause_integration = false;
        self.shared.staging.clear_pause();
        self.shared.publisher.lock().frames_per_second = 0.0;
        debug!("Reconstruction reset ({} so far)", self.state.resets);
    }

    // ---------------------------------------------------------------------
    // Frame pipeline
    // ---------------------------------------------------------------------

    fn process_depth(&mut self, slot: &mut VolumeState) {
        let mut ctx = FrameContext::default();
        let result = self.run_stages(slot, &mut ctx);

        if ctx.frames.is_none() {
            if let Err(e) = result {
                self.state.status.warn(e.to_string());
            }
            return;
        }

        let succeeded = match result {
            Ok(()) => true,
            Err(e) => {
                self.state.status.warn(e.to_string());
                false
            }
        };
        self.finish_frame(slot, &ctx, succeeded);
    }

    fn run_stages(&mut self, slot: &mut VolumeState, ctx: &mut FrameContext) -> Result<(), FrameError> {
        for stage in Self::STAGES {
            match stage(self, slot, ctx)? {
                Flow::Continue => {}
                Flow::SkipRest => break,
                Flow::ResetRequired(reason) => {
                    self.reset_reconstruction(slot);
                    self.state.status.warn(reason);
                }
            }
        }
        Ok(())
    }

    /// Fetch depth and color, resynchronizing the streams when they drift.
    fn acquire(&mut self, slot: &mut VolumeState, ctx: &mut FrameContext) -> Result<Flow, FrameError> {
        let Some(sensor) = self.sensor.as_deref_mut() else {
            return Ok(Flow::SkipRest);
        };
        let params = &self.params;
        let state = &mut self.state;
        let engine = self.engine.as_ref();

        ctx.calculate_delta = state.machine.should_calculate_delta(params.delta_frame_interval);
        let resync_allowed = state.machine.successful_frames() > 0
            && (params.pose_database.enabled || params.capture_color);

        let frames = self
            .resync
            .acquire(sensor, resync_allowed, |depth| {
                if let Some(volume) = slot.volume.as_deref_mut() {
                    track_during_resync(engine, volume, params, state, depth);
                }
            })
            .map_err(|e| FrameError(format!("Failed to read a depth frame: {}", e)))?;

        let meshed = std::mem::take(&mut slot.mesh_calculated);
        let skipped = frames
            .timestamp_jump_ms
            .is_some_and(|jump| jump.abs() > params.large_skip_threshold_ms());
        let discontinuity = params.tracking.auto_reset_on_timestamp_skip
            && skipped
            && !meshed
            && !state.machine.is_first_frame()
            && slot.volume.is_some();
        if let Some(jump) = frames.timestamp_jump_ms.filter(|_| skipped) {
            debug!("Depth timestamps jumped by {} ms", jump);
        }

        ctx.frames = Some(frames);
        if discontinuity {
            Ok(Flow::ResetRequired("Reconstruction has been reset."))
        } else {
            Ok(Flow::Continue)
        }
    }

    /// Depth to metres, and color into depth space when it is synchronized.
    fn convert(&mut self, slot: &mut VolumeState, ctx: &mut FrameContext) -> Result<Flow, FrameError> {
        let Some(frames) = ctx.frames.as_ref() else {
            return Ok(Flow::SkipRest);
        };
        let (width, height) = frames.depth.dimensions();
        let params = &self.params;
        let buffers = &mut self.state.buffers;
        if buffers.ensure(width, height) {
            debug!("Working buffers resized to {}x{}", width, height);
        }

        self.engine
            .depth_to_float(
                &frames.depth.image,
                params.min_depth,
                params.max_depth,
                params.mirror_depth,
                &mut buffers.depth_float,
            )
            .map_err(|e| FrameError(format!("Depth conversion failed: {}", e)))?;

        let color_aligned = match (&frames.color, frames.color_synchronized) {
            (Some(color), true) => {
                buffers.aligned_color =
                    align_color_to_depth(&color.image, width, height, params.mirror_depth);
                true
            }
            _ => false,
        };
        ctx.depth_available = true;
        ctx.color_aligned = color_aligned;

        if slot.volume.is_none() {
            return Ok(Flow::SkipRest);
        }
        Ok(Flow::Continue)
    }

    fn track(&mut self, slot: &mut VolumeState, ctx: &mut FrameContext) -> Result<Flow, FrameError> {
        let Some(volume) = slot.volume.as_deref_mut() else {
            return Ok(Flow::SkipRest);
        };
        let params = &self.params;
        let state = &mut self.state;
        let engine = self.engine.as_ref();

        if state.machine.is_first_frame() {
            state.machine.record_success();
            return Ok(Flow::Continue);
        }

        let relocalization_ready = pose_database_ready(params, &state.pose_db);
        if !state.machine.is_lost() || !relocalization_ready {
            let tracker = select_tracker(params.effective_tracking_method(), &params.tracking);
            let was_failing = state.machine.has_failed_previously();
            let tracked = tracker.track(
                engine,
                volume,
                &mut state.buffers,
                &state.pose,
                state.machine.successful_frames(),
                ctx.calculate_delta,
            );
            match tracked {
                Ok(alignment) => {
                    if was_failing {
                        state.status.set("Camera tracking recovered.");
                    }
                    debug!("Tracked with residual energy {:.5}", alignment.energy);
                    state.pose = alignment.pose;
                    state.machine.record_success();
                }
                Err(failure) => {
                    state.machine.record_failure();
                    debug!("Tracking failed: {}", failure);
                    if relocalization_ready {
                        relocalize_frame(engine, volume, params, state, ctx.color_aligned);
                    } else if failure.is_call_failure() {
                        return Err(FrameError(format!("Camera tracking call failed: {}", failure)));
                    } else {
                        state.status.warn(TRACKING_FAILED);
                    }
                }
            }
        } else {
            state.machine.record_failure();
            relocalize_frame(engine, volume, params, state, ctx.color_aligned);
        }

        if state
            .machine
            .should_auto_reset(params.tracking.auto_reset_when_lost, params.tracking.lost_frames_before_reset)
        {
            return Ok(Flow::ResetRequired(
                "Camera tracking failed, automatically reset volume.",
            ));
        }
        Ok(Flow::Continue)
    }

    fn integrate(&mut self, slot: &mut VolumeState, ctx: &mut FrameContext) -> Result<Flow, FrameError> {
        let Some(volume) = slot.volume.as_deref_mut() else {
            return Ok(Flow::SkipRest);
        };
        let params = &self.params;
        let state = &mut self.state;

        let pose_db_ready = pose_database_ready(params, &state.pose_db);
        if !state.machine.should_integrate(
            pose_db_ready,
            params.pause_integration,
            params.pose_database.min_frames_after_failure,
        ) {
            return Ok(Flow::Continue);
        }

        let integrate_color = params.capture_color
            && ctx.color_aligned
            && state.machine.processed_frames() % params.color_integration_interval.max(1) as u64 == 0;
        let color = integrate_color.then_some(&state.buffers.aligned_color);
        volume
            .integrate(
                &state.buffers.depth_float,
                color,
                params.max_integration_weight,
                &state.pose,
            )
            .map_err(|e| FrameError(format!("Depth integration failed: {}", e)))?;

        if integrate_color {
            state.color_captured = true;
        }
        if pose_db_ready {
            state.integration_resumed = true;
        }
        state.machine.mark_integrated();
        Ok(Flow::Continue)
    }

    /// Render the volume for display, throttled while frames are queued.
    fn raycast(&mut self, slot: &mut VolumeState, ctx: &mut FrameContext) -> Result<Flow, FrameError> {
        let Some(volume) = slot.volume.as_deref_mut() else {
            return Ok(Flow::SkipRest);
        };
        let now = self.state.timer.absolute_time();
        let frame_waiting = self.sensor.as_ref().is_some_and(|s| s.depth_pending());
        if frame_waiting && now - self.state.last_raycast <= RENDER_INTERVAL_SECS {
            return Ok(Flow::Continue);
        }

        let buffers = &mut self.state.buffers;
        let color = self.params.capture_color.then_some(&mut buffers.raycast_color);
        volume
            .raycast(&self.state.pose, &mut buffers.raycast_cloud, color)
            .map_err(|e| FrameError(format!("Raycast failed: {}", e)))?;

        self.state.last_raycast = now;
        ctx.raycast_done = true;
        Ok(Flow::Continue)
    }

    fn update_pose_database(
        &mut self,
        _slot: &mut VolumeState,
        ctx: &mut FrameContext,
    ) -> Result<Flow, FrameError> {
        let settings = &self.params.pose_database;
        let state = &mut self.state;
        let Some(db) = state.pose_db.as_mut() else {
            return Ok(Flow::Continue);
        };
        let color_usable = ctx
            .frames
            .as_ref()
            .is_some_and(|f| f.color_synchronized || f.depth_only);
        if !settings.enabled
            || !state.machine.should_update_pose_database(
                settings.min_successful_frames,
                settings.process_interval,
                color_usable,
            )
        {
            return Ok(Flow::Continue);
        }

        let descriptor = FrameDescriptor::from_frame(
            &state.buffers.depth_float,
            ctx.color_aligned.then_some(&state.buffers.aligned_color),
            settings.feature_samples,
            settings.max_descriptor_depth,
        );
        let result = db.process_frame(&descriptor, &state.pose, settings.accept_distance);
        if result.trimmed {
            debug!("Pose database full, dropped the oldest pose");
        }
        Ok(Flow::Continue)
    }

    /// Publish the frame, update counters and run the periodic export.
    fn finish_frame(&mut self, slot: &mut VolumeState, ctx: &FrameContext, succeeded: bool) {
        let params = &self.params;
        let state = &mut self.state;
        let pose_db_ready = pose_database_ready(params, &state.pose_db);

        {
            let mut frame = self.shared.publisher.lock();
            let buffers = &state.buffers;
            frame.initialize(buffers.width, buffers.height);

            frame.integration_resumed = state.integration_resumed;
            if !pose_db_ready {
                state.integration_resumed = false;
            }

            if ctx.depth_available {
                visualize::depth_to_rgba(&buffers.depth_float, &mut frame.depth_rgba);
            }
            if ctx.raycast_done {
                if params.capture_color {
                    visualize::copy_rgba(&buffers.raycast_color, &mut frame.reconstruction_rgba);
                } else {
                    visualize::shade_surface(
                        &buffers.raycast_cloud,
                        params.display_surface_normals,
                        &mut frame.reconstruction_rgba,
                    );
                }
            }
            if state.machine.is_lost() && pose_db_ready {
                visualize::raycast_depth_to_rgba(&buffers.raycast_cloud, &mut frame.tracking_rgba);
            } else if ctx.calculate_delta {
                visualize::residuals_to_rgba(&buffers.residuals, &mut frame.tracking_rgba);
            }

            if succeeded {
                state.machine.complete_frame();
                state.total_frames += 1;
                state.fps_frames += 1;
                let now = state.timer.absolute_time();
                let elapsed = now - state.fps_since;
                if elapsed >= FPS_INTERVAL_SECS {
                    frame.frames_per_second = if state.machine.is_lost() {
                        0.0
                    } else {
                        (state.fps_frames as f64 / elapsed) as f32
                    };
                    state.fps_frames = 0;
                    state.fps_since = now;
                }
            }

            frame.status.clone_from(&state.status.message);
            frame.color_captured = state.color_captured;
            frame.tracking_state = state.machine.state();
            frame.device_memory_kb = state.device_memory_kb;
            frame.frame_index = state.machine.processed_frames();
            frame.total_frames = state.total_frames;
            frame.resets = state.resets;
        }

        if succeeded {
            self.count_export(slot);
        }
    }

    fn count_export(&mut self, slot: &mut VolumeState) {
        let export = &self.params.export;
        let Some(path) = export.path.clone() else {
            return;
        };
        if export.frame_interval == 0 {
            return;
        }
        self.state.export_frames += 1;
        if self.state.export_frames < export.frame_interval {
            return;
        }
        self.state.export_frames = 0;

        let Some(volume) = slot.volume.as_deref_mut() else {
            return;
        };
        match export_volume_mesh(volume, &path) {
            Ok(summary) => {
                self.state.status.set(format!(
                    "Exported {} vertices to {}",
                    summary.written_vertices,
                    summary.path.display()
                ));
                self.shared
                    .publisher
                    .notify(ProcessorEvent::MeshExported(summary));
                self.reset_reconstruction(slot);
            }
            Err(e) => {
                self.state.status.warn(format!("Mesh export failed: {}", e));
                self.shared
                    .publisher
                    .notify(ProcessorEvent::ExportFailed(e.to_string()));
            }
        }
    }
}

/// Whether relocalization has anything to work with.
fn pose_database_ready(params: &FusionParams, db: &Option<PoseDatabase>) -> bool {
    params.pose_database.enabled && db.as_ref().is_some_and(|db| !db.is_empty())
}

/// Track the frame that is about to be skipped by a corrective depth fetch.
fn track_during_resync(
    engine: &dyn ReconstructionEngine,
    volume: &mut dyn ReconstructionVolume,
    params: &FusionParams,
    state: &mut FusionState,
    depth: &DepthFrame,
) {
    if let Err(e) = engine.depth_to_float(
        &depth.image,
        params.min_depth,
        params.max_depth,
        params.mirror_depth,
        &mut state.buffers.depth_float,
    ) {
        debug!("Skipped tracking a resynchronized frame: {}", e);
        return;
    }

    let tracker = select_tracker(params.effective_tracking_method(), &params.tracking);
    match tracker.track(
        engine,
        volume,
        &mut state.buffers,
        &state.pose,
        state.machine.successful_frames(),
        false,
    ) {
        Ok(alignment) => {
            state.pose = alignment.pose;
            state.machine.record_success();
        }
        Err(failure) => {
            debug!("Tracking before resynchronization failed: {}", failure);
            state.machine.record_failure();
        }
    }
}

/// Look the current frame up in the pose database and adopt the best pose.
fn relocalize_frame(
    engine: &dyn ReconstructionEngine,
    volume: &mut dyn ReconstructionVolume,
    params: &FusionParams,
    state: &mut FusionState,
    color_aligned: bool,
) {
    let Some(db) = state.pose_db.as_ref() else {
        state.machine.relocalization_failed();
        return;
    };
    state.machine.begin_relocalization();

    let buffers = &mut state.buffers;
    if let Err(e) = engine.depth_to_point_cloud(&buffers.depth_float, &mut buffers.depth_cloud) {
        state.machine.relocalization_failed();
        state.status.warn(format!("Relocalization failed: {}", e));
        return;
    }

    let settings = &params.pose_database;
    let descriptor = FrameDescriptor::from_frame(
        &buffers.depth_float,
        color_aligned.then_some(&buffers.aligned_color),
        settings.feature_samples,
        settings.max_descriptor_depth,
    );
    let iterations = params.tracking.align_iterations;
    let result = relocalize(
        db,
        &descriptor,
        &RelocalizationSettings::from_params(params),
        |candidate| {
            volume.raycast(candidate, &mut buffers.raycast_cloud, None)?;
            engine.align_point_clouds(
                &buffers.raycast_cloud,
                &buffers.depth_cloud,
                iterations,
                candidate,
                None,
            )
        },
    );

    match result {
        Relocalization::Found { pose, energy, .. } => {
            debug!("Relocalized with residual energy {:.5}", energy);
            state.pose = pose;
            state.machine.record_success();
            state.status.set("Camera tracking relocalized.");
        }
        Relocalization::Failed {
            fallback_pose,
            smallest_energy,
            tested,
        } => {
            debug!(
                "No relocalization among {} candidates, smallest energy {:.5}",
                tested, smallest_energy
            );
            if let Some(pose) = fallback_pose {
                state.pose = pose;
            }
            state.machine.relocalization_failed();
            state.status.warn(SEARCHING_POSE_DATABASE);
        }
        Relocalization::Rejected { .. } | Relocalization::NoCandidates => {
            state.machine.relocalization_failed();
            state.status.warn(SEARCHING_POSE_DATABASE);
        }
    }
}

/// Calculate the volume's mesh and write it to `path`.
pub(crate) fn export_volume_mesh(
    volume: &mut dyn ReconstructionVolume,
    path: &Path,
) -> Result<ExportSummary, FusionError> {
    let vertices = volume.calculate_mesh()?;
    Ok(ExportJob::from_vertices(vertices).write_to(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedEngine;
    use crossbeam_channel::{bounded, unbounded};
    use image::Luma;
    use scan_capture::{DepthImage, ReplayFeed, ReplayProvider, ReplaySensor, StreamGeometry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connected_worker() -> (Worker, ReplayFeed, Arc<AtomicUsize>) {
        let (sensor, feed) = ReplaySensor::new(StreamGeometry::uniform(16, 12));
        let (provider, _handle) = ReplayProvider::with_sensor(sensor);
        let engine = ScriptedEngine::default();
        let raycasts = engine.raycast_counter();

        let (publisher, _events) = FramePublisher::new();
        let shared = Arc::new(Shared {
            staging: ParameterStaging::new(FusionParams::default()),
            publisher,
            volume: Mutex::new(VolumeState::default()),
        });
        let (_stop_tx, stop_rx) = bounded(1);
        let (status_tx, status_rx) = unbounded();
        let parts = WorkerParts {
            engine: Box::new(engine),
            provider: Box::new(provider),
        };
        let mut worker = Worker::new(parts, shared, stop_rx, status_tx, status_rx);
        worker.latch();
        worker.handle_status();
        assert!(worker.sensor.is_some());
        (worker, feed, raycasts)
    }

    fn push(feed: &ReplayFeed, timestamp_ms: i64) {
        let image = DepthImage::from_pixel(16, 12, Luma([1000]));
        feed.push_depth(DepthFrame::new(image, timestamp_ms, 0));
    }

    #[test]
    fn test_raycast_waits_for_empty_queue_within_render_interval() {
        let (mut worker, feed, raycasts) = connected_worker();
        for ts in [0, 33, 66] {
            push(&feed, ts);
        }
        worker.state.last_raycast = f64::INFINITY;

        worker.handle_frame();
        worker.handle_frame();
        assert_eq!(raycasts.load(Ordering::SeqCst), 0);

        worker.handle_frame();
        assert_eq!(raycasts.load(Ordering::SeqCst), 1);
        assert_eq!(worker.state.total_frames, 3);
    }

    #[test]
    fn test_raycast_runs_with_queued_frames_once_interval_elapsed() {
        let (mut worker, feed, raycasts) = connected_worker();
        push(&feed, 0);
        push(&feed, 33);
        worker.state.last_raycast = -RENDER_INTERVAL_SECS * 2.0;

        worker.handle_frame();
        assert_eq!(raycasts.load(Ordering::SeqCst), 1);
        assert!(worker.state.last_raycast >= 0.0);

        worker.handle_frame();
        assert_eq!(raycasts.load(Ordering::SeqCst), 2);
    }
}
