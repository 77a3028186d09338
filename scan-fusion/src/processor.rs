//! Control surface of the reconstruction pipeline.
//!
//! [`FusionProcessor`] is used from a single control thread. It owns the
//! worker thread's lifecycle and never blocks on frame processing except
//! where a call needs the volume itself ([`FusionProcessor::calculate_mesh`],
//! [`FusionProcessor::export_mesh`]).

use crate::engine::ReconstructionEngine;
use crate::error::FusionError;
use crate::params::FusionParams;
use crate::publisher::{FrameGuard, FramePublisher, ProcessorEvent};
use crate::staging::ParameterStaging;
use crate::worker::{Shared, VolumeState, Worker, WorkerParts, export_volume_mesh};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use glam::Vec3;
use parking_lot::Mutex;
use scan_capture::SensorProvider;
use scan_data::ExportSummary;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Starts and stops the fusion worker and forwards control commands to it.
///
/// Parameter changes are staged and picked up by the worker at the start
/// of its next iteration. Frames and status are published through
/// [`lock_frame`](Self::lock_frame) and the event receiver returned by
/// [`new`](Self::new).
pub struct FusionProcessor {
    shared: Arc<Shared>,
    /// Engine and provider while no worker holds them.
    parts: Option<WorkerParts>,
    worker: Option<JoinHandle<WorkerParts>>,
    stop_tx: Option<Sender<()>>,
    status_tx: Sender<()>,
    status_rx: Receiver<()>,
}

impl FusionProcessor {
    /// Create a stopped processor.
    pub fn new(
        engine: Box<dyn ReconstructionEngine>,
        provider: Box<dyn SensorProvider>,
        params: FusionParams,
    ) -> Result<(Self, Receiver<ProcessorEvent>), FusionError> {
        params.validate()?;
        let (publisher, events) = FramePublisher::new();
        let (status_tx, status_rx) = unbounded();
        let processor = Self {
            shared: Arc::new(Shared {
                staging: ParameterStaging::new(params),
                publisher,
                volume: Mutex::new(VolumeState::default()),
            }),
            parts: Some(WorkerParts { engine, provider }),
            worker: None,
            stop_tx: None,
            status_tx,
            status_rx,
        };
        Ok((processor, events))
    }

    /// Spawn the worker thread.
    pub fn start(&mut self) -> Result<(), FusionError> {
        if self.worker.is_some() {
            return Err(FusionError::AlreadyRunning);
        }
        let parts = self.parts.take().ok_or(FusionError::WorkerUnavailable)?;

        let (stop_tx, stop_rx) = bounded(1);
        let worker = Worker::new(
            parts,
            Arc::clone(&self.shared),
            stop_rx,
            self.status_tx.clone(),
            self.status_rx.clone(),
        );
        let handle = thread::Builder::new()
            .name("fusion-worker".to_string())
            .spawn(move || worker.run())
            .map_err(FusionError::Spawn)?;

        self.worker = Some(handle);
        self.stop_tx = Some(stop_tx);
        info!("Fusion processor started");
        Ok(())
    }

    /// Signal the worker and wait for it to exit. Stopping a stopped
    /// processor does nothing.
    pub fn stop(&mut self) -> Result<(), FusionError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        match handle.join() {
            Ok(parts) => {
                self.parts = Some(parts);
                info!("Fusion processor stopped");
                Ok(())
            }
            Err(_) => Err(FusionError::WorkerPanicked),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stage a new parameter set for the worker's next iteration.
    pub fn set_params(&self, params: FusionParams) -> Result<(), FusionError> {
        params.validate()?;
        self.shared.staging.set_next(params);
        Ok(())
    }

    /// The most recently staged parameters.
    pub fn params(&self) -> FusionParams {
        self.shared.staging.next()
    }

    /// Reset the reconstruction before the next frame is processed.
    pub fn request_reset(&self) {
        self.shared.staging.request_reset();
    }

    /// Ask the sensor provider to take the device over from another
    /// application.
    pub fn resolve_sensor_conflict(&self) {
        self.shared.staging.request_conflict_resolution();
        let _ = self.status_tx.send(());
    }

    /// Lock the published frame for reading.
    ///
    /// The worker cannot publish while the guard is alive. Drop it before
    /// calling any other method on the processor.
    pub fn lock_frame(&self) -> FrameGuard<'_> {
        self.shared.publisher.lock()
    }

    /// Triangle-soup vertices of the current reconstruction, in world space.
    ///
    /// Waits for the frame in progress. The next timestamp jump is not
    /// treated as a stream discontinuity.
    pub fn calculate_mesh(&self) -> Result<Vec<Vec3>, FusionError> {
        let mut slot = self.shared.volume.lock();
        let volume = slot
            .volume
            .as_deref_mut()
            .ok_or(FusionError::VolumeNotInitialized)?;
        let vertices = volume.calculate_mesh()?;
        slot.mesh_calculated = true;
        Ok(vertices)
    }

    /// Write the current reconstruction to `path` without resetting it.
    pub fn export_mesh(&self, path: &Path) -> Result<ExportSummary, FusionError> {
        let mut slot = self.shared.volume.lock();
        let volume = slot
            .volume
            .as_deref_mut()
            .ok_or(FusionError::VolumeNotInitialized)?;
        let summary = export_volume_mesh(volume, path)?;
        slot.mesh_calculated = true;
        Ok(summary)
    }

    pub fn is_volume_initialized(&self) -> bool {
        self.shared.volume.lock().volume.is_some()
    }
}

impl Drop for FusionProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Fusion worker did not stop cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StationaryEngine;
    use crate::params::{ProcessorType, VolumeParams};
    use crate::publisher::PublishedFrame;
    use crate::tracking::TrackingState;
    use image::{Luma, Rgba, RgbaImage};
    use scan_capture::{
        ColorFrame, DepthFrame, DepthImage, ProviderHandle, ReplayFeed, ReplayProvider, ReplaySensor,
        SensorStatus, StreamGeometry,
    };
    use std::time::{Duration, Instant};

    const WIDTH: u32 = 32;
    const HEIGHT: u32 = 24;

    fn small_params() -> FusionParams {
        let mut params = FusionParams::default();
        params.volume = VolumeParams {
            voxels_per_meter: 64.0,
            resolution_x: 128,
            resolution_y: 128,
            resolution_z: 128,
            ..VolumeParams::default()
        };
        params
    }

    fn processor_with(
        params: FusionParams,
    ) -> (FusionProcessor, Receiver<ProcessorEvent>, ReplayFeed, ProviderHandle) {
        let (sensor, feed) = ReplaySensor::new(StreamGeometry::uniform(WIDTH, HEIGHT));
        let (provider, handle) = ReplayProvider::with_sensor(sensor);
        let (processor, events) = FusionProcessor::new(
            Box::new(StationaryEngine::new()),
            Box::new(provider),
            params,
        )
        .unwrap();
        (processor, events, feed, handle)
    }

    fn push(feed: &ReplayFeed, timestamp_ms: i64, millimetres: u16) {
        let image = DepthImage::from_pixel(WIDTH, HEIGHT, Luma([millimetres]));
        feed.push_depth(DepthFrame::new(image, timestamp_ms, 0));
    }

    fn push_color(feed: &ReplayFeed, timestamp_ms: i64) {
        let image = RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([180, 120, 60, 255]));
        feed.push_color(ColorFrame::new(image, timestamp_ms, 0));
    }

    fn wait_for(processor: &FusionProcessor, done: impl Fn(&PublishedFrame) -> bool) -> PublishedFrame {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            {
                let frame = processor.lock_frame();
                if done(&frame) {
                    return frame.clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for the worker");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_frames(processor: &FusionProcessor, total: u64) -> PublishedFrame {
        wait_for(processor, |f| f.total_frames >= total)
    }

    fn wait_event<T>(
        events: &Receiver<ProcessorEvent>,
        mut pick: impl FnMut(ProcessorEvent) -> Option<T>,
    ) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = events
                .recv_timeout(remaining)
                .expect("timed out waiting for an event");
            if let Some(picked) = pick(event) {
                return picked;
            }
        }
    }

    #[test]
    fn test_first_frame_starts_tracking() {
        let (mut processor, events, feed, _handle) = processor_with(small_params());
        processor.start().unwrap();
        push(&feed, 0, 1000);

        let frame = wait_frames(&processor, 1);
        assert_eq!(frame.tracking_state, TrackingState::Tracking);
        assert_eq!(frame.frame_index, 1);
        assert_eq!(frame.resets, 1);
        assert_eq!(frame.depth_rgba.dimensions(), (WIDTH, HEIGHT));
        assert!(processor.is_volume_initialized());
        wait_event(&events, |e| matches!(e, ProcessorEvent::FrameReady).then_some(()));
        processor.stop().unwrap();
    }

    #[test]
    fn test_static_scene_keeps_tracking() {
        let (mut processor, _events, feed, _handle) = processor_with(small_params());
        processor.start().unwrap();
        for i in 0..6 {
            push(&feed, i * 33, 1000);
        }

        let frame = wait_frames(&processor, 6);
        assert_eq!(frame.tracking_state, TrackingState::Tracking);
        assert_eq!(frame.resets, 1);
        assert!(!processor.calculate_mesh().unwrap().is_empty());
    }

    #[test]
    fn test_periodic_export_resets_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.txt");
        let mut params = small_params();
        params.export.path = Some(path.clone());
        params.export.frame_interval = 3;

        let (mut processor, events, feed, _handle) = processor_with(params);
        processor.start().unwrap();
        for i in 0..3 {
            push(&feed, i * 33, 1000);
        }

        let summary = wait_event(&events, |e| match e {
            ProcessorEvent::MeshExported(summary) => Some(summary),
            _ => None,
        });
        assert_eq!(summary.path, path);
        assert!(summary.written_vertices > 0);
        assert!(path.exists());
        assert!(!scan_data::is_export_in_progress(&path));

        push(&feed, 99, 1000);
        let frame = wait_frames(&processor, 4);
        assert_eq!(frame.resets, 2);
        assert_eq!(frame.frame_index, 1);
    }

    #[test]
    fn test_timestamp_discontinuity_resets_once() {
        let (mut processor, _events, feed, _handle) = processor_with(small_params());
        processor.start().unwrap();
        for ts in [0, 33, 66, 20_000, 20_033] {
            push(&feed, ts, 1000);
        }

        let frame = wait_frames(&processor, 5);
        assert_eq!(frame.resets, 2);
        assert_eq!(frame.frame_index, 2);
        assert_eq!(frame.status, "Reconstruction has been reset.");
    }

    #[test]
    fn test_mesh_calculation_suppresses_discontinuity() {
        let (mut processor, _events, feed, _handle) = processor_with(small_params());
        processor.start().unwrap();
        push(&feed, 0, 1000);
        push(&feed, 33, 1000);
        wait_frames(&processor, 2);

        assert!(!processor.calculate_mesh().unwrap().is_empty());
        push(&feed, 20_000, 1000);
        let frame = wait_frames(&processor, 3);
        assert_eq!(frame.resets, 1);
        assert_eq!(frame.frame_index, 3);
    }

    #[test]
    fn test_lost_tracking_auto_resets() {
        let mut params = small_params();
        params.tracking.auto_reset_when_lost = true;
        params.tracking.lost_frames_before_reset = 3;

        let (mut processor, _events, feed, _handle) = processor_with(params);
        processor.start().unwrap();
        push(&feed, 0, 1000);
        push(&feed, 33, 1000);
        let frame = wait_frames(&processor, 2);
        assert_eq!(frame.tracking_state, TrackingState::Tracking);

        push(&feed, 66, 3000);
        let frame = wait_frames(&processor, 3);
        assert_eq!(frame.tracking_state, TrackingState::Lost);
        assert_eq!(
            frame.status,
            "Camera tracking failed! Align the camera to the last tracked position."
        );

        push(&feed, 99, 3000);
        push(&feed, 132, 3000);
        let frame = wait_frames(&processor, 5);
        assert_eq!(frame.resets, 2);
        assert_eq!(
            frame.status,
            "Camera tracking failed, automatically reset volume."
        );
    }

    #[test]
    fn test_relocalizes_from_pose_database() {
        let mut params = small_params();
        params.pose_database.enabled = true;
        params.pose_database.max_history = 16;
        params.pose_database.min_successful_frames = 1;
        params.pose_database.min_frames_after_failure = 1;
        params.pose_database.process_interval = 1;

        let (mut processor, _events, feed, _handle) = processor_with(params);
        processor.start().unwrap();
        // Alternating depth keeps alignment energies above zero.
        for (i, mm) in [1000, 1001, 1000].into_iter().enumerate() {
            push(&feed, i as i64 * 33, mm);
        }
        wait_frames(&processor, 3);

        push(&feed, 99, 3000);
        let frame = wait_frames(&processor, 4);
        assert_eq!(frame.tracking_state, TrackingState::Lost);

        push(&feed, 132, 1001);
        let frame = wait_frames(&processor, 5);
        assert_eq!(frame.tracking_state, TrackingState::Tracking);
        assert_eq!(frame.status, "Camera tracking relocalized.");
        assert_eq!(frame.resets, 1);
        assert!(frame.integration_resumed);
    }

    #[test]
    fn test_relocalizes_without_color_after_colored_history() {
        let mut params = small_params();
        params.pose_database.enabled = true;
        params.pose_database.max_history = 16;
        params.pose_database.min_successful_frames = 1;
        params.pose_database.min_frames_after_failure = 1;
        params.pose_database.process_interval = 1;

        let (mut processor, _events, feed, _handle) = processor_with(params);
        processor.start().unwrap();
        for (i, mm) in [1000, 1001, 1000, 3000].into_iter().enumerate() {
            let ts = i as i64 * 33;
            push_color(&feed, ts);
            push(&feed, ts, mm);
            wait_frames(&processor, i as u64 + 1);
        }
        let frame = wait_frames(&processor, 4);
        assert_eq!(frame.tracking_state, TrackingState::Lost);

        // The color stream stalls while the camera is brought back.
        push(&feed, 132, 1001);
        let frame = wait_frames(&processor, 5);
        assert_eq!(frame.tracking_state, TrackingState::Tracking);
        assert_eq!(frame.status, "Camera tracking relocalized.");
    }

    #[test]
    fn test_request_reset() {
        let (mut processor, _events, feed, _handle) = processor_with(small_params());
        processor.start().unwrap();
        push(&feed, 0, 1000);
        push(&feed, 33, 1000);
        wait_frames(&processor, 2);

        processor.request_reset();
        push(&feed, 66, 1000);
        let frame = wait_frames(&processor, 3);
        assert_eq!(frame.resets, 2);
        assert_eq!(frame.frame_index, 1);
    }

    #[test]
    fn test_unavailable_device_degrades() {
        let mut params = small_params();
        params.volume.processor = ProcessorType::Gpu;
        let (mut processor, _events, feed, _handle) = processor_with(params);
        processor.start().unwrap();
        push(&feed, 0, 1000);

        let frame = wait_frames(&processor, 1);
        assert!(
            frame
                .status
                .starts_with("Failed to find a compatible reconstruction device"),
            "{}",
            frame.status
        );
        assert!(!processor.is_volume_initialized());
        assert!(matches!(
            processor.calculate_mesh(),
            Err(FusionError::VolumeNotInitialized)
        ));

        // Switching to a supported device recreates the volume.
        processor.set_params(small_params()).unwrap();
        push(&feed, 33, 1000);
        wait_frames(&processor, 2);
        assert!(processor.is_volume_initialized());
    }

    #[test]
    fn test_sensor_conflict_resolution() {
        let (provider, handle) = ReplayProvider::new();
        let (sensor, feed) = ReplaySensor::new(StreamGeometry::uniform(WIDTH, HEIGHT));
        handle.attach_in_use(sensor);
        let (mut processor, events) = FusionProcessor::new(
            Box::new(StationaryEngine::new()),
            Box::new(provider),
            small_params(),
        )
        .unwrap();
        processor.start().unwrap();

        wait_for(&processor, |f| {
            f.status == SensorStatus::InUseByOther.to_string()
        });
        wait_event(&events, |e| {
            matches!(e, ProcessorEvent::SensorStatus(SensorStatus::InUseByOther)).then_some(())
        });

        processor.resolve_sensor_conflict();
        push(&feed, 0, 1000);
        let frame = wait_frames(&processor, 1);
        assert_eq!(frame.tracking_state, TrackingState::Tracking);
        assert_eq!(handle.status(), SensorStatus::Connected);
    }

    #[test]
    fn test_stop_and_restart() {
        let (mut processor, _events, feed, handle) = processor_with(small_params());
        assert!(matches!(processor.stop(), Ok(())));
        processor.start().unwrap();
        assert!(matches!(processor.start(), Err(FusionError::AlreadyRunning)));
        push(&feed, 0, 1000);
        wait_frames(&processor, 1);

        processor.stop().unwrap();
        assert!(!processor.is_running());
        assert!(processor.is_volume_initialized());

        let (sensor, feed) = ReplaySensor::new(StreamGeometry::uniform(WIDTH, HEIGHT));
        handle.attach(sensor);
        processor.start().unwrap();
        for i in 0..3 {
            push(&feed, i * 33, 1000);
        }
        let frame = wait_for(&processor, |f| f.total_frames == 3);
        assert_eq!(frame.resets, 1);
        assert_eq!(frame.tracking_state, TrackingState::Tracking);
    }

    #[test]
    fn test_locked_frame_blocks_publishing() {
        let (mut processor, _events, feed, _handle) = processor_with(small_params());
        processor.start().unwrap();
        push(&feed, 0, 1000);
        wait_frames(&processor, 1);

        let guard = processor.lock_frame();
        push(&feed, 33, 1000);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(guard.total_frames, 1);
        drop(guard);

        wait_frames(&processor, 2);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut params = small_params();
        params.min_depth = 5.0;
        params.max_depth = 1.0;
        let (processor, _events, _feed, _handle) = processor_with(small_params());
        assert!(matches!(
            processor.set_params(params),
            Err(FusionError::Params(_))
        ));
        assert_eq!(processor.params(), small_params());
    }
}
