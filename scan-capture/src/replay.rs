//! Replay sensor: feeds recorded or generated frames through the
//! [`DepthSensor`] interface.
//!
//! A [`ReplaySensor`] is the device side; its [`ReplayFeed`] is the producer
//! side and may live on any thread. [`ReplayProvider`] wraps attach, detach
//! and "in use by another application" events so device hot-plugging can
//! be exercised without hardware.

use crate::sequence::Recording;
use crate::source::{
    CaptureError, ColorFrame, DepthFrame, DepthSensor, SensorChange, SensorProvider, SensorStatus,
    StreamGeometry,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Default)]
struct Queues {
    depth: VecDeque<DepthFrame>,
    color: VecDeque<ColorFrame>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<Queues>,
    arrived: Condvar,
}

/// A sensor whose frames are pushed in by a [`ReplayFeed`].
pub struct ReplaySensor {
    shared: Arc<Shared>,
    geometry: StreamGeometry,
    signal: Receiver<()>,
    near_mode: bool,
}

impl ReplaySensor {
    /// Create a sensor and the feed that supplies it.
    pub fn new(geometry: StreamGeometry) -> (Self, ReplayFeed) {
        let shared = Arc::new(Shared::default());
        let (signal_tx, signal_rx) = unbounded();
        let sensor = Self {
            shared: shared.clone(),
            geometry,
            signal: signal_rx,
            near_mode: false,
        };
        let feed = ReplayFeed {
            shared,
            signal: signal_tx,
        };
        (sensor, feed)
    }

    /// Whether near mode was last requested.
    pub fn near_mode(&self) -> bool {
        self.near_mode
    }
}

impl DepthSensor for ReplaySensor {
    fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    fn frame_signal(&self) -> Receiver<()> {
        self.signal.clone()
    }

    fn depth_pending(&self) -> bool {
        !self.shared.queues.lock().depth.is_empty()
    }

    fn color_pending(&self) -> bool {
        !self.shared.queues.lock().color.is_empty()
    }

    fn next_depth(&mut self, timeout: Duration) -> Result<DepthFrame, CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.shared.queues.lock();
        loop {
            if let Some(frame) = queues.depth.pop_front() {
                return Ok(frame);
            }
            if queues.closed {
                return Err(CaptureError::StreamEnded);
            }
            if self.shared.arrived.wait_until(&mut queues, deadline).timed_out() {
                return queues.depth.pop_front().ok_or(CaptureError::Timeout);
            }
        }
    }

    fn next_color(&mut self, timeout: Duration) -> Result<ColorFrame, CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.shared.queues.lock();
        loop {
            if let Some(frame) = queues.color.pop_front() {
                return Ok(frame);
            }
            if queues.closed {
                return Err(CaptureError::StreamEnded);
            }
            if self.shared.arrived.wait_until(&mut queues, deadline).timed_out() {
                return queues.color.pop_front().ok_or(CaptureError::Timeout);
            }
        }
    }

    fn set_near_mode(&mut self, near: bool) -> Result<(), CaptureError> {
        debug!("Replay sensor near mode: {}", near);
        self.near_mode = near;
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut queues = self.shared.queues.lock();
        queues.closed = true;
        queues.depth.clear();
        queues.color.clear();
        self.shared.arrived.notify_all();
        info!("Replay sensor shut down");
    }
}

/// Producer side of a [`ReplaySensor`].
#[derive(Clone)]
pub struct ReplayFeed {
    shared: Arc<Shared>,
    signal: Sender<()>,
}

impl ReplayFeed {
    /// Queue a depth frame and signal its arrival.
    pub fn push_depth(&self, frame: DepthFrame) {
        {
            let mut queues = self.shared.queues.lock();
            if queues.closed {
                return;
            }
            queues.depth.push_back(frame);
            self.shared.arrived.notify_all();
        }
        // The receiver may already be gone if the sensor was dropped.
        let _ = self.signal.send(());
    }

    /// Queue a color frame.
    pub fn push_color(&self, frame: ColorFrame) {
        let mut queues = self.shared.queues.lock();
        if queues.closed {
            return;
        }
        queues.color.push_back(frame);
        self.shared.arrived.notify_all();
    }

    /// End the stream. Frames already queued can still be fetched.
    pub fn close(&self) {
        let mut queues = self.shared.queues.lock();
        queues.closed = true;
        self.shared.arrived.notify_all();
    }

    /// Whether the stream was closed by either side.
    pub fn is_closed(&self) -> bool {
        self.shared.queues.lock().closed
    }

    /// Play a recording on a background thread at a fixed frame rate.
    pub fn spawn_playback(self, recording: Recording, options: PlaybackOptions) -> Playback {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::spawn(move || run_playback(self, recording, options, thread_stop));
        Playback {
            stop,
            handle: Some(handle),
        }
    }
}

/// Settings for [`ReplayFeed::spawn_playback`].
#[derive(Debug, Clone, Copy)]
pub struct PlaybackOptions {
    /// Frames per second; zero or less pushes as fast as possible.
    pub fps: f32,
    /// Restart from the first frame after the last one. Timestamps restart
    /// too, which looks like a stream discontinuity to the consumer.
    pub looped: bool,
    /// Offset added to color timestamps, simulating stream skew.
    pub color_lag_ms: i64,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            fps: 30.0,
            looped: false,
            color_lag_ms: 0,
        }
    }
}

/// Handle to a running playback thread.
pub struct Playback {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl Playback {
    /// Whether the playback thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Stop playback and return the number of depth frames pushed.
    pub fn stop(&mut self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        self.join_inner()
    }

    /// Wait for playback to end on its own.
    pub fn join(mut self) -> u64 {
        self.join_inner()
    }

    fn join_inner(&mut self) -> u64 {
        self.handle
            .take()
            .map(|h| h.join().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_playback(
    feed: ReplayFeed,
    recording: Recording,
    options: PlaybackOptions,
    stop: Arc<AtomicBool>,
) -> u64 {
    let interval = (options.fps > 0.0).then(|| Duration::from_secs_f32(1.0 / options.fps));
    let mut pushed = 0u64;

    info!(
        "Playback started: {} frames at {} fps (looped: {})",
        recording.len(),
        options.fps,
        options.looped
    );

    'outer: loop {
        for frame in recording.frames() {
            if stop.load(Ordering::Relaxed) || feed.is_closed() {
                break 'outer;
            }
            if let Some(color) = &frame.color {
                feed.push_color(ColorFrame::new(
                    color.clone(),
                    frame.timestamp_ms + options.color_lag_ms,
                    pushed,
                ));
            }
            feed.push_depth(DepthFrame::new(frame.depth.clone(), frame.timestamp_ms, pushed));
            pushed += 1;

            if let Some(interval) = interval {
                thread::sleep(interval);
            }
        }
        if !options.looped {
            break;
        }
    }

    feed.close();
    info!("Playback finished after {} frames", pushed);
    pushed
}

struct ProviderState {
    pending: Option<ReplaySensor>,
    status: SensorStatus,
    conflict: bool,
    changes: VecDeque<SensorChange>,
    watchers: Vec<Sender<()>>,
}

impl ProviderState {
    fn publish(&mut self, change: SensorChange) {
        self.changes.push_back(change);
        self.watchers.retain(|w| w.send(()).is_ok());
    }
}

/// A [`SensorProvider`] driven by a [`ProviderHandle`].
pub struct ReplayProvider {
    state: Arc<Mutex<ProviderState>>,
}

/// Simulates device events for a [`ReplayProvider`].
#[derive(Clone)]
pub struct ProviderHandle {
    state: Arc<Mutex<ProviderState>>,
}

impl ReplayProvider {
    /// A provider with no device attached.
    pub fn new() -> (Self, ProviderHandle) {
        let state = Arc::new(Mutex::new(ProviderState {
            pending: None,
            status: SensorStatus::NotConnected,
            conflict: false,
            changes: VecDeque::new(),
            watchers: Vec::new(),
        }));
        (
            Self {
                state: state.clone(),
            },
            ProviderHandle { state },
        )
    }

    /// A provider with `sensor` already attached.
    pub fn with_sensor(sensor: ReplaySensor) -> (Self, ProviderHandle) {
        let (provider, handle) = Self::new();
        handle.attach(sensor);
        (provider, handle)
    }
}

impl SensorProvider for ReplayProvider {
    fn watch(&mut self, notify: Sender<()>) {
        let mut state = self.state.lock();
        if !state.changes.is_empty() {
            let _ = notify.send(());
        }
        state.watchers.push(notify);
    }

    fn poll_change(&mut self) -> SensorChange {
        self.state
            .lock()
            .changes
            .pop_front()
            .unwrap_or(SensorChange::Unchanged)
    }

    fn connect(&mut self) -> Result<Box<dyn DepthSensor>, CaptureError> {
        let mut state = self.state.lock();
        if state.conflict {
            return Err(CaptureError::OpenFailed(
                SensorStatus::InUseByOther.to_string(),
            ));
        }
        let sensor = state
            .pending
            .take()
            .ok_or_else(|| CaptureError::DeviceNotFound("no replay sensor attached".to_string()))?;
        info!("Replay sensor connected");
        Ok(Box::new(sensor))
    }

    fn resolve_conflict(&mut self) -> bool {
        let mut state = self.state.lock();
        if !state.conflict {
            return false;
        }
        state.conflict = false;
        state.status = SensorStatus::Connected;
        state.publish(SensorChange::SensorAvailable);
        info!("Sensor conflict resolved");
        true
    }

    fn status(&self) -> SensorStatus {
        self.state.lock().status.clone()
    }
}

impl ProviderHandle {
    /// Plug in a sensor.
    pub fn attach(&self, sensor: ReplaySensor) {
        let mut state = self.state.lock();
        state.pending = Some(sensor);
        state.conflict = false;
        state.status = SensorStatus::Connected;
        state.publish(SensorChange::SensorAvailable);
    }

    /// Plug in a sensor that another application currently holds.
    pub fn attach_in_use(&self, sensor: ReplaySensor) {
        let mut state = self.state.lock();
        state.pending = Some(sensor);
        state.conflict = true;
        state.status = SensorStatus::InUseByOther;
        state.publish(SensorChange::Status(SensorStatus::InUseByOther));
    }

    /// Unplug the current sensor.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        state.conflict = false;
        state.status = SensorStatus::NotConnected;
        state.publish(SensorChange::SensorLost);
    }

    /// Current simulated status.
    pub fn status(&self) -> SensorStatus {
        self.state.lock().status.clone()
    }
}
