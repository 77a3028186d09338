//! Single-slot published frame and consumer notifications.
//!
//! The worker is the only writer; readers lock the frame through
//! [`FramePublisher::lock`] and see a consistent snapshot until the guard is
//! dropped. A worker iteration that finishes in the meantime waits on the
//! same lock before it can publish.

use crate::tracking::TrackingState;
use crossbeam_channel::{Receiver, Sender, unbounded};
use image::RgbaImage;
use parking_lot::{Mutex, MutexGuard};
use scan_capture::SensorStatus;
use scan_data::ExportSummary;

/// Scoped read access to the published frame. Dropping it unlocks.
pub type FrameGuard<'a> = MutexGuard<'a, PublishedFrame>;

/// The most recently completed, display-ready frame.
#[derive(Debug, Clone, Default)]
pub struct PublishedFrame {
    pub width: u32,
    pub height: u32,
    pub depth_rgba: RgbaImage,
    pub reconstruction_rgba: RgbaImage,
    pub tracking_rgba: RgbaImage,
    /// Last human-readable status; empty when there is nothing to report.
    pub status: String,
    pub frames_per_second: f32,
    pub color_captured: bool,
    pub integration_resumed: bool,
    pub tracking_state: TrackingState,
    /// Memory reported by the compute device, in kilobytes.
    pub device_memory_kb: u64,
    /// Frames processed since the last reset.
    pub frame_index: u64,
    /// Frames processed since the worker started.
    pub total_frames: u64,
    /// Volume resets since the worker started, including volume creation.
    pub resets: u64,
}

impl PublishedFrame {
    /// Size the images for `width` x `height`, keeping them when unchanged.
    pub fn initialize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        self.depth_rgba = RgbaImage::new(width, height);
        self.reconstruction_rgba = RgbaImage::new(width, height);
        self.tracking_rgba = RgbaImage::new(width, height);
    }
}

/// Notifications sent from the worker to the consumer.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    /// A new frame was published.
    FrameReady,
    SensorStatus(SensorStatus),
    MeshExported(ExportSummary),
    ExportFailed(String),
}

/// Owner of the published frame and the event channel.
#[derive(Debug)]
pub struct FramePublisher {
    frame: Mutex<PublishedFrame>,
    events: Sender<ProcessorEvent>,
}

impl FramePublisher {
    pub fn new() -> (Self, Receiver<ProcessorEvent>) {
        let (events, receiver) = unbounded();
        let publisher = Self {
            frame: Mutex::new(PublishedFrame::default()),
            events,
        };
        (publisher, receiver)
    }

    /// Lock the frame. Release the guard before issuing further commands.
    pub fn lock(&self) -> FrameGuard<'_> {
        self.frame.lock()
    }

    /// Send an event; a consumer that went away is not an error.
    pub fn notify(&self, event: ProcessorEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a frame carrying only `status` and report it as ready.
    pub fn notify_empty_frame(&self, status: &str) {
        {
            let mut frame = self.lock();
            frame.frames_per_second = 0.0;
            frame.status.clear();
            frame.status.push_str(status);
        }
        self.notify(ProcessorEvent::FrameReady);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_initialize_keeps_buffers() {
        let mut frame = PublishedFrame::default();
        frame.initialize(4, 2);
        frame.depth_rgba.put_pixel(0, 0, image::Rgba([1, 2, 3, 4]));
        frame.initialize(4, 2);
        assert_eq!(frame.depth_rgba.get_pixel(0, 0).0, [1, 2, 3, 4]);
        frame.initialize(2, 2);
        assert_eq!(frame.tracking_rgba.dimensions(), (2, 2));
    }

    #[test]
    fn test_empty_frame_notification() {
        let (publisher, events) = FramePublisher::new();
        publisher.lock().frames_per_second = 30.0;
        publisher.notify_empty_frame("No ready sensor found");

        assert!(matches!(events.try_recv(), Ok(ProcessorEvent::FrameReady)));
        let frame = publisher.lock();
        assert_eq!(frame.frames_per_second, 0.0);
        assert_eq!(frame.status, "No ready sensor found");
    }

    #[test]
    fn test_locked_frame_is_stable() {
        let (publisher, _events) = FramePublisher::new();
        let publisher = Arc::new(publisher);

        let guard = publisher.lock();
        let writer = {
            let publisher = publisher.clone();
            thread::spawn(move || publisher.lock().frame_index = 7)
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(guard.frame_index, 0);
        drop(guard);

        writer.join().unwrap();
        assert_eq!(publisher.lock().frame_index, 7);
    }
}
