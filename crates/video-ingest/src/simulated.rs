//! Synthetic camera used for demos and tests.
//!
//! Frames are a moving BGR gradient paced at a fixed rate, so downstream
//! timing behaves like a real device without any hardware attached.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    camera::{CameraBackend, CameraDevice},
    types::{CaptureError, Frame, FrameFormat, Resolution},
};

/// Number of successful opens performed by a [`SimulatedBackend`].
#[derive(Clone, Debug, Default)]
pub struct OpenCounter(Arc<AtomicU32>);

impl OpenCounter {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Failure injector shared with every device opened by a backend.
#[derive(Clone, Debug, Default)]
pub struct ReadFailures(Arc<AtomicU32>);

impl ReadFailures {
    /// Make the next `count` reads fail.
    pub fn fail_next(&self, count: u32) {
        self.0.store(count, Ordering::SeqCst);
    }

    fn consume(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone, Debug)]
pub struct SimulatedBackend {
    fps: f64,
    negotiated: Option<Resolution>,
    unavailable: Vec<i32>,
    opens: OpenCounter,
    failures: ReadFailures,
}

impl SimulatedBackend {
    /// Backend producing `fps` frames per second; `0` means unpaced.
    pub fn new(fps: f64) -> Self {
        Self {
            fps,
            negotiated: None,
            unavailable: Vec::new(),
            opens: OpenCounter::default(),
            failures: ReadFailures::default(),
        }
    }

    /// Report this resolution regardless of what was requested.
    pub fn with_negotiated_resolution(mut self, resolution: Resolution) -> Self {
        self.negotiated = Some(resolution);
        self
    }

    /// Refuse to open the given device index.
    pub fn with_unavailable_device(mut self, device: i32) -> Self {
        self.unavailable.push(device);
        self
    }

    pub fn open_counter(&self) -> OpenCounter {
        self.opens.clone()
    }

    pub fn read_failures(&self) -> ReadFailures {
        self.failures.clone()
    }
}

impl CameraBackend for SimulatedBackend {
    fn open(
        &self,
        device: i32,
        requested: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CaptureError> {
        if device < 0 || self.unavailable.contains(&device) {
            return Err(CaptureError::Open { device });
        }
        self.opens.0.fetch_add(1, Ordering::SeqCst);
        let interval = (self.fps > 0.0).then(|| Duration::from_secs_f64(1.0 / self.fps));
        Ok(Box::new(SimulatedDevice {
            device,
            resolution: self.negotiated.unwrap_or(requested),
            interval,
            next_due: Instant::now(),
            counter: 0,
            failures: self.failures.clone(),
        }))
    }
}

struct SimulatedDevice {
    device: i32,
    resolution: Resolution,
    interval: Option<Duration>,
    next_due: Instant,
    counter: u64,
    failures: ReadFailures,
}

impl CameraDevice for SimulatedDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if let Some(interval) = self.interval {
            let now = Instant::now();
            if self.next_due > now {
                thread::sleep(self.next_due - now);
            }
            self.next_due = self.next_due.max(now) + interval;
        }
        if self.failures.consume() {
            return Err(CaptureError::Read {
                device: self.device,
            });
        }

        let Resolution { width, height } = self.resolution;
        let shift = (self.counter % 256) as usize;
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height as usize {
            for x in 0..width as usize {
                data.push(((x + shift) % 256) as u8);
                data.push(((y + shift) % 256) as u8);
                data.push(((x + y) % 256) as u8);
            }
        }
        self.counter = self.counter.wrapping_add(1);

        Ok(Frame {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_requested_size() {
        let backend = SimulatedBackend::new(0.0);
        let mut device = backend.open(0, Resolution::new(6, 8)).unwrap();
        let frame = device.read().unwrap();
        assert_eq!(frame.data.len(), 6 * 8 * 3);
        assert_eq!(frame.format, FrameFormat::Bgr8);
    }

    #[test]
    fn reads_are_paced() {
        let backend = SimulatedBackend::new(50.0);
        let mut device = backend.open(0, Resolution::new(2, 2)).unwrap();
        let start = Instant::now();
        for _ in 0..6 {
            device.read().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
