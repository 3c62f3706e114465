//! OpenCV-backed camera devices.

use chrono::Utc;
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::warn;

use crate::{
    camera::{CameraBackend, CameraDevice},
    types::{CaptureError, Frame, FrameFormat, Resolution},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenCvBackend;

impl CameraBackend for OpenCvBackend {
    fn open(
        &self,
        device: i32,
        requested: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CaptureError> {
        let mut cap = open_video_capture(device)?;
        configure_camera(&mut cap, requested);
        let width = cap
            .get(videoio::CAP_PROP_FRAME_WIDTH)
            .map_err(|e| CaptureError::Other(e.into()))?;
        let height = cap
            .get(videoio::CAP_PROP_FRAME_HEIGHT)
            .map_err(|e| CaptureError::Other(e.into()))?;
        Ok(Box::new(OpenCvDevice {
            device,
            cap,
            frame: Mat::default(),
            resolution: Resolution::new(height.round() as i32, width.round() as i32),
        }))
    }
}

struct OpenCvDevice {
    device: i32,
    cap: VideoCapture,
    frame: Mat,
    resolution: Resolution,
}

impl CameraDevice for OpenCvDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::Read {
                device: self.device,
            });
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: size.width,
            height: size.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn release(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!(device = self.device, "Failed to release camera: {err}");
        }
    }
}

/// Attempt to open a camera by index, preferring V4L.
fn open_video_capture(device: i32) -> Result<VideoCapture, CaptureError> {
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::new(device, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open device #{device} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open { device })
}

/// Apply resolution and preferred pixel format.
fn configure_camera(cap: &mut VideoCapture, requested: Resolution) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, requested.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, requested.height as f64);
}
