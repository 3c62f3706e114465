//! Per-viewer live preview frames.

use std::{io::Cursor, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use tracing::info_span;

use crate::capture::session::Recorder;

/// Produces annotated JPEG frames for one preview viewer.
///
/// While a session is running the loop reuses the session's latest annotated
/// frame so the detector is not run twice per camera frame. Otherwise it reads
/// the camera and annotates the frame itself.
#[derive(Clone)]
pub struct PreviewLoop {
    recorder: Arc<Recorder>,
    jpeg_quality: u8,
}

impl PreviewLoop {
    pub fn new(recorder: Arc<Recorder>, jpeg_quality: u8) -> Self {
        Self {
            recorder,
            jpeg_quality,
        }
    }

    /// Produce the next encoded frame. Camera and detector errors are
    /// returned to the caller, which backs off and retries.
    pub fn next_jpeg(&self) -> Result<Vec<u8>> {
        let span = info_span!("preview.frame", recording = self.recorder.is_recording());
        let _guard = span.enter();

        let session_frame = if self.recorder.is_recording() {
            self.recorder.latest_preview()
        } else {
            None
        };
        let annotated = match session_frame {
            Some(image) => image,
            None => {
                let frame = self.recorder.camera().read()?;
                let oracle = self.recorder.oracle();
                let detect_start = Instant::now();
                let detections = oracle.predict(&frame)?;
                metrics::histogram!("capture_stage_latency_seconds", "stage" => "preview_detect")
                    .record(detect_start.elapsed().as_secs_f64());
                Arc::new(oracle.render(&frame, &detections)?)
            }
        };

        let encode_start = Instant::now();
        let jpeg = encode_jpeg(&annotated, self.jpeg_quality)?;
        metrics::histogram!("capture_stage_latency_seconds", "stage" => "encode")
            .record(encode_start.elapsed().as_secs_f64());
        Ok(jpeg)
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::with_capacity(image.len() / 8));
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(image)
        .context("Failed to encode frame")?;
    Ok(buffer.into_inner())
}
