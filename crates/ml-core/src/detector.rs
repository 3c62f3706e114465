use std::{collections::BTreeMap, thread, time::Duration};

use anyhow::Result;
use image::RgbImage;
use video_ingest::Frame;

use crate::annotate::render_detections;

/// Class id → human readable name, ordered by id.
pub type ClassNames = BTreeMap<i64, String>;

/// Single detection in absolute pixel coordinates of the source frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub score: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox_xyxy: [f32; 4],
}

impl Detection {
    /// Box as normalised `(x_center, y_center, width, height)`, clamped to `[0, 1]`.
    pub fn normalized_xywh(&self, frame_width: i32, frame_height: i32) -> [f32; 4] {
        let w = frame_width.max(1) as f32;
        let h = frame_height.max(1) as f32;
        let [x1, y1, x2, y2] = self.bbox_xyxy;
        let (x1, x2) = (x1.min(x2).clamp(0.0, w), x1.max(x2).clamp(0.0, w));
        let (y1, y2) = (y1.min(y2).clamp(0.0, h), y1.max(y2).clamp(0.0, h));
        [
            (x1 + x2) / 2.0 / w,
            (y1 + y2) / 2.0 / h,
            (x2 - x1) / w,
            (y2 - y1) / h,
        ]
    }
}

/// Synchronous object detector consumed by the capture pipeline.
///
/// Calls may block for an unbounded amount of time; callers budget for it.
pub trait DetectionOracle: Send + Sync {
    fn predict(&self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Draw `detections` over `frame`.
    fn render(&self, frame: &Frame, detections: &[Detection]) -> Result<RgbImage> {
        render_detections(frame, detections)
    }

    fn class_names(&self) -> &ClassNames;
}

/// Oracle that never detects anything. Used when no model is configured.
#[derive(Debug, Default)]
pub struct NullOracle {
    names: ClassNames,
}

impl NullOracle {
    pub fn new(names: ClassNames) -> Self {
        Self { names }
    }
}

impl DetectionOracle for NullOracle {
    fn predict(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }

    fn class_names(&self) -> &ClassNames {
        &self.names
    }
}

/// Oracle returning the same detections for every frame, optionally after a
/// fixed delay standing in for inference cost.
#[derive(Debug, Clone)]
pub struct FixedOracle {
    names: ClassNames,
    detections: Vec<Detection>,
    latency: Duration,
}

impl FixedOracle {
    pub fn new(names: ClassNames, detections: Vec<Detection>) -> Self {
        Self {
            names,
            detections,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl DetectionOracle for FixedOracle {
    fn predict(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        Ok(self.detections.clone())
    }

    fn class_names(&self) -> &ClassNames {
        &self.names
    }
}

/// Build class names from a newline separated list, skipping blank lines.
pub fn class_names_from_lines(text: &str) -> ClassNames {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(idx, name)| (idx as i64, name.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_against_frame_size() {
        let det = Detection {
            class_id: 0,
            score: 0.9,
            bbox_xyxy: [10.0, 20.0, 30.0, 60.0],
        };
        let [xc, yc, w, h] = det.normalized_xywh(100, 200);
        assert!((xc - 0.2).abs() < 1e-6);
        assert!((yc - 0.2).abs() < 1e-6);
        assert!((w - 0.2).abs() < 1e-6);
        assert!((h - 0.2).abs() < 1e-6);
    }

    #[test]
    fn boxes_outside_the_frame_are_clamped() {
        let det = Detection {
            class_id: 1,
            score: 0.5,
            bbox_xyxy: [-10.0, 50.0, 120.0, 10.0],
        };
        for value in det.normalized_xywh(100, 100) {
            assert!((0.0..=1.0).contains(&value), "{value} out of range");
        }
    }

    #[test]
    fn class_names_are_numbered_in_order() {
        let names = class_names_from_lines("hole\n\n stain \nthread\n");
        assert_eq!(names.get(&0).map(String::as_str), Some("hole"));
        assert_eq!(names.get(&1).map(String::as_str), Some("stain"));
        assert_eq!(names.len(), 3);
    }
}
