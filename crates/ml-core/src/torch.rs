//! TorchScript-backed YOLO-style detector.

use std::{convert::TryFrom, path::Path, sync::Mutex};

use anyhow::{Result, anyhow, bail};
use image::imageops::{self, FilterType};
use tch::{self, Device, Kind, Tensor};
use video_ingest::Frame;

use crate::{
    annotate::frame_to_rgb,
    detector::{ClassNames, Detection, DetectionOracle},
};

const IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 300;

pub struct TorchDetector {
    module: Mutex<tch::CModule>,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    names: ClassNames,
}

impl TorchDetector {
    /// Load a TorchScript module exported with a `[1, 4 + classes, N]` head.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        names: ClassNames,
    ) -> Result<Self> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module: Mutex::new(module),
            device,
            input_size,
            confidence_threshold: 0.25,
            names,
        })
    }

    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        let (in_w, in_h) = self.input_size;
        let rgb = frame_to_rgb(frame)?;
        let resized = imageops::resize(&rgb, in_w as u32, in_h as u32, FilterType::Triangle);
        let tensor = Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }
}

impl DetectionOracle for TorchDetector {
    fn predict(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.frame_to_tensor(frame)?;
        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| anyhow!("detector module poisoned"))?;
            tch::no_grad(|| module.forward_ts(&[input]))?
        };
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,score), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let sx = frame.width as f32 / in_w as f32;
        let sy = frame.height as f32 / in_h as f32;

        let mut candidates = Vec::new();
        for row in rows {
            let Some((class_idx, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(Detection {
                class_id: class_idx as i64,
                score,
                bbox_xyxy: [
                    (cx - w / 2.0) * sx,
                    (cy - h / 2.0) * sy,
                    (cx + w / 2.0) * sx,
                    (cy + h / 2.0) * sy,
                ],
            });
        }

        Ok(non_max_suppression(candidates))
    }

    fn class_names(&self) -> &ClassNames {
        &self.names
    }
}

fn non_max_suppression(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::new();
    for det in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == det.class_id && iou(&k.bbox_xyxy, &det.bbox_xyxy) > IOU_THRESHOLD);
        if !overlaps {
            kept.push(det);
            if kept.len() >= MAX_DETECTIONS {
                break;
            }
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_overlapping_boxes_of_the_same_class() {
        let boxes = vec![
            Detection {
                class_id: 0,
                score: 0.9,
                bbox_xyxy: [0.0, 0.0, 10.0, 10.0],
            },
            Detection {
                class_id: 0,
                score: 0.8,
                bbox_xyxy: [1.0, 1.0, 11.0, 11.0],
            },
            Detection {
                class_id: 1,
                score: 0.7,
                bbox_xyxy: [1.0, 1.0, 11.0, 11.0],
            },
        ];
        let kept = non_max_suppression(boxes);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }
}
