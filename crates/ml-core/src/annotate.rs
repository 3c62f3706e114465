//! CPU drawing of detection overlays.

use anyhow::{Result, anyhow, bail};
use image::{Rgb, RgbImage};
use video_ingest::{Frame, FrameFormat};

use crate::detector::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_ADVANCE: i32 = 6;

/// Convert a BGR frame into an RGB image buffer.
pub fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    if !matches!(frame.format, FrameFormat::Bgr8) {
        bail!("unsupported frame format");
    }
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.data.len() != expected {
        bail!(
            "unexpected frame buffer size: got {} bytes, expected {}",
            frame.data.len(),
            expected
        );
    }
    let mut rgb = Vec::with_capacity(expected);
    for chunk in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    RgbImage::from_vec(frame.width as u32, frame.height as u32, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

/// Copy of `frame` with a box and a `<class> <score>%` tag per detection.
pub fn render_detections(frame: &Frame, detections: &[Detection]) -> Result<RgbImage> {
    let mut image = frame_to_rgb(frame)?;
    if image.width() == 0 || image.height() == 0 {
        return Ok(image);
    }

    for det in detections {
        let [x1, y1, x2, y2] = det.bbox_xyxy.map(|v| v.round() as i32);
        draw_rectangle(&mut image, x1, y1, x2, y2, BOX_COLOR);
    }

    for det in detections {
        let text = format!("{} {:.0}%", det.class_id, det.score * 100.0);
        let x = det.bbox_xyxy[0].round() as i32;
        let y = (det.bbox_xyxy[1].round() as i32 - 10).max(0);
        let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(&mut image, x, y, x + text_width, y + 8, LABEL_BG);
        draw_text(&mut image, x + 1, y + 1, &text, BOX_COLOR);
    }

    Ok(image)
}

fn clamp_box(image: &RgbImage, left: i32, top: i32, right: i32, bottom: i32) -> [i32; 4] {
    let max_x = image.width() as i32 - 1;
    let max_y = image.height() as i32 - 1;
    [
        left.min(right).clamp(0, max_x),
        top.min(bottom).clamp(0, max_y),
        left.max(right).clamp(0, max_x),
        top.max(bottom).clamp(0, max_y),
    ]
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let [left, top, right, bottom] = clamp_box(image, left, top, right, bottom);
    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let [left, top, right, bottom] = clamp_box(image, left, top, right, bottom);
    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars() {
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                let py = y + row as i32;
                if !(0..height).contains(&py) {
                    continue;
                }
                for col in 0..5 {
                    let px = x + col;
                    if (bits >> (4 - col)) & 1 == 1 && (0..width).contains(&px) {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// 5x7 bitmap glyphs for the characters used in detection tags.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        '0' => [0x0e, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0e],
        '1' => [0x04, 0x0c, 0x04, 0x04, 0x04, 0x04, 0x0e],
        '2' => [0x0e, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1f],
        '3' => [0x1e, 0x01, 0x01, 0x0e, 0x01, 0x01, 0x1e],
        '4' => [0x02, 0x06, 0x0a, 0x12, 0x1f, 0x02, 0x02],
        '5' => [0x1f, 0x10, 0x1e, 0x01, 0x01, 0x11, 0x0e],
        '6' => [0x06, 0x08, 0x10, 0x1e, 0x11, 0x11, 0x0e],
        '7' => [0x1f, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0e, 0x11, 0x11, 0x0e, 0x11, 0x11, 0x0e],
        '9' => [0x0e, 0x11, 0x11, 0x0f, 0x01, 0x02, 0x0c],
        '%' => [0x11, 0x12, 0x04, 0x08, 0x12, 0x11, 0x00],
        '-' => [0x00, 0x00, 0x00, 0x1f, 0x00, 0x00, 0x00],
        ' ' => [0x00; 7],
        _ => return None,
    };
    Some(rows)
}
