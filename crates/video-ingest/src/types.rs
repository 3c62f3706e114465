use std::{fmt, str::FromStr};

use anyhow::Error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw BGR frame captured from a camera device.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

/// Capture resolution. Serialised as `"<height>,<width>"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub height: i32,
    pub width: i32,
}

impl Resolution {
    pub const fn new(height: i32, width: i32) -> Self {
        Self { height, width }
    }

    /// True when `other` is within `tolerance` pixels on both axes.
    pub fn within(&self, other: &Resolution, tolerance: i32) -> bool {
        (self.width - other.width).abs() <= tolerance
            && (self.height - other.height).abs() <= tolerance
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(480, 640)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.height, self.width)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (height, width) = value
            .split_once(',')
            .ok_or_else(|| format!("resolution {value:?} must be <height>,<width>"))?;
        let height = height
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("resolution height {height:?} is not an integer"))?;
        let width = width
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("resolution width {width:?} is not an integer"))?;
        if height <= 0 || width <= 0 {
            return Err(format!("resolution {value:?} must be positive"));
        }
        Ok(Self { height, width })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open camera device {device}")]
    Open { device: i32 },
    #[error(
        "camera device {device} negotiated {actual_width}x{actual_height}, requested {requested_width}x{requested_height}"
    )]
    ResolutionMismatch {
        device: i32,
        requested_width: i32,
        requested_height: i32,
        actual_width: i32,
        actual_height: i32,
    },
    #[error("failed to read frame from camera device {device}")]
    Read { device: i32 },
    #[error(transparent)]
    Other(#[from] Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parses_height_then_width() {
        let res: Resolution = "480,640".parse().unwrap();
        assert_eq!(res, Resolution::new(480, 640));
        assert_eq!(res.to_string(), "480,640");
    }

    #[test]
    fn resolution_rejects_garbage() {
        assert!("480x640".parse::<Resolution>().is_err());
        assert!("0,640".parse::<Resolution>().is_err());
        assert!("a,b".parse::<Resolution>().is_err());
    }

    #[test]
    fn resolution_round_trips_through_json_string() {
        let res: Resolution = serde_json::from_str("\"720, 1280\"").unwrap();
        assert_eq!(res, Resolution::new(720, 1280));
        assert_eq!(serde_json::to_string(&res).unwrap(), "\"720,1280\"");
    }

    #[test]
    fn tolerance_is_inclusive() {
        let requested = Resolution::new(480, 640);
        assert!(requested.within(&Resolution::new(490, 630), 10));
        assert!(!requested.within(&Resolution::new(491, 640), 10));
    }
}
