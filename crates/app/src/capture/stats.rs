use std::{path::Path, time::Duration};

use serde::Serialize;

/// Elapsed time above which snapshots report minutes instead of seconds.
const MINUTES_THRESHOLD_SECS: f64 = 50.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SizeUnit {
    #[serde(rename = "MB")]
    Megabytes,
    #[serde(rename = "GB")]
    Gigabytes,
}

/// Approximate on-disk size of a session folder.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FolderSizeSample {
    pub size: f64,
    pub unit: SizeUnit,
}

impl FolderSizeSample {
    pub fn from_bytes(bytes: u64) -> Self {
        let megabytes = bytes as f64 / BYTES_PER_MB;
        if megabytes >= 1024.0 {
            Self {
                size: round_to(megabytes / 1024.0, 3),
                unit: SizeUnit::Gigabytes,
            }
        } else {
            Self {
                size: round_to(megabytes, 2),
                unit: SizeUnit::Megabytes,
            }
        }
    }
}

impl Default for FolderSizeSample {
    fn default() -> Self {
        Self {
            size: 0.0,
            unit: SizeUnit::Megabytes,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
}

/// Progress report published to the statistics mailboxes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub count: u64,
    pub time: f64,
    pub time_unit: TimeUnit,
    pub rate: f64,
    pub rate_unit: &'static str,
    pub folder: String,
    pub recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_ready: Option<bool>,
    pub folder_size: FolderSizeSample,
}

impl StatsSnapshot {
    pub fn new(
        count: u64,
        elapsed: Duration,
        rate: f64,
        folder: &Path,
        recording: bool,
        folder_size: FolderSizeSample,
    ) -> Self {
        let (time, time_unit) = elapsed_with_unit(elapsed);
        Self {
            count,
            time,
            time_unit,
            rate,
            rate_unit: "photos/sec",
            folder: folder.display().to_string(),
            recording,
            camera_ready: None,
            folder_size,
        }
    }

    /// First snapshot of a session: nothing recorded, camera confirmed open.
    pub fn initial(folder: &Path) -> Self {
        Self {
            camera_ready: Some(true),
            ..Self::new(0, Duration::ZERO, 0.0, folder, true, FolderSizeSample::default())
        }
    }
}

/// Seconds up to 50 s, minutes beyond, rounded to one decimal.
pub fn elapsed_with_unit(elapsed: Duration) -> (f64, TimeUnit) {
    let secs = elapsed.as_secs_f64();
    if secs > MINUTES_THRESHOLD_SECS {
        (round_to(secs / 60.0, 1), TimeUnit::Minutes)
    } else {
        (round_to(secs, 1), TimeUnit::Seconds)
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
