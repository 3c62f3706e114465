//! On-disk layout of a recording session.
//!
//! ```text
//! photos<YYYYMMDDHHMMSS>/
//!     <YYYYMMDDHHMMSSffffff>.<format>   raw frame
//!     <YYYYMMDDHHMMSSffffff>.txt        one `class x y w h` line per detection
//!     labels.txt                        `id: name` per class, written once
//! ```

use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::ImageFormat;
use ml_core::{ClassNames, Detection, annotate::frame_to_rgb};
use video_ingest::Frame;

use crate::capture::error::CommandError;

pub const LEGEND_FILE: &str = "labels.txt";
const FOLDER_PREFIX: &str = "photos";

/// Create `photos<YYYYMMDDHHMMSS>` below `root`, appending `_1`, `_2`, ... when
/// a folder with that name already exists. Returns the absolute path.
pub fn create_session_folder(root: &Path, now: DateTime<Local>) -> Result<PathBuf, CommandError> {
    let root = std::path::absolute(root).map_err(|source| CommandError::Filesystem {
        path: root.to_path_buf(),
        source,
    })?;
    fs::create_dir_all(&root).map_err(|source| CommandError::Filesystem {
        path: root.clone(),
        source,
    })?;

    let base = format!("{FOLDER_PREFIX}{}", now.format("%Y%m%d%H%M%S"));
    let mut suffix = 0u32;
    loop {
        let name = match suffix {
            0 => base.clone(),
            n => format!("{base}_{n}"),
        };
        let candidate = root.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(source) => {
                return Err(CommandError::Filesystem {
                    path: candidate,
                    source,
                });
            }
        }
    }
}

/// Label file body: normalised `class x_center y_center width height` rows.
pub fn label_lines(detections: &[Detection], frame_width: i32, frame_height: i32) -> String {
    let mut out = String::new();
    for det in detections {
        let [x, y, w, h] = det.normalized_xywh(frame_width, frame_height);
        let _ = writeln!(out, "{} {x:.6} {y:.6} {w:.6} {h:.6}", det.class_id);
    }
    out
}

pub fn legend_lines(names: &ClassNames) -> String {
    let mut out = String::new();
    for (id, name) in names {
        let _ = writeln!(out, "{id}: {name}");
    }
    out
}

/// Writes frames and labels into one session folder.
#[derive(Debug)]
pub struct SessionWriter {
    folder: PathBuf,
    format: ImageFormat,
    extension: String,
    legend_written: bool,
}

impl SessionWriter {
    pub fn new(folder: PathBuf, format: ImageFormat, extension: impl Into<String>) -> Self {
        Self {
            folder,
            format,
            extension: extension.into(),
            legend_written: false,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Persist the raw frame, its label file and, the first time, the legend.
    /// Returns the path of the saved image.
    pub fn persist(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        names: &ClassNames,
        at: DateTime<Local>,
    ) -> Result<PathBuf> {
        let stem = at.format("%Y%m%d%H%M%S%6f").to_string();
        let image_path = self.folder.join(format!("{stem}.{}", self.extension));
        let label_path = self.folder.join(format!("{stem}.txt"));

        let rgb = frame_to_rgb(frame)?;
        rgb.save_with_format(&image_path, self.format)
            .with_context(|| format!("failed to write {}", image_path.display()))?;
        fs::write(&label_path, label_lines(detections, frame.width, frame.height))
            .with_context(|| format!("failed to write {}", label_path.display()))?;

        if !self.legend_written {
            let legend_path = self.folder.join(LEGEND_FILE);
            fs::write(&legend_path, legend_lines(names))
                .with_context(|| format!("failed to write {}", legend_path.display()))?;
            self.legend_written = true;
        }
        Ok(image_path)
    }
}
