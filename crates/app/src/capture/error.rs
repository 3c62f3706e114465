use std::path::PathBuf;

use thiserror::Error;
use video_ingest::CaptureError;

/// Failures reported back to command callers.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Already recording")]
    SessionConflict,
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Failed to initialize camera: {0}")]
    Capture(#[source] CaptureError),
    #[error("Failed to initialize camera with new settings: {0}")]
    Reconfiguration(#[source] CaptureError),
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
