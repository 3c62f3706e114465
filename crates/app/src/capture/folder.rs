//! Background sampler for the on-disk size of the active session folder.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::capture::{mailbox::Mailbox, stats::FolderSizeSample, telemetry};

/// Interval between folder size samples.
pub const FOLDER_SIZE_INTERVAL: Duration = Duration::from_secs(5);

/// Total size in bytes of every file below `root`.
pub fn folder_size_bytes(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed to stat {}", entry.path().display()))?;
            total = total.saturating_add(metadata.len());
        }
    }
    Ok(total)
}

/// Handle for a running folder size sampler. Dropping it stops the thread.
pub struct FolderSizeMonitor {
    latest: Arc<Mailbox<FolderSizeSample>>,
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FolderSizeMonitor {
    /// Sample `folder` now and then every `interval` until stopped.
    pub fn spawn(folder: PathBuf, interval: Duration) -> Result<Self> {
        let latest = Arc::new(Mailbox::new());
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let sink = latest.clone();
        let handle = telemetry::spawn_thread("capture-folder-size", move || {
            loop {
                match folder_size_bytes(&folder) {
                    Ok(bytes) => {
                        metrics::gauge!("capture_folder_size_bytes").set(bytes as f64);
                        let sample = FolderSizeSample::from_bytes(bytes);
                        debug!(size = sample.size, unit = ?sample.unit, "Folder size sampled");
                        sink.put(sample);
                    }
                    Err(err) => warn!("Error calculating folder size: {err:#}"),
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .context("Failed to spawn folder size thread")?;

        Ok(Self {
            latest,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Consume the newest sample, if one arrived since the last call.
    pub fn take_latest(&self) -> Option<FolderSizeSample> {
        self.latest.take()
    }

    /// Stop sampling and wait for the thread to exit.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FolderSizeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
