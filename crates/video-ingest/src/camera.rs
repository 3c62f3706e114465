//! Exclusive, recoverable access to a single camera handle.
//!
//! [`CameraSource`] owns the only live [`CameraDevice`] in the process. Every
//! physical read, open, release, and reconfiguration goes through the same
//! mutex, so concurrent loops never observe a half-reconfigured handle: they
//! either get a frame or a [`CaptureError`] and retry after
//! [`CAMERA_RETRY_BACKOFF`].

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::types::{CaptureError, Frame, Resolution};

/// Allowed difference, in pixels, between requested and negotiated resolution.
pub const RESOLUTION_TOLERANCE: i32 = 10;

/// Pause applied by capture loops after a failed open or read.
pub const CAMERA_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// An opened camera device.
pub trait CameraDevice: Send {
    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Resolution the device actually negotiated.
    fn resolution(&self) -> Resolution;

    /// Free the underlying device. Called at most once per handle.
    fn release(&mut self) {}
}

/// Factory for camera devices (OpenCV, simulated, ...).
pub trait CameraBackend: Send + Sync {
    fn open(
        &self,
        device: i32,
        requested: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CaptureError>;
}

/// Device index and requested resolution used when (re)opening the camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CameraSettings {
    pub device: i32,
    pub resolution: Resolution,
}

struct CameraSlot {
    settings: CameraSettings,
    handle: Option<Box<dyn CameraDevice>>,
}

pub struct CameraSource {
    backend: Box<dyn CameraBackend>,
    slot: Mutex<CameraSlot>,
}

impl CameraSource {
    pub fn new(backend: impl CameraBackend + 'static, settings: CameraSettings) -> Self {
        Self {
            backend: Box::new(backend),
            slot: Mutex::new(CameraSlot {
                settings,
                handle: None,
            }),
        }
    }

    pub fn settings(&self) -> CameraSettings {
        self.lock().settings
    }

    pub fn is_open(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Open the configured device unless a handle is already live.
    pub fn ensure_open(&self) -> Result<(), CaptureError> {
        let mut slot = self.lock();
        self.open_locked(&mut slot)
    }

    /// Read one frame, opening the device first if needed.
    ///
    /// Any failure releases the handle so the next call re-opens the device.
    pub fn read(&self) -> Result<Frame, CaptureError> {
        let mut slot = self.lock();
        self.open_locked(&mut slot)?;
        let device = slot.settings.device;
        let Some(handle) = slot.handle.as_mut() else {
            return Err(CaptureError::Open { device });
        };
        let result = match handle.read() {
            Ok(frame) if frame.width > 0 && frame.height > 0 => Ok(frame),
            Ok(_) => Err(CaptureError::Read { device }),
            Err(err) => Err(err),
        };
        if result.is_err() {
            release_locked(&mut slot);
        }
        result
    }

    /// Release the handle. Safe to call when already closed.
    pub fn release(&self) {
        let mut slot = self.lock();
        release_locked(&mut slot);
    }

    /// Close the handle, apply new settings, and try to reopen.
    ///
    /// On failure the camera stays closed with the new settings recorded, so
    /// later reads keep retrying with them.
    pub fn reconfigure(
        &self,
        device: Option<i32>,
        resolution: Option<Resolution>,
    ) -> Result<(), CaptureError> {
        let mut slot = self.lock();
        release_locked(&mut slot);
        if let Some(device) = device {
            slot.settings.device = device;
        }
        if let Some(resolution) = resolution {
            slot.settings.resolution = resolution;
        }
        info!(
            device = slot.settings.device,
            resolution = %slot.settings.resolution,
            "Reconfiguring camera"
        );
        self.open_locked(&mut slot)
    }

    fn lock(&self) -> MutexGuard<'_, CameraSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_locked(&self, slot: &mut CameraSlot) -> Result<(), CaptureError> {
        if slot.handle.is_some() {
            return Ok(());
        }
        let CameraSettings { device, resolution } = slot.settings;
        let mut handle = self.backend.open(device, resolution)?;
        let actual = handle.resolution();
        if !resolution.within(&actual, RESOLUTION_TOLERANCE) {
            warn!(
                device,
                requested = %resolution,
                actual = %actual,
                "Camera rejected requested resolution"
            );
            handle.release();
            return Err(CaptureError::ResolutionMismatch {
                device,
                requested_width: resolution.width,
                requested_height: resolution.height,
                actual_width: actual.width,
                actual_height: actual.height,
            });
        }
        debug!(device, resolution = %actual, "Camera opened");
        slot.handle = Some(handle);
        Ok(())
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        release_locked(slot);
    }
}

fn release_locked(slot: &mut CameraSlot) {
    if let Some(mut handle) = slot.handle.take() {
        handle.release();
        debug!(device = slot.settings.device, "Camera released");
    }
}
