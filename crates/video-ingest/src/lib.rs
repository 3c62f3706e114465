//! Camera acquisition: frame types, the exclusive [`CameraSource`], and the
//! device backends it can drive.

pub mod camera;
#[cfg(feature = "opencv")]
pub mod opencv_backend;
pub mod simulated;
pub mod types;

pub use camera::{
    CAMERA_RETRY_BACKOFF, CameraBackend, CameraDevice, CameraSettings, CameraSource,
    RESOLUTION_TOLERANCE,
};
#[cfg(feature = "opencv")]
pub use opencv_backend::OpenCvBackend;
pub use simulated::SimulatedBackend;
pub use types::{CaptureError, Frame, FrameFormat, Resolution};
