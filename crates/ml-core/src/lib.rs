//! Detection oracle contract and the detectors that implement it.

pub mod annotate;
pub mod detector;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detector::{
    ClassNames, Detection, DetectionOracle, FixedOracle, NullOracle, class_names_from_lines,
};

#[cfg(feature = "with-tch")]
pub use tch;
#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;
