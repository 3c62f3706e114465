//! Capture station: live detection preview, throttled recording, and the
//! command API that drives them.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration and recording parameters.
//! - `session`: Recorder state machine and the per-session capture loop.
//! - `rate`: Adaptive controller for the persisted frame rate.
//! - `artifacts`: Session folder layout, frame and label files.
//! - `folder`: Background folder size sampler.
//! - `mailbox`: Single-slot statistics mailboxes per consumer.
//! - `stats`: Snapshot payloads published to the mailboxes.
//! - `preview`: Per-viewer JPEG preview loop.
//! - `server`: Actix Web command and streaming endpoints.
//! - `station`: Process wiring and shutdown.
//! - `telemetry`: Tracing subscriber and Prometheus recorder setup.

/// Re-export configuration so callers can build a run without reaching into
/// submodules.
pub use config::{AppConfig, CliArgs};
/// Launch the capture station with a ready-made configuration.
pub use station::run;
pub(crate) use telemetry::init as init_telemetry;

mod artifacts;
mod config;
mod error;
mod folder;
mod mailbox;
mod preview;
mod rate;
mod server;
mod session;
mod stats;
mod station;
mod telemetry;
