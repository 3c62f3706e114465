//! Configuration for the capture station.
//!
//! `CliArgs` is translated once into an `AppConfig`; the mutable recording
//! knobs live in `CaptureParameters`, which the command API can override per
//! session.

use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use video_ingest::{CameraSettings, Resolution};

/// Slowest throttled rate accepted, one frame every ~17 minutes.
pub const MIN_PHOTOS_PER_SECOND: f64 = 0.001;
/// Longest session deadline accepted, one year.
pub const MAX_SESSION_MINUTES: f64 = 365.0 * 24.0 * 60.0;

/// Recording parameters exposed through the command API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureParameters {
    pub camera_device: i32,
    /// Requested resolution, `"<height>,<width>"` on the wire.
    pub resolution: Resolution,
    /// Image extension used for raw frames (`jpeg`, `png`, `bmp`).
    pub save_format: String,
    /// Target persisted frames per second; `0` persists every frame.
    pub photos_per_second: f64,
    /// Session deadline in minutes; `0` records until stopped.
    pub max_time_interval_minutes: f64,
}

impl Default for CaptureParameters {
    fn default() -> Self {
        Self {
            camera_device: 0,
            resolution: Resolution::default(),
            save_format: "jpeg".to_string(),
            photos_per_second: 30.0,
            max_time_interval_minutes: 0.5,
        }
    }
}

impl CaptureParameters {
    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            device: self.camera_device,
            resolution: self.resolution,
        }
    }

    /// `None` when the session is unbounded or the deadline does not fit a
    /// `Duration`; `validate` rejects the latter.
    pub fn max_duration(&self) -> Option<Duration> {
        if self.max_time_interval_minutes > 0.0 {
            Duration::try_from_secs_f64(self.max_time_interval_minutes * 60.0).ok()
        } else {
            None
        }
    }

    pub fn image_format(&self) -> Option<ImageFormat> {
        ImageFormat::from_extension(&self.save_format)
            .filter(|format| matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.photos_per_second.is_finite() || self.photos_per_second < 0.0 {
            bail!("photos_per_second must be a non-negative number");
        }
        if self.photos_per_second > 0.0 && self.photos_per_second < MIN_PHOTOS_PER_SECOND {
            bail!("photos_per_second must be 0 or at least {MIN_PHOTOS_PER_SECOND}");
        }
        if !self.max_time_interval_minutes.is_finite() || self.max_time_interval_minutes < 0.0 {
            bail!("max_time_interval_minutes must be a non-negative number");
        }
        if self.max_time_interval_minutes > MAX_SESSION_MINUTES {
            bail!("max_time_interval_minutes must not exceed {MAX_SESSION_MINUTES}");
        }
        if self.image_format().is_none() {
            bail!("unsupported save_format {:?}", self.save_format);
        }
        Ok(())
    }

    /// Merge `overrides`, returning true when the camera settings changed.
    pub fn apply(&mut self, overrides: ParameterOverrides) -> bool {
        let before = self.camera_settings();
        if let Some(device) = overrides.camera_device {
            self.camera_device = device;
        }
        if let Some(resolution) = overrides.resolution {
            self.resolution = resolution;
        }
        if let Some(format) = overrides.save_format {
            self.save_format = format.trim().trim_start_matches('.').to_ascii_lowercase();
        }
        if let Some(rate) = overrides.photos_per_second {
            self.photos_per_second = rate;
        }
        if let Some(minutes) = overrides.max_time_interval_minutes {
            self.max_time_interval_minutes = minutes;
        }
        before != self.camera_settings()
    }
}

/// Partial update accepted by the start command. Unknown keys are ignored.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ParameterOverrides {
    pub camera_device: Option<i32>,
    pub resolution: Option<Resolution>,
    pub save_format: Option<String>,
    pub photos_per_second: Option<f64>,
    pub max_time_interval_minutes: Option<f64>,
}

/// Optional telemetry knobs for tracing.
#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Directory session folders are created in.
    pub output_dir: PathBuf,
    pub params: CaptureParameters,
    pub model_path: Option<PathBuf>,
    pub classes_path: Option<PathBuf>,
    /// Use the synthetic camera at this frame rate instead of hardware.
    pub simulate_fps: Option<f64>,
    pub jpeg_quality: u8,
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

/// Camera capture station with live detection preview and throttled recording.
#[derive(Debug, Parser)]
#[command(name = "fabric-capture", version)]
pub struct CliArgs {
    /// Camera device index.
    #[arg(long = "device", default_value_t = 0)]
    pub device: i32,
    /// Capture resolution as HEIGHT,WIDTH.
    #[arg(long = "resolution", value_name = "H,W", default_value = "480,640")]
    pub resolution: String,
    /// Image format for recorded frames.
    #[arg(long = "save-format", default_value = "jpeg")]
    pub save_format: String,
    /// Target recorded frames per second (0 = every frame).
    #[arg(long = "photos-per-second", value_name = "FPS", default_value_t = 30.0)]
    pub photos_per_second: f64,
    /// Maximum session length in minutes (0 = until stopped).
    #[arg(long = "max-minutes", value_name = "MIN", default_value_t = 0.5)]
    pub max_minutes: f64,
    /// Directory that receives `photos<timestamp>` folders.
    #[arg(long = "output-dir", value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,
    /// Address the HTTP server binds to.
    #[arg(long = "bind", default_value = "127.0.0.1")]
    pub bind: String,
    /// HTTP port.
    #[arg(long = "port", default_value_t = 5000)]
    pub port: u16,
    /// TorchScript detector model.
    #[arg(long = "model", value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Class names, one per line, in class id order.
    #[arg(long = "classes", value_name = "PATH")]
    pub classes: Option<PathBuf>,
    /// Use a synthetic camera producing FPS frames per second.
    #[arg(long = "simulate", value_name = "FPS")]
    pub simulate: Option<f64>,
    /// JPEG quality for the live preview (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Verbose logging (per-frame persistence and camera errors).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self> {
        let resolution = args
            .resolution
            .parse::<Resolution>()
            .map_err(|err| anyhow!("--resolution: {err}"))?;
        let bind = args
            .bind
            .parse::<IpAddr>()
            .map_err(|err| anyhow!("--bind {:?}: {err}", args.bind))?;

        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if let Some(fps) = args.simulate {
            if !fps.is_finite() || fps < 0.0 {
                bail!("--simulate must be a non-negative frame rate");
            }
        }
        if args.classes.is_some() && args.model.is_none() {
            bail!("--classes requires --model");
        }

        let mut params = CaptureParameters {
            camera_device: args.device,
            resolution,
            save_format: String::new(),
            photos_per_second: args.photos_per_second,
            max_time_interval_minutes: args.max_minutes,
        };
        params.apply(ParameterOverrides {
            save_format: Some(args.save_format),
            ..ParameterOverrides::default()
        });
        params.validate()?;

        Ok(Self {
            bind,
            port: args.port,
            output_dir: args.output_dir,
            params,
            model_path: args.model,
            classes_path: args.classes,
            simulate_fps: args.simulate,
            jpeg_quality: args.jpeg_quality,
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<AppConfig> {
        let mut argv = vec!["fabric-capture"];
        argv.extend_from_slice(args);
        AppConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_the_station_profile() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.params, CaptureParameters::default());
        assert_eq!(config.port, 5000);
        assert_eq!(config.params.max_duration(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(parse(&["--resolution", "640x480"]).is_err());
        assert!(parse(&["--save-format", "gif"]).is_err());
        assert!(parse(&["--photos-per-second", "-1"]).is_err());
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--classes", "names.txt"]).is_err());
    }

    #[test]
    fn out_of_range_rates_and_deadlines_are_rejected() {
        let with = |photos_per_second: f64, max_time_interval_minutes: f64| CaptureParameters {
            photos_per_second,
            max_time_interval_minutes,
            ..CaptureParameters::default()
        };
        assert!(with(1e-300, 0.5).validate().is_err());
        assert!(with(f64::MIN_POSITIVE, 0.5).validate().is_err());
        assert!(with(30.0, 1e300).validate().is_err());
        assert!(with(30.0, MAX_SESSION_MINUTES * 2.0).validate().is_err());

        assert!(with(0.0, 0.0).validate().is_ok());
        assert!(with(MIN_PHOTOS_PER_SECOND, MAX_SESSION_MINUTES).validate().is_ok());
        assert!(with(MIN_PHOTOS_PER_SECOND, MAX_SESSION_MINUTES).max_duration().is_some());
        assert_eq!(with(30.0, 1e300).max_duration(), None);
    }

    #[test]
    fn zero_minutes_means_unbounded() {
        let config = parse(&["--max-minutes", "0"]).unwrap();
        assert_eq!(config.params.max_duration(), None);
    }

    #[test]
    fn overrides_merge_and_report_camera_changes() {
        let mut params = CaptureParameters::default();
        let overrides: ParameterOverrides = serde_json::from_str(
            r#"{"photos_per_second": 10, "max_time_interval_minutes": 0.1, "extra": true}"#,
        )
        .unwrap();
        assert!(!params.apply(overrides));
        assert_eq!(params.photos_per_second, 10.0);
        assert_eq!(params.max_time_interval_minutes, 0.1);

        let overrides: ParameterOverrides =
            serde_json::from_str(r#"{"resolution": "720,1280", "save_format": "PNG"}"#).unwrap();
        assert!(params.apply(overrides));
        assert_eq!(params.resolution, Resolution::new(720, 1280));
        assert_eq!(params.image_format(), Some(ImageFormat::Png));
    }
}
