//! Process supervisor: wires the camera, detector, recorder and HTTP server
//! together and tears them down on Ctrl+C.

use std::{fs, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use ml_core::{ClassNames, DetectionOracle, NullOracle, class_names_from_lines};
use tracing::{info, warn};
use video_ingest::{CameraSource, SimulatedBackend};

use crate::capture::{
    config::AppConfig,
    server::{ServerState, spawn_command_server},
    session::Recorder,
    telemetry,
};

/// Input size of the TorchScript detector, `(width, height)`.
#[cfg(feature = "with-tch")]
const MODEL_INPUT_SIZE: (i64, i64) = (640, 640);

/// Run the capture station until interrupted.
pub fn run(config: AppConfig) -> Result<()> {
    let metrics = telemetry::init_metrics_recorder().clone();

    let camera = Arc::new(open_camera(&config)?);
    let oracle = load_oracle(&config)?;
    info!(
        classes = oracle.class_names().len(),
        device = config.params.camera_device,
        resolution = %config.params.resolution,
        "Capture station ready"
    );

    let recorder = Arc::new(Recorder::new(
        camera.clone(),
        oracle,
        config.params.clone(),
        config.output_dir.clone(),
    ));
    info!(
        consumers = ?recorder.stats().consumers().collect::<Vec<_>>(),
        output = %config.output_dir.display(),
        "Statistics mailboxes registered"
    );

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    let server = spawn_command_server(
        ServerState {
            recorder: recorder.clone(),
            jpeg_quality: config.jpeg_quality,
            metrics: Some(metrics),
        },
        SocketAddr::new(config.bind, config.port),
    )?;

    let _ = shutdown_rx.recv();
    info!("Closing the application... Releasing resources.");
    server.stop();
    recorder.stop();
    camera.release();
    Ok(())
}

fn open_camera(config: &AppConfig) -> Result<CameraSource> {
    let settings = config.params.camera_settings();
    if let Some(fps) = config.simulate_fps {
        info!(fps, "Using simulated camera");
        return Ok(CameraSource::new(SimulatedBackend::new(fps), settings));
    }

    #[cfg(feature = "opencv")]
    {
        Ok(CameraSource::new(video_ingest::OpenCvBackend, settings))
    }
    #[cfg(not(feature = "opencv"))]
    {
        anyhow::bail!("no camera backend built in; enable the `opencv` feature or pass --simulate <FPS>")
    }
}

fn load_class_names(config: &AppConfig) -> Result<ClassNames> {
    match config.classes_path.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read class names from {}", path.display()))?;
            Ok(class_names_from_lines(&text))
        }
        None => Ok(ClassNames::new()),
    }
}

fn load_oracle(config: &AppConfig) -> Result<Arc<dyn DetectionOracle>> {
    let names = load_class_names(config)?;
    let Some(model_path) = config.model_path.as_ref() else {
        info!("No model configured; detections disabled");
        return Ok(Arc::new(NullOracle::new(names)));
    };

    #[cfg(feature = "with-tch")]
    {
        use ml_core::{TorchDetector, tch::Device};

        let device = Device::cuda_if_available();
        let detector = TorchDetector::new(model_path, device, MODEL_INPUT_SIZE, names)
            .with_context(|| format!("Failed to load model {}", model_path.display()))?;
        info!(model = %model_path.display(), ?device, "Detector loaded");
        Ok(Arc::new(detector))
    }
    #[cfg(not(feature = "with-tch"))]
    {
        anyhow::bail!(
            "--model {} requires building with the `with-tch` feature",
            model_path.display()
        )
    }
}
