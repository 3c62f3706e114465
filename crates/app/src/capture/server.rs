//! Actix Web command server: recording control, statistics, parameters, the
//! MJPEG preview stream, and Prometheus metrics.
//!
//! The server runs on a dedicated thread with its own Actix system so the
//! capture threads never touch the async runtime. Blocking work (camera
//! access, joining the session thread, inference) goes through `web::block`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer, ResponseError,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use crossbeam_channel::bounded;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use video_ingest::{CAMERA_RETRY_BACKOFF, Resolution};

use crate::capture::{
    config::ParameterOverrides,
    error::CommandError,
    mailbox::{DASHBOARD, USER_INTERFACE},
    preview::PreviewLoop,
    session::Recorder,
    telemetry,
};

/// Upper bound on the preview frame rate per viewer.
const PREVIEW_INTERVAL: Duration = Duration::from_millis(33);

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) recorder: Arc<Recorder>,
    pub(crate) jpeg_quality: u8,
    pub(crate) metrics: Option<PrometheusHandle>,
}

/// `{status, message}` body returned by every command.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CommandReply {
    pub(crate) status: String,
    pub(crate) message: String,
}

impl CommandReply {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

impl ResponseError for CommandError {
    fn status_code(&self) -> StatusCode {
        match self {
            CommandError::SessionConflict => StatusCode::CONFLICT,
            CommandError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            CommandError::Capture(_) | CommandError::Reconfiguration(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CommandError::Filesystem { .. } | CommandError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(CommandReply::error(self.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResolutionUpdate {
    resolution: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CameraUpdate {
    camera_device: Option<i32>,
}

/// Handle for the server thread.
#[derive(Default)]
pub(crate) struct CommandServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CommandServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Register every route on `cfg`.
pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/start_recording", web::post().to(start_recording))
        .route("/stop_recording", web::post().to(stop_recording))
        .route("/update_resolution", web::post().to(update_resolution))
        .route("/update_camera", web::post().to(update_camera))
        .route("/get_stats", web::get().to(get_stats))
        .route(
            "/get_stats_user_interface",
            web::get().to(get_stats_user_interface),
        )
        .route("/params", web::get().to(params))
        .route("/video_feed", web::get().to(video_feed))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Bind `addr`, spawn the server thread, and return a handle that can stop it.
pub(crate) fn spawn_command_server(state: ServerState, addr: SocketAddr) -> Result<CommandServer> {
    let state = web::Data::new(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = bounded::<std::io::Result<()>>(1);
    let handle = telemetry::spawn_thread("capture-http-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || {
                App::new().app_data(state.clone()).configure(routes)
            })
            .bind(addr)
            {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("Listening on http://{addr}");
            Ok(CommandServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).with_context(|| format!("Failed to bind {addr}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("HTTP server thread exited before binding {addr}"))
        }
    }
}

/// Parse an optional JSON body; an empty body yields the default value.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, CommandError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| CommandError::InvalidParameters(err.to_string()))
}

fn blocking_failed(err: actix_web::error::BlockingError) -> CommandError {
    CommandError::Internal(anyhow!("blocking task failed: {err}"))
}

async fn start_recording(
    state: web::Data<ServerState>,
    body: Bytes,
) -> Result<HttpResponse, CommandError> {
    let overrides: ParameterOverrides = parse_body(&body)?;
    let recorder = state.recorder.clone();
    web::block(move || recorder.start(overrides))
        .await
        .map_err(blocking_failed)??;
    Ok(HttpResponse::Ok().json(CommandReply::success("Recording started")))
}

async fn stop_recording(state: web::Data<ServerState>) -> Result<HttpResponse, CommandError> {
    let recorder = state.recorder.clone();
    let message = web::block(move || recorder.stop())
        .await
        .map_err(blocking_failed)?;
    Ok(HttpResponse::Ok().json(CommandReply::success(message)))
}

async fn update_resolution(
    state: web::Data<ServerState>,
    body: Bytes,
) -> Result<HttpResponse, CommandError> {
    let update: ResolutionUpdate = parse_body(&body)?;
    let Some(raw) = update.resolution else {
        return Err(CommandError::InvalidParameters(
            "No resolution provided".to_string(),
        ));
    };
    let resolution = raw
        .parse::<Resolution>()
        .map_err(CommandError::InvalidParameters)?;
    let recorder = state.recorder.clone();
    web::block(move || recorder.reconfigure_resolution(resolution))
        .await
        .map_err(blocking_failed)??;
    Ok(HttpResponse::Ok().json(CommandReply::success(format!(
        "Resolution set to {resolution}"
    ))))
}

async fn update_camera(
    state: web::Data<ServerState>,
    body: Bytes,
) -> Result<HttpResponse, CommandError> {
    let update: CameraUpdate = parse_body(&body)?;
    let Some(device) = update.camera_device else {
        return Err(CommandError::InvalidParameters(
            "No camera device provided".to_string(),
        ));
    };
    let recorder = state.recorder.clone();
    web::block(move || recorder.reconfigure_camera(device))
        .await
        .map_err(blocking_failed)??;
    Ok(HttpResponse::Ok().json(CommandReply::success(format!(
        "Camera device {device} ready"
    ))))
}

fn stats_response(state: &ServerState, consumer: &str) -> HttpResponse {
    match state.recorder.stats().take(consumer) {
        Some(snapshot) => HttpResponse::Ok().json(snapshot),
        None => HttpResponse::Ok().json(serde_json::json!({})),
    }
}

async fn get_stats(state: web::Data<ServerState>) -> HttpResponse {
    stats_response(&state, DASHBOARD)
}

async fn get_stats_user_interface(state: web::Data<ServerState>) -> HttpResponse {
    stats_response(&state, USER_INTERFACE)
}

async fn params(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.recorder.params())
}

async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.metrics.as_ref() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Stream annotated preview frames over a multipart response. Each viewer
/// gets its own preview loop; failures back off and retry indefinitely.
async fn video_feed(state: web::Data<ServerState>) -> HttpResponse {
    let preview = PreviewLoop::new(state.recorder.clone(), state.jpeg_quality);
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(PREVIEW_INTERVAL);
        loop {
            interval.tick().await;
            let worker = preview.clone();
            match web::block(move || worker.next_jpeg()).await {
                Ok(Ok(jpeg)) => {
                    let mut payload = Vec::with_capacity(jpeg.len() + 64);
                    payload.extend_from_slice(b"--frame\r\n");
                    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                    payload.extend_from_slice(&jpeg);
                    payload.extend_from_slice(b"\r\n");
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
                }
                Ok(Err(err)) => {
                    warn!("Failed to produce preview frame: {err:#}");
                    actix_web::rt::time::sleep(CAMERA_RETRY_BACKOFF).await;
                }
                Err(err) => {
                    error!("Preview worker failed: {err}");
                    actix_web::rt::time::sleep(CAMERA_RETRY_BACKOFF).await;
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::EXPIRES, "0"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}
