//! Recording session lifecycle and the per-session capture loop.
//!
//! A [`Recorder`] owns at most one session at a time and moves it through
//! `Idle → Starting → Running → Finalizing → Idle`. The capture loop runs on
//! its own thread: it reads the camera, asks the detection oracle for
//! detections, refreshes the live preview, publishes statistics, and persists
//! frames whenever the [`AdaptiveRateController`] says one is due.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Local;
use image::RgbImage;
use ml_core::DetectionOracle;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CAMERA_RETRY_BACKOFF, CameraSource, Resolution};

use crate::capture::{
    artifacts::{SessionWriter, create_session_folder},
    config::{CaptureParameters, ParameterOverrides},
    error::CommandError,
    folder::{FOLDER_SIZE_INTERVAL, FolderSizeMonitor},
    mailbox::{Mailbox, StatsHub},
    rate::AdaptiveRateController,
    stats::{FolderSizeSample, StatsSnapshot},
    telemetry,
};

/// Minimum spacing between live preview refreshes from the capture loop.
const PREVIEW_REFRESH: Duration = Duration::from_millis(1);
/// Spacing between running statistics snapshots.
const STATS_INTERVAL: Duration = Duration::from_millis(10);

pub const RECORDING_STOPPED: &str = "Recording stopped";
pub const NOT_RECORDING: &str = "Not recording";

/// Latest annotated frame produced while a session is running.
pub type SharedPreview = Arc<Mailbox<Arc<RgbImage>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Finalizing,
}

struct ActiveSession {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Owns the camera, the oracle, and the single recording session.
pub struct Recorder {
    camera: Arc<CameraSource>,
    oracle: Arc<dyn DetectionOracle>,
    stats: StatsHub,
    preview: SharedPreview,
    output_dir: PathBuf,
    params: Mutex<CaptureParameters>,
    state: Arc<Mutex<SessionState>>,
    /// Serialises start, stop and reconfiguration commands.
    control: Mutex<Option<ActiveSession>>,
}

impl Recorder {
    pub fn new(
        camera: Arc<CameraSource>,
        oracle: Arc<dyn DetectionOracle>,
        params: CaptureParameters,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            camera,
            oracle,
            stats: StatsHub::default(),
            preview: Arc::new(Mailbox::new()),
            output_dir,
            params: Mutex::new(params),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            control: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &Arc<CameraSource> {
        &self.camera
    }

    pub fn oracle(&self) -> &Arc<dyn DetectionOracle> {
        &self.oracle
    }

    pub fn stats(&self) -> &StatsHub {
        &self.stats
    }

    pub fn params(&self) -> CaptureParameters {
        lock(&self.params).clone()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_recording(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Annotated frame from the running session, if any.
    pub fn latest_preview(&self) -> Option<Arc<RgbImage>> {
        self.preview.peek()
    }

    /// Begin a session with `overrides` merged into the current parameters.
    /// Returns the absolute session folder.
    pub fn start(&self, overrides: ParameterOverrides) -> Result<PathBuf, CommandError> {
        let mut control = lock(&self.control);
        {
            let mut state = lock(&self.state);
            if *state != SessionState::Idle {
                return Err(CommandError::SessionConflict);
            }
            *state = SessionState::Starting;
        }
        let guard = StartGuard {
            state: self.state.as_ref(),
            armed: true,
        };
        // A session that ended on its deadline leaves a finished thread behind.
        if let Some(previous) = control.take() {
            let _ = previous.handle.join();
        }

        let (folder, active) = self.launch(overrides)?;
        guard.disarm();
        *control = Some(active);
        Ok(folder)
    }

    /// Stop the running session and wait for it to finalize. Idempotent.
    pub fn stop(&self) -> &'static str {
        let mut control = lock(&self.control);
        let Some(active) = control.take() else {
            return NOT_RECORDING;
        };

        let was_running = {
            let state = lock(&self.state);
            let running = matches!(*state, SessionState::Running | SessionState::Finalizing);
            if running {
                active.stop.store(true, Ordering::Release);
                // Finalization publishes the terminal snapshot after this clear.
                self.stats.clear_all();
            }
            running
        };

        if active.handle.join().is_err() {
            error!("Recording thread panicked");
            *lock(&self.state) = SessionState::Idle;
            self.preview.clear();
        }

        if was_running {
            info!("Recording stopped");
            RECORDING_STOPPED
        } else {
            NOT_RECORDING
        }
    }

    pub fn reconfigure_resolution(&self, resolution: Resolution) -> Result<(), CommandError> {
        let _control = lock(&self.control);
        lock(&self.params).resolution = resolution;
        self.camera
            .reconfigure(None, Some(resolution))
            .map_err(CommandError::Reconfiguration)
    }

    pub fn reconfigure_camera(&self, device: i32) -> Result<(), CommandError> {
        let _control = lock(&self.control);
        lock(&self.params).camera_device = device;
        self.camera
            .reconfigure(Some(device), None)
            .map_err(CommandError::Reconfiguration)
    }

    fn launch(&self, overrides: ParameterOverrides) -> Result<(PathBuf, ActiveSession), CommandError> {
        let mut params = self.params();
        let camera_changed = params.apply(overrides);
        params
            .validate()
            .map_err(|err| CommandError::InvalidParameters(err.to_string()))?;
        let format = params
            .image_format()
            .ok_or_else(|| CommandError::InvalidParameters(params.save_format.clone()))?;
        *lock(&self.params) = params.clone();

        if camera_changed {
            let settings = params.camera_settings();
            self.camera
                .reconfigure(Some(settings.device), Some(settings.resolution))
                .map_err(CommandError::Capture)?;
        }
        self.stats.clear_all();
        self.camera.ensure_open().map_err(CommandError::Capture)?;

        let folder = create_session_folder(&self.output_dir, Local::now())?;
        let monitor = match FolderSizeMonitor::spawn(folder.clone(), FOLDER_SIZE_INTERVAL) {
            Ok(monitor) => monitor,
            Err(err) => {
                discard_folder(&folder);
                return Err(err.into());
            }
        };

        self.stats.publish(&StatsSnapshot::initial(&folder));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = SessionWorker {
            camera: self.camera.clone(),
            oracle: self.oracle.clone(),
            stats: self.stats.clone(),
            preview: self.preview.clone(),
            state: self.state.clone(),
            stop: stop.clone(),
            writer: SessionWriter::new(folder.clone(), format, params.save_format.clone()),
            monitor,
            target_fps: params.photos_per_second,
            max_duration: params.max_duration(),
        };

        info!(
            folder = %folder.display(),
            photos_per_second = params.photos_per_second,
            max_minutes = params.max_time_interval_minutes,
            format = %params.save_format,
            "Recording started"
        );
        *lock(&self.state) = SessionState::Running;
        let handle = match telemetry::spawn_thread("capture-session", move || worker.run()) {
            Ok(handle) => handle,
            Err(err) => {
                discard_folder(&folder);
                return Err(CommandError::Internal(
                    anyhow::Error::new(err).context("Failed to spawn recording thread"),
                ));
            }
        };

        Ok((folder, ActiveSession { stop, handle }))
    }
}

/// Puts a half-started recorder back to `Idle` unless the launch succeeded,
/// including when it unwinds.
struct StartGuard<'a> {
    state: &'a Mutex<SessionState>,
    armed: bool,
}

impl StartGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *lock(self.state) = SessionState::Idle;
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SessionWorker {
    camera: Arc<CameraSource>,
    oracle: Arc<dyn DetectionOracle>,
    stats: StatsHub,
    preview: SharedPreview,
    state: Arc<Mutex<SessionState>>,
    stop: Arc<AtomicBool>,
    writer: SessionWriter,
    monitor: FolderSizeMonitor,
    target_fps: f64,
    max_duration: Option<Duration>,
}

impl SessionWorker {
    fn run(mut self) {
        let span = info_span!("capture.session", folder = %self.writer.folder().display());
        let _guard = span.enter();

        let started = Instant::now();
        let mut rate = AdaptiveRateController::new(self.target_fps, started);
        debug!(
            target_fps = self.target_fps,
            delta = rate.delta_secs(),
            max_delta = rate.max_delta_secs(),
            "Rate controller initialised"
        );
        let mut count = 0u64;
        let mut folder_size = FolderSizeSample::default();
        let mut last_preview: Option<Instant> = None;
        let mut last_stats = started;

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self
                .max_duration
                .is_some_and(|max| started.elapsed() >= max)
            {
                info!("Maximum recording time reached");
                break;
            }

            let frame = match self.camera.read() {
                Ok(frame) => frame,
                Err(err) => {
                    metrics::counter!("capture_camera_errors_total").increment(1);
                    warn!("Failed to read frame from camera (recording): {err}");
                    thread::sleep(CAMERA_RETRY_BACKOFF);
                    continue;
                }
            };

            let detect_start = Instant::now();
            let detections = match self.oracle.predict(&frame) {
                Ok(detections) => detections,
                Err(err) => {
                    warn!("Detection failed, skipping frame: {err:#}");
                    continue;
                }
            };
            metrics::histogram!("capture_stage_latency_seconds", "stage" => "detect")
                .record(detect_start.elapsed().as_secs_f64());

            let now = Instant::now();
            if last_preview.is_none_or(|at| now.duration_since(at) >= PREVIEW_REFRESH) {
                match self.oracle.render(&frame, &detections) {
                    Ok(annotated) => {
                        self.preview.put(Arc::new(annotated));
                        last_preview = Some(now);
                    }
                    Err(err) => {
                        warn!("Annotation failed, skipping frame: {err:#}");
                        continue;
                    }
                }
            }

            if let Some(sample) = self.monitor.take_latest() {
                folder_size = sample;
            }

            rate.update(now);
            metrics::gauge!("capture_rate_fps").set(rate.measured_fps());
            metrics::gauge!("capture_delta_seconds").set(rate.delta_secs());

            if now.duration_since(last_stats) >= STATS_INTERVAL {
                self.stats.publish(&StatsSnapshot::new(
                    count,
                    now.duration_since(started),
                    rate.measured_fps(),
                    self.writer.folder(),
                    true,
                    folder_size,
                ));
                last_stats = now;
            }

            if rate.is_due(now) {
                let _persist = info_span!("capture.persist", frame = count).entered();
                let persist_start = Instant::now();
                match self.writer.persist(
                    &frame,
                    &detections,
                    self.oracle.class_names(),
                    Local::now(),
                ) {
                    Ok(path) => {
                        rate.record_persist(now);
                        count += 1;
                        metrics::counter!("capture_frames_persisted_total").increment(1);
                        metrics::histogram!("capture_stage_latency_seconds", "stage" => "persist")
                            .record(persist_start.elapsed().as_secs_f64());
                        debug!(path = %path.display(), detections = detections.len(), "Frame saved");
                    }
                    Err(err) => {
                        metrics::counter!("capture_persist_errors_total").increment(1);
                        warn!("Failed to persist frame: {err:#}");
                    }
                }
            }
        }

        self.finalize(started, &mut rate, count, folder_size);
    }

    fn finalize(
        &mut self,
        started: Instant,
        rate: &mut AdaptiveRateController,
        count: u64,
        mut folder_size: FolderSizeSample,
    ) {
        *lock(&self.state) = SessionState::Finalizing;
        let now = Instant::now();
        let final_rate = rate.finish(now);

        self.monitor.stop();
        if let Some(sample) = self.monitor.take_latest() {
            folder_size = sample;
        }
        let snapshot = StatsSnapshot::new(
            count,
            now.duration_since(started),
            final_rate,
            self.writer.folder(),
            false,
            folder_size,
        );
        self.preview.clear();

        let mut state = lock(&self.state);
        self.stats.publish(&snapshot);
        *state = SessionState::Idle;
        drop(state);

        info!(
            count,
            rate = final_rate,
            elapsed = snapshot.time,
            unit = ?snapshot.time_unit,
            "Recording finished"
        );
    }
}

fn discard_folder(folder: &Path) {
    if let Err(err) = fs::remove_dir_all(folder) {
        warn!("Failed to remove {}: {err}", folder.display());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use ml_core::{ClassNames, Detection, FixedOracle};
    use video_ingest::{CameraSettings, SimulatedBackend};

    use super::*;
    use crate::capture::mailbox::{DASHBOARD, USER_INTERFACE};

    const SMALL: Resolution = Resolution::new(48, 64);

    fn names() -> ClassNames {
        ClassNames::from([(0, "hole".to_string()), (1, "stain".to_string())])
    }

    fn recorder(backend: SimulatedBackend, output: &Path) -> Recorder {
        let params = CaptureParameters {
            resolution: SMALL,
            ..CaptureParameters::default()
        };
        let camera = Arc::new(CameraSource::new(
            backend,
            CameraSettings {
                device: 0,
                resolution: SMALL,
            },
        ));
        let oracle = FixedOracle::new(
            names(),
            vec![Detection {
                class_id: 1,
                score: 0.8,
                bbox_xyxy: [8.0, 8.0, 40.0, 32.0],
            }],
        );
        Recorder::new(camera, Arc::new(oracle), params, output.to_path_buf())
    }

    fn overrides(photos_per_second: f64, minutes: f64) -> ParameterOverrides {
        ParameterOverrides {
            photos_per_second: Some(photos_per_second),
            max_time_interval_minutes: Some(minutes),
            ..ParameterOverrides::default()
        }
    }

    fn files_with_extension(folder: &Path, extension: &str) -> Vec<PathBuf> {
        fs::read_dir(folder)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension() == Some(OsStr::new(extension)))
            .filter(|path| path.file_name() != Some(OsStr::new("labels.txt")))
            .collect()
    }

    fn wait_for_idle(recorder: &Recorder, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while recorder.state() != SessionState::Idle {
            assert!(Instant::now() < deadline, "session did not finish");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn session_folders(output: &Path) -> Vec<PathBuf> {
        fs::read_dir(output)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.is_dir()
                    && path
                        .file_name()
                        .and_then(OsStr::to_str)
                        .is_some_and(|name| name.starts_with("photos"))
            })
            .collect()
    }

    #[test]
    fn second_start_is_a_conflict() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(SimulatedBackend::new(20.0), output.path());
        let folder = recorder.start(overrides(10.0, 0.0)).unwrap();
        thread::sleep(Duration::from_millis(300));
        let before = recorder.stats().take(DASHBOARD).unwrap();

        assert!(matches!(
            recorder.start(overrides(5.0, 0.0)),
            Err(CommandError::SessionConflict)
        ));
        assert_eq!(recorder.state(), SessionState::Running);
        assert_eq!(recorder.params().photos_per_second, 10.0);

        // The running session keeps publishing into the same mailboxes.
        thread::sleep(Duration::from_millis(300));
        let after = recorder.stats().take(DASHBOARD).unwrap();
        assert!(after.recording);
        assert_eq!(after.folder, before.folder);
        assert_eq!(after.folder, folder.display().to_string());
        assert!(after.count >= before.count);
        assert_eq!(session_folders(output.path()), vec![folder]);

        assert_eq!(recorder.stop(), RECORDING_STOPPED);
    }

    #[test]
    fn oversized_parameters_are_rejected_and_recorder_stays_usable() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(SimulatedBackend::new(20.0), output.path());

        for bad in [overrides(10.0, 1e300), overrides(1e-300, 0.0)] {
            assert!(matches!(
                recorder.start(bad),
                Err(CommandError::InvalidParameters(_))
            ));
            assert_eq!(recorder.state(), SessionState::Idle);
            assert!(session_folders(output.path()).is_empty());
            assert_eq!(recorder.stop(), NOT_RECORDING);
        }

        let folder = recorder.start(overrides(10.0, 0.0)).unwrap();
        assert_eq!(recorder.state(), SessionState::Running);
        assert_eq!(session_folders(output.path()), vec![folder]);
        assert_eq!(recorder.stop(), RECORDING_STOPPED);
        assert_eq!(recorder.state(), SessionState::Idle);
    }

    #[test]
    fn start_guard_resets_state_when_launch_unwinds() {
        let state = Mutex::new(SessionState::Starting);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = StartGuard {
                state: &state,
                armed: true,
            };
            panic!("launch failed");
        }));
        assert!(result.is_err());
        assert_eq!(*lock(&state), SessionState::Idle);

        *lock(&state) = SessionState::Running;
        StartGuard {
            state: &state,
            armed: true,
        }
        .disarm();
        assert_eq!(*lock(&state), SessionState::Running);
    }

    #[test]
    fn camera_failure_on_start_leaves_no_folder() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(
            SimulatedBackend::new(20.0).with_unavailable_device(3),
            output.path(),
        );
        let result = recorder.start(ParameterOverrides {
            camera_device: Some(3),
            ..ParameterOverrides::default()
        });
        assert!(matches!(result, Err(CommandError::Capture(_))));
        assert_eq!(recorder.state(), SessionState::Idle);
        assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
        assert_eq!(recorder.params().camera_device, 3);
    }

    #[test]
    fn invalid_overrides_are_rejected_without_side_effects() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(SimulatedBackend::new(20.0), output.path());
        let result = recorder.start(ParameterOverrides {
            save_format: Some("gif".to_string()),
            ..ParameterOverrides::default()
        });
        assert!(matches!(result, Err(CommandError::InvalidParameters(_))));
        assert_eq!(recorder.params().save_format, "jpeg");
        assert_eq!(recorder.state(), SessionState::Idle);
    }

    #[test]
    fn session_ends_on_its_deadline_and_leaves_labelled_frames() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(SimulatedBackend::new(20.0), output.path());
        let folder = recorder.start(overrides(10.0, 0.1)).unwrap();

        let initial = recorder.stats().take(USER_INTERFACE).unwrap();
        assert!(initial.recording);

        thread::sleep(Duration::from_secs(6));
        wait_for_idle(&recorder, Duration::from_secs(4));
        assert!(!recorder.is_recording());
        assert!(recorder.latest_preview().is_none());

        let legend = fs::read_to_string(folder.join("labels.txt")).unwrap();
        assert_eq!(legend, "0: hole\n1: stain\n");

        let labels = files_with_extension(&folder, "txt");
        let images = files_with_extension(&folder, "jpeg");
        assert!(!labels.is_empty());
        assert_eq!(labels.len(), images.len());
        for path in &labels {
            let body = fs::read_to_string(path).unwrap();
            let lines: Vec<&str> = body.lines().collect();
            assert_eq!(lines.len(), 1, "{}", path.display());
            let fields: Vec<&str> = lines[0].split(' ').collect();
            assert_eq!(fields.len(), 5);
            assert_eq!(fields[0], "1");
            for value in &fields[1..] {
                let value: f64 = value.parse().unwrap();
                assert!((0.0..=1.0).contains(&value));
            }
        }

        let terminal = recorder.stats().take(DASHBOARD).unwrap();
        assert!(!terminal.recording);
        assert_eq!(terminal.count, images.len() as u64);
        assert!(terminal.rate > 0.0 && terminal.rate <= 25.0);

        // The deadline already finalized the session.
        assert_eq!(recorder.stop(), NOT_RECORDING);
    }

    #[test]
    fn unthrottled_session_persists_every_frame_until_stopped() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(SimulatedBackend::new(50.0), output.path());
        let folder = recorder.start(overrides(0.0, 0.0)).unwrap();

        thread::sleep(Duration::from_millis(600));
        assert!(recorder.is_recording());
        assert!(recorder.latest_preview().is_some());
        assert_eq!(recorder.stop(), RECORDING_STOPPED);

        let images = files_with_extension(&folder, "jpeg").len() as u64;
        assert!(images >= 10, "only {images} frames persisted");

        let terminal = recorder.stats().take(DASHBOARD).unwrap();
        assert!(!terminal.recording);
        assert_eq!(terminal.count, images);
        assert_eq!(recorder.stats().take(DASHBOARD), None);
        assert_eq!(
            recorder.stats().take(USER_INTERFACE).map(|s| s.count),
            Some(images)
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(SimulatedBackend::new(20.0), output.path());
        assert_eq!(recorder.stop(), NOT_RECORDING);

        recorder.start(overrides(5.0, 0.0)).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(recorder.stop(), RECORDING_STOPPED);
        assert_eq!(recorder.stop(), NOT_RECORDING);
        assert_eq!(recorder.state(), SessionState::Idle);

        // A fresh session starts counting from zero in a new folder.
        let second = recorder.start(overrides(5.0, 0.0)).unwrap();
        let initial = recorder.stats().take(DASHBOARD).unwrap();
        assert_eq!(initial.count, 0);
        assert_eq!(initial.folder, second.display().to_string());
        recorder.stop();
    }

    #[test]
    fn camera_errors_during_recording_are_retried() {
        let output = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new(50.0);
        let failures = backend.read_failures();
        let opens = backend.open_counter();
        let recorder = recorder(backend, output.path());
        let folder = recorder.start(overrides(0.0, 0.0)).unwrap();

        failures.fail_next(3);
        thread::sleep(Duration::from_millis(800));
        assert!(recorder.is_recording());
        recorder.stop();

        assert!(opens.get() >= 2);
        assert!(!files_with_extension(&folder, "jpeg").is_empty());
    }

    #[test]
    fn reconfigure_updates_parameters_and_reports_failures() {
        let output = tempfile::tempdir().unwrap();
        let recorder = recorder(
            SimulatedBackend::new(20.0).with_unavailable_device(7),
            output.path(),
        );
        recorder
            .reconfigure_resolution(Resolution::new(24, 32))
            .unwrap();
        assert_eq!(recorder.params().resolution, Resolution::new(24, 32));
        assert!(recorder.camera().is_open());

        assert!(matches!(
            recorder.reconfigure_camera(7),
            Err(CommandError::Reconfiguration(_))
        ));
        assert_eq!(recorder.params().camera_device, 7);
        assert!(!recorder.camera().is_open());
    }
}
