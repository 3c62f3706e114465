//! Feedback controller that keeps the persisted-frame rate near a target.
//!
//! The controller never sees detector latency directly. It measures how many
//! frames were persisted over a rolling window and nudges the minimum spacing
//! between persisted frames (`delta`) up or down proportionally to the error.

use std::time::{Duration, Instant};

use crate::capture::stats::round_to;

/// Minimum measurement window.
pub const RATE_WINDOW: Duration = Duration::from_millis(500);
/// Fraction of `delta` corrected per window at 100% relative error.
const ADJUSTMENT_FACTOR: f64 = 0.1;
/// Measured rates closer than this to the target are left alone.
const DEADBAND_FPS: f64 = 0.1;
/// Starting spacing as a fraction of the nominal frame period.
const INITIAL_DELTA_FACTOR: f64 = 0.4;

#[derive(Debug, Clone)]
pub struct AdaptiveRateController {
    target_fps: f64,
    delta: f64,
    max_delta: f64,
    last_persist: Instant,
    window_start: Instant,
    persisted_in_window: u32,
    measured_fps: f64,
}

impl AdaptiveRateController {
    /// `target_fps == 0` disables throttling.
    pub fn new(target_fps: f64, now: Instant) -> Self {
        let throttled = target_fps > 0.0;
        Self {
            target_fps: target_fps.max(0.0),
            delta: if throttled {
                (INITIAL_DELTA_FACTOR / target_fps).min(f64::MAX)
            } else {
                0.0
            },
            max_delta: if throttled {
                (1.0 / (target_fps * 0.5)).min(f64::MAX)
            } else {
                0.0
            },
            last_persist: now,
            window_start: now,
            persisted_in_window: 0,
            measured_fps: 0.0,
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.target_fps > 0.0
    }

    /// Current spacing between persisted frames, in seconds.
    pub fn delta_secs(&self) -> f64 {
        self.delta
    }

    pub fn max_delta_secs(&self) -> f64 {
        self.max_delta
    }

    /// Persisted rate measured over the last closed window.
    pub fn measured_fps(&self) -> f64 {
        self.measured_fps
    }

    /// Close the measurement window if due and retune `delta`.
    pub fn update(&mut self, now: Instant) {
        let window = now.saturating_duration_since(self.window_start);
        if window < RATE_WINDOW || self.persisted_in_window == 0 {
            return;
        }
        let actual = self.persisted_in_window as f64 / window.as_secs_f64();
        // Reported with one decimal; the controller tunes on the raw rate.
        self.measured_fps = round_to(actual, 1);

        if self.is_throttled() && (actual - self.target_fps).abs() > DEADBAND_FPS {
            let error = self.target_fps - actual;
            let adjustment = self.delta * ADJUSTMENT_FACTOR * (error / self.target_fps);
            self.delta = (self.delta - adjustment).clamp(0.0, self.max_delta);
        }

        self.window_start = now;
        self.persisted_in_window = 0;
    }

    /// Whether a frame arriving at `now` should be written to disk.
    ///
    /// Compared in seconds so a spacing longer than any `Duration` simply
    /// never comes due.
    pub fn is_due(&self, now: Instant) -> bool {
        !self.is_throttled()
            || now.saturating_duration_since(self.last_persist).as_secs_f64() >= self.delta
    }

    pub fn record_persist(&mut self, now: Instant) {
        self.last_persist = now;
        self.persisted_in_window += 1;
    }

    /// Final rate over the still-open window, for the terminal snapshot.
    pub fn finish(&mut self, now: Instant) -> f64 {
        let window = now.saturating_duration_since(self.window_start);
        if !window.is_zero() && self.persisted_in_window > 0 {
            self.measured_fps =
                round_to(self.persisted_in_window as f64 / window.as_secs_f64(), 1);
        }
        self.measured_fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the controller with frames arriving every `frame_interval`,
    /// returning how many were persisted during the last `tail` of the run.
    fn simulate(
        controller: &mut AdaptiveRateController,
        start: Instant,
        frame_interval: Duration,
        total: Duration,
        tail: Duration,
    ) -> u32 {
        let frames = (total.as_nanos() / frame_interval.as_nanos()) as u32;
        let tail_start = start + total - tail;
        let mut persisted_in_tail = 0;
        for i in 1..=frames {
            let now = start + frame_interval * i;
            controller.update(now);
            if controller.is_due(now) {
                controller.record_persist(now);
                if now > tail_start {
                    persisted_in_tail += 1;
                }
            }
        }
        persisted_in_tail
    }

    #[test]
    fn initial_delta_is_forty_percent_of_period() {
        let controller = AdaptiveRateController::new(10.0, Instant::now());
        assert!((controller.delta_secs() - 0.04).abs() < 1e-12);
        assert!((controller.max_delta_secs() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn zero_target_persists_every_frame() {
        let start = Instant::now();
        let mut controller = AdaptiveRateController::new(0.0, start);
        assert_eq!(controller.delta_secs(), 0.0);
        let persisted = simulate(
            &mut controller,
            start,
            Duration::from_millis(10),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        assert_eq!(persisted, 200);
        assert_eq!(controller.delta_secs(), 0.0);
    }

    #[test]
    fn converges_to_target_when_camera_is_faster() {
        let start = Instant::now();
        let mut controller = AdaptiveRateController::new(10.0, start);
        let persisted = simulate(
            &mut controller,
            start,
            Duration::from_millis(50),
            Duration::from_secs(20),
            Duration::from_secs(5),
        );
        let rate = persisted as f64 / 5.0;
        assert!((rate - 10.0).abs() <= 0.2, "tail rate {rate}");
        assert!((controller.measured_fps() - 10.0).abs() <= 0.2);
    }

    #[test]
    fn delta_never_exceeds_half_rate_bound() {
        let start = Instant::now();
        let mut controller = AdaptiveRateController::new(2.0, start);
        simulate(
            &mut controller,
            start,
            Duration::from_millis(1),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        assert!(controller.delta_secs() <= controller.max_delta_secs());
        assert!(controller.delta_secs() > 0.2);
    }

    #[test]
    fn slow_camera_drives_delta_towards_zero() {
        let start = Instant::now();
        let mut controller = AdaptiveRateController::new(30.0, start);
        simulate(
            &mut controller,
            start,
            Duration::from_millis(100),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        assert!(controller.delta_secs() < 0.4 / 30.0 * 0.01);
        assert!((controller.measured_fps() - 10.0).abs() <= 0.2);
    }

    #[test]
    fn vanishing_target_never_overflows() {
        let start = Instant::now();
        for target in [1e-300, f64::MIN_POSITIVE, 5e-324] {
            let mut controller = AdaptiveRateController::new(target, start);
            assert!(controller.delta_secs().is_finite());
            assert!(controller.delta_secs() <= controller.max_delta_secs());
            assert!(!controller.is_due(start + Duration::from_secs(3600)));

            controller.record_persist(start);
            let later = start + Duration::from_secs(1);
            controller.update(later);
            assert!(controller.delta_secs().is_finite());
            assert!(!controller.is_due(later));
            assert_eq!(controller.measured_fps(), 1.0);
        }
    }

    #[test]
    fn finish_measures_open_window() {
        let start = Instant::now();
        let mut controller = AdaptiveRateController::new(0.0, start);
        for i in 1..=3 {
            controller.record_persist(start + Duration::from_millis(100 * i));
        }
        let rate = controller.finish(start + Duration::from_millis(300));
        assert_eq!(rate, 10.0);
    }
}
