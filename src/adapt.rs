//! Progressive quality and frame-rate adaptation.
//!
//! One [`QualityController`] state machine serves both the global stream
//! (applied to the shared encoder) and each client (applied to that
//! client's delivery pacing only, since the shared encoder cannot serve
//! different qualities per client without transcoding). Degradation steps
//! are always at least as large as recovery steps at the same confidence
//! tier, which is what keeps the controller from oscillating.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::metrics::{AssessReason, Assessment, WindowSet, WindowSetStats};

/// Floor/ceiling bounds enforced after every adaptation step.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdaptLimits {
    pub min_quality: u8,
    pub max_quality: u8,
    pub min_fps: u32,
    pub max_fps: u32,
}

impl AdaptLimits {
    pub fn clamp_quality(&self, quality: u8) -> u8 {
        quality.clamp(self.min_quality, self.max_quality)
    }

    pub fn clamp_fps(&self, fps: u32) -> u32 {
        fps.clamp(self.min_fps, self.max_fps)
    }
}

/// Degrade/recover step sizes per confidence tier.
///
/// Degrade entries must dominate the recover entry of the same tier.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StepTable {
    pub quality_degrade_emergency: u8,
    pub quality_degrade_major: u8,
    pub quality_degrade_minor: u8,
    pub quality_recover_high: u8,
    pub quality_recover_mid: u8,
    pub quality_recover_low: u8,
    pub fps_degrade_emergency: u32,
    pub fps_degrade_major: u32,
    pub fps_degrade_minor: u32,
    pub fps_recover_high: u32,
    pub fps_recover_mid: u32,
    pub fps_recover_low: u32,
}

impl StepTable {
    /// Steps for the global controller driving the shared encoder.
    pub fn global() -> Self {
        Self {
            quality_degrade_emergency: 30,
            quality_degrade_major: 15,
            quality_degrade_minor: 10,
            quality_recover_high: 15,
            quality_recover_mid: 10,
            quality_recover_low: 5,
            fps_degrade_emergency: 12,
            fps_degrade_major: 6,
            fps_degrade_minor: 3,
            fps_recover_high: 4,
            fps_recover_mid: 3,
            fps_recover_low: 2,
        }
    }

    /// Gentler steps for per-client pacing controllers.
    pub fn per_client() -> Self {
        Self {
            quality_degrade_emergency: 20,
            quality_degrade_major: 10,
            quality_degrade_minor: 5,
            quality_recover_high: 10,
            quality_recover_mid: 5,
            quality_recover_low: 5,
            fps_degrade_emergency: 10,
            fps_degrade_major: 4,
            fps_degrade_minor: 2,
            fps_recover_high: 4,
            fps_recover_mid: 2,
            fps_recover_low: 2,
        }
    }

    fn quality_degrade(&self, assessment: &Assessment) -> u8 {
        if assessment.reason == AssessReason::EmergencyDeliveryRatio {
            self.quality_degrade_emergency
        } else if assessment.confidence > 0.8 {
            self.quality_degrade_major
        } else {
            self.quality_degrade_minor
        }
    }

    fn quality_recover(&self, assessment: &Assessment) -> u8 {
        if assessment.confidence > 0.8 {
            self.quality_recover_high
        } else if assessment.confidence > 0.7 {
            self.quality_recover_mid
        } else {
            self.quality_recover_low
        }
    }

    fn fps_degrade(&self, assessment: &Assessment) -> u32 {
        if assessment.reason == AssessReason::EmergencyDeliveryRatio {
            self.fps_degrade_emergency
        } else if assessment.confidence > 0.8 {
            self.fps_degrade_major
        } else {
            self.fps_degrade_minor
        }
    }

    fn fps_recover(&self, assessment: &Assessment) -> u32 {
        if assessment.confidence > 0.8 {
            self.fps_recover_high
        } else if assessment.confidence > 0.7 {
            self.fps_recover_mid
        } else {
            self.fps_recover_low
        }
    }
}

/// Result of one adaptation evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationResult {
    /// False when the windows held too few samples to decide.
    pub available: bool,
    /// True when the interval rate limit suppressed this evaluation.
    pub rate_limited: bool,
    pub adapted: bool,
    pub quality_changed: bool,
    pub fps_changed: bool,
    pub quality: u8,
    pub fps: u32,
    pub reason: AssessReason,
    pub confidence: f64,
}

impl AdaptationResult {
    fn idle(quality: u8, fps: u32, rate_limited: bool) -> Self {
        Self {
            available: !rate_limited,
            rate_limited,
            adapted: false,
            quality_changed: false,
            fps_changed: false,
            quality,
            fps,
            reason: AssessReason::Stable,
            confidence: 0.0,
        }
    }
}

/// Serializable controller status for the reporting surface.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationStatus {
    pub current_quality: u8,
    pub current_fps: u32,
    pub limits: AdaptLimits,
    pub consecutive_good_windows: u32,
    pub consecutive_poor_windows: u32,
    pub time_since_last_adaptation_secs: Option<f64>,
    pub windows: WindowSetStats,
}

/// Progressive adaptation state machine over a [`WindowSet`].
#[derive(Debug)]
pub struct QualityController {
    limits: AdaptLimits,
    steps: StepTable,
    windows: WindowSet,
    current_quality: u8,
    current_fps: u32,
    quality_enabled: bool,
    fps_enabled: bool,
    consecutive_good: u32,
    consecutive_poor: u32,
    last_adaptation: Option<Instant>,
    min_adaptation_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl QualityController {
    pub fn new(
        limits: AdaptLimits,
        steps: StepTable,
        min_adaptation_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limits,
            steps,
            windows: WindowSet::new(clock.clone()),
            current_quality: limits.max_quality,
            current_fps: limits.max_fps,
            quality_enabled: true,
            fps_enabled: true,
            consecutive_good: 0,
            consecutive_poor: 0,
            last_adaptation: None,
            min_adaptation_interval,
            clock,
        }
    }

    pub fn current_quality(&self) -> u8 {
        self.current_quality
    }

    pub fn current_fps(&self) -> u32 {
        self.current_fps
    }

    pub fn limits(&self) -> AdaptLimits {
        self.limits
    }

    /// Gates automatic changes per axis. Manual overrides still work
    /// when an axis is disabled.
    pub fn set_enabled(&mut self, quality: bool, fps: bool) {
        self.quality_enabled = quality;
        self.fps_enabled = fps;
    }

    /// Feeds one measurement pair into the controller's windows.
    pub fn feed(&mut self, delivery_ratio: f64, delivery_time_secs: f64) {
        self.windows.record_delivery_ratio(delivery_ratio.clamp(0.0, 1.0));
        self.windows.record_delivery_time(delivery_time_secs);
    }

    pub fn windows_mut(&mut self) -> &mut WindowSet {
        &mut self.windows
    }

    /// Runs one adaptation evaluation.
    ///
    /// Skips (rate-limited) until `min_adaptation_interval` has elapsed
    /// since the previous evaluation; no-ops (`available = false`) while
    /// the windows lack samples. Neutral assessments leave the good/poor
    /// streak counters untouched so a recovery streak can survive a quiet
    /// window.
    pub fn perform_adaptation(&mut self) -> AdaptationResult {
        let now = self.clock.now();
        if let Some(last) = self.last_adaptation {
            if now.saturating_duration_since(last) < self.min_adaptation_interval {
                return AdaptationResult::idle(self.current_quality, self.current_fps, true);
            }
        }

        let assessment = self.windows.assess();
        if !assessment.available {
            return AdaptationResult {
                available: false,
                ..AdaptationResult::idle(self.current_quality, self.current_fps, false)
            };
        }

        self.last_adaptation = Some(now);

        let mut quality_changed = false;
        let mut fps_changed = false;

        if assessment.should_degrade {
            self.consecutive_good = 0;
            self.consecutive_poor += 1;

            let new_quality = if self.quality_enabled {
                self.limits
                    .clamp_quality(self.current_quality.saturating_sub(self.steps.quality_degrade(&assessment)))
            } else {
                self.current_quality
            };
            let new_fps = if self.fps_enabled {
                self.limits
                    .clamp_fps(self.current_fps.saturating_sub(self.steps.fps_degrade(&assessment)))
            } else {
                self.current_fps
            };

            quality_changed = new_quality != self.current_quality;
            fps_changed = new_fps != self.current_fps;
            self.current_quality = new_quality;
            self.current_fps = new_fps;

            if quality_changed || fps_changed {
                info!(
                    "Degraded to quality {}%, {} fps ({}, confidence {:.0}%)",
                    self.current_quality,
                    self.current_fps,
                    assessment.reason,
                    assessment.confidence * 100.0
                );
            }
        } else if assessment.should_recover {
            self.consecutive_poor = 0;
            self.consecutive_good += 1;

            let required = if assessment.confidence > 0.8 { 1 } else { 2 };
            if self.consecutive_good >= required {
                let new_quality = if self.quality_enabled {
                    self.limits
                        .clamp_quality(self.current_quality.saturating_add(self.steps.quality_recover(&assessment)))
                } else {
                    self.current_quality
                };
                let new_fps = if self.fps_enabled {
                    self.limits
                        .clamp_fps(self.current_fps.saturating_add(self.steps.fps_recover(&assessment)))
                } else {
                    self.current_fps
                };

                quality_changed = new_quality != self.current_quality;
                fps_changed = new_fps != self.current_fps;
                self.current_quality = new_quality;
                self.current_fps = new_fps;

                // Partial credit keeps headroom for continued recovery
                // without demanding a fresh full streak.
                self.consecutive_good = self.consecutive_good.saturating_sub(1);

                if quality_changed || fps_changed {
                    info!(
                        "Recovered to quality {}%, {} fps (confidence {:.0}%)",
                        self.current_quality,
                        self.current_fps,
                        assessment.confidence * 100.0
                    );
                }
            } else {
                debug!(
                    "Recovery streak {}/{} (confidence {:.0}%)",
                    self.consecutive_good,
                    required,
                    assessment.confidence * 100.0
                );
            }
        }

        AdaptationResult {
            available: true,
            rate_limited: false,
            adapted: quality_changed || fps_changed,
            quality_changed,
            fps_changed,
            quality: self.current_quality,
            fps: self.current_fps,
            reason: assessment.reason,
            confidence: assessment.confidence,
        }
    }

    /// Restores configured maxima, clears streak counters and windows.
    /// Called when a stream is (re)started.
    pub fn reset_to_maximum(&mut self) {
        self.current_quality = self.limits.max_quality;
        self.current_fps = self.limits.max_fps;
        self.consecutive_good = 0;
        self.consecutive_poor = 0;
        self.last_adaptation = None;
        self.windows.clear_all();
        info!(
            "Reset to maximum: quality {}%, {} fps",
            self.current_quality, self.current_fps
        );
    }

    /// Manual quality override, clamped to the configured range.
    pub fn force_quality(&mut self, quality: u8) -> u8 {
        self.current_quality = self.limits.clamp_quality(quality);
        info!("Quality manually set to {}%", self.current_quality);
        self.current_quality
    }

    /// Manual frame-rate override, clamped to the configured range.
    pub fn force_fps(&mut self, fps: u32) -> u32 {
        self.current_fps = self.limits.clamp_fps(fps);
        info!("Frame rate manually set to {} fps", self.current_fps);
        self.current_fps
    }

    pub fn status(&mut self) -> AdaptationStatus {
        let now = self.clock.now();
        AdaptationStatus {
            current_quality: self.current_quality,
            current_fps: self.current_fps,
            limits: self.limits,
            consecutive_good_windows: self.consecutive_good,
            consecutive_poor_windows: self.consecutive_poor,
            time_since_last_adaptation_secs: self
                .last_adaptation
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
            windows: self.windows.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limits() -> AdaptLimits {
        AdaptLimits {
            min_quality: 30,
            max_quality: 85,
            min_fps: 2,
            max_fps: 30,
        }
    }

    fn controller() -> (QualityController, ManualClock) {
        let clock = ManualClock::new();
        let c = QualityController::new(
            limits(),
            StepTable::global(),
            Duration::from_secs(2),
            Arc::new(clock.clone()),
        );
        (c, clock)
    }

    fn feed_ratio(c: &mut QualityController, clock: &ManualClock, ratio: f64, count: usize) {
        for _ in 0..count {
            c.feed(ratio, 0.0);
            clock.advance_secs(0.5);
        }
    }

    #[test]
    fn no_data_is_a_noop() {
        let (mut c, _) = controller();
        let result = c.perform_adaptation();
        assert!(!result.available);
        assert!(!result.adapted);
        assert_eq!(c.current_quality(), 85);
        assert_eq!(c.current_fps(), 30);
    }

    #[test]
    fn emergency_degrade_takes_large_step() {
        let (mut c, clock) = controller();
        feed_ratio(&mut c, &clock, 0.05, 10);

        let result = c.perform_adaptation();
        assert!(result.adapted);
        assert_eq!(result.reason, AssessReason::EmergencyDeliveryRatio);
        assert_eq!(c.current_quality(), 55); // 85 - 30
        assert_eq!(c.current_fps(), 18); // 30 - 12
    }

    #[test]
    fn degrade_never_breaks_floor() {
        let (mut c, clock) = controller();

        for _ in 0..20 {
            feed_ratio(&mut c, &clock, 0.05, 5);
            c.perform_adaptation();
            clock.advance_secs(3.0);
        }

        assert_eq!(c.current_quality(), 30);
        assert_eq!(c.current_fps(), 2);
    }

    #[test]
    fn rate_limit_skips_back_to_back_calls() {
        let (mut c, clock) = controller();
        feed_ratio(&mut c, &clock, 0.05, 10);

        let first = c.perform_adaptation();
        assert!(first.adapted);

        let second = c.perform_adaptation();
        assert!(second.rate_limited);
        assert!(!second.adapted);

        clock.advance_secs(3.0);
        feed_ratio(&mut c, &clock, 0.05, 2);
        let third = c.perform_adaptation();
        assert!(!third.rate_limited);
    }

    #[test]
    fn high_confidence_recovery_needs_one_good_window() {
        let (mut c, clock) = controller();

        // Degrade first so there is room to recover.
        feed_ratio(&mut c, &clock, 0.05, 10);
        c.perform_adaptation();
        let degraded_quality = c.current_quality();

        // Excellent stable performance: confidence 0.80 + 0.1 time boost.
        clock.advance_secs(31.0);
        for _ in 0..20 {
            c.feed(1.0, 0.1);
            clock.advance_secs(1.0);
        }
        let result = c.perform_adaptation();
        assert!(result.confidence > 0.8);
        assert!(result.adapted);
        assert!(c.current_quality() > degraded_quality);
    }

    #[test]
    fn low_confidence_recovery_needs_two_good_windows() {
        let clock = ManualClock::new();
        let mut c = QualityController::new(
            limits(),
            StepTable::global(),
            Duration::from_secs(2),
            Arc::new(clock.clone()),
        );

        feed_ratio(&mut c, &clock, 0.05, 10);
        c.perform_adaptation();
        let degraded_quality = c.current_quality();

        // Good performance without the delivery-time boost: confidence 0.80.
        clock.advance_secs(31.0);
        for _ in 0..20 {
            c.feed(0.9, 0.0);
            clock.advance_secs(1.0);
        }

        let first = c.perform_adaptation();
        assert!(!first.adapted, "one good window must not recover at confidence <= 0.8");
        assert_eq!(c.current_quality(), degraded_quality);

        clock.advance_secs(3.0);
        for _ in 0..3 {
            c.feed(0.9, 0.0);
            clock.advance_secs(1.0);
        }
        let second = c.perform_adaptation();
        assert!(second.adapted);
        assert!(c.current_quality() > degraded_quality);
    }

    #[test]
    fn quality_and_fps_always_within_limits() {
        let (mut c, clock) = controller();

        // Alternate harsh and excellent signals.
        for round in 0..12 {
            let ratio = if round % 2 == 0 { 0.02 } else { 0.98 };
            feed_ratio(&mut c, &clock, ratio, 6);
            c.perform_adaptation();
            clock.advance_secs(3.0);

            let l = c.limits();
            assert!(c.current_quality() >= l.min_quality);
            assert!(c.current_quality() <= l.max_quality);
            assert!(c.current_fps() >= l.min_fps);
            assert!(c.current_fps() <= l.max_fps);
        }
    }

    #[test]
    fn degrade_steps_dominate_recover_steps() {
        for steps in [StepTable::global(), StepTable::per_client()] {
            assert!(steps.quality_degrade_emergency >= steps.quality_recover_high);
            assert!(steps.quality_degrade_major >= steps.quality_recover_high);
            assert!(steps.quality_degrade_minor >= steps.quality_recover_low);
            assert!(steps.fps_degrade_emergency >= steps.fps_recover_high);
            assert!(steps.fps_degrade_major >= steps.fps_recover_mid);
            assert!(steps.fps_degrade_minor >= steps.fps_recover_low);
        }
    }

    #[test]
    fn reset_restores_maxima_and_clears_windows() {
        let (mut c, clock) = controller();
        feed_ratio(&mut c, &clock, 0.05, 10);
        c.perform_adaptation();
        assert!(c.current_quality() < 85);

        c.reset_to_maximum();
        assert_eq!(c.current_quality(), 85);
        assert_eq!(c.current_fps(), 30);
        assert!(c.windows_mut().is_empty());

        let status = c.status();
        assert_eq!(status.consecutive_good_windows, 0);
        assert_eq!(status.consecutive_poor_windows, 0);
    }

    #[test]
    fn disabled_axes_hold_still_under_degradation() {
        let (mut c, clock) = controller();
        c.set_enabled(false, true);
        feed_ratio(&mut c, &clock, 0.05, 10);

        let result = c.perform_adaptation();
        assert!(result.adapted);
        assert!(!result.quality_changed);
        assert!(result.fps_changed);
        assert_eq!(c.current_quality(), 85);
        assert_eq!(c.current_fps(), 18);
    }

    #[test]
    fn force_overrides_are_clamped() {
        let (mut c, _) = controller();
        assert_eq!(c.force_quality(10), 30);
        assert_eq!(c.force_quality(100), 85);
        assert_eq!(c.force_quality(60), 60);
        assert_eq!(c.force_fps(1), 2);
        assert_eq!(c.force_fps(100), 30);
        assert_eq!(c.force_fps(15), 15);
    }

    #[test]
    fn neutral_reading_preserves_good_streak() {
        let clock = ManualClock::new();
        let mut c = QualityController::new(
            limits(),
            StepTable::global(),
            Duration::from_secs(2),
            Arc::new(clock.clone()),
        );

        feed_ratio(&mut c, &clock, 0.05, 10);
        c.perform_adaptation();

        // One good window at confidence 0.8 (streak -> 1, no change yet).
        clock.advance_secs(31.0);
        for _ in 0..20 {
            c.feed(0.9, 0.0);
            clock.advance_secs(1.0);
        }
        c.perform_adaptation();
        assert_eq!(c.status().consecutive_good_windows, 1);

        // Neutral window: fast avg ~0.6, no trend. Streak must survive.
        clock.advance_secs(31.0);
        for _ in 0..20 {
            c.feed(0.6, 0.0);
            clock.advance_secs(1.0);
        }
        c.perform_adaptation();
        assert_eq!(c.status().consecutive_good_windows, 1);
    }
}
