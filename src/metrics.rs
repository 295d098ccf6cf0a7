//! Time-windowed performance metrics.
//!
//! Converts raw sample streams into decision-grade trend signals. Each
//! [`PerformanceWindow`] keeps samples within a wall-clock duration and
//! weights them by exponential decay; a [`WindowSet`] pairs a fast-decaying
//! degrade-detection window with a slower recovery-confirmation window so
//! degradation reacts quickly while recovery stays conservative.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::clock::Clock;

/// A single timestamped metric sample.
#[derive(Debug, Clone, Copy)]
pub struct MetricSample {
    pub at: Instant,
    pub value: f64,
}

/// Trend direction over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

/// Named windows tracked by a [`WindowSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    DeliveryRatioFast,
    DeliveryRatioStable,
    DeliveryTime,
}

/// Time-based sliding window with exponential-decay weighted averaging.
#[derive(Debug)]
pub struct PerformanceWindow {
    duration: Duration,
    decay_factor: f64,
    samples: VecDeque<MetricSample>,
    clock: Arc<dyn Clock>,
}

impl PerformanceWindow {
    pub fn new(duration: Duration, decay_factor: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            duration,
            decay_factor: decay_factor.clamp(0.0, 1.0),
            samples: VecDeque::new(),
            clock,
        }
    }

    /// Appends a sample and prunes anything older than the window.
    pub fn add_sample(&mut self, value: f64) {
        let now = self.clock.now();
        self.samples.push_back(MetricSample { at: now, value });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.duration) {
            while self
                .samples
                .front()
                .map(|s| s.at < cutoff)
                .unwrap_or(false)
            {
                self.samples.pop_front();
            }
        }
    }

    pub fn len(&mut self) -> usize {
        let now = self.clock.now();
        self.prune(now);
        self.samples.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Exponentially-decayed weighted mean. Recent samples dominate without
    /// older context being discarded entirely
    /// (`weight = decay_factor^(age / duration)`).
    pub fn weighted_average(&mut self) -> f64 {
        let now = self.clock.now();
        self.prune(now);
        if self.samples.is_empty() {
            return 0.0;
        }

        let duration = self.duration.as_secs_f64().max(f64::EPSILON);
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for sample in &self.samples {
            let age = now.saturating_duration_since(sample.at).as_secs_f64();
            let weight = self.decay_factor.powf(age / duration);
            weighted_sum += sample.value * weight;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        }
    }

    /// Simple mean of samples no older than `max_age`.
    pub fn recent_average(&mut self, max_age: Duration) -> f64 {
        let now = self.clock.now();
        self.prune(now);

        let mut sum = 0.0;
        let mut count = 0usize;
        for sample in &self.samples {
            if now.saturating_duration_since(sample.at) <= max_age {
                sum += sample.value;
                count += 1;
            }
        }
        if count > 0 {
            sum / count as f64
        } else {
            0.0
        }
    }

    /// Compares the mean of the most-recent half of the window against the
    /// mean of the rest. Changes below 0.01 read as stable.
    pub fn trend(&mut self) -> (Trend, f64) {
        let now = self.clock.now();
        self.prune(now);

        let half = self.duration / 2;
        let mut recent = (0.0, 0usize);
        let mut older = (0.0, 0usize);
        for sample in &self.samples {
            let age = now.saturating_duration_since(sample.at);
            if age <= half {
                recent.0 += sample.value;
                recent.1 += 1;
            } else {
                older.0 += sample.value;
                older.1 += 1;
            }
        }

        if recent.1 == 0 || older.1 == 0 {
            return (Trend::Stable, 0.0);
        }

        let recent_avg = recent.0 / recent.1 as f64;
        let older_avg = older.0 / older.1 as f64;
        let change = recent_avg - older_avg;

        if change.abs() < 0.01 {
            (Trend::Stable, 0.0)
        } else if change > 0.0 {
            (Trend::Improving, change)
        } else {
            (Trend::Degrading, change.abs())
        }
    }

    /// Statistics snapshot for diagnostics.
    pub fn stats(&mut self) -> WindowStats {
        let weighted_average = self.weighted_average();
        let (trend, trend_magnitude) = self.trend();
        let values: Vec<f64> = self.samples.iter().map(|s| s.value).collect();

        let (simple_average, min_value, max_value, std_dev) = if values.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            (mean, min, max, variance.sqrt())
        };

        WindowStats {
            sample_count: values.len(),
            weighted_average,
            simple_average,
            min_value,
            max_value,
            std_dev,
            trend,
            trend_magnitude,
            window_duration_secs: self.duration.as_secs_f64(),
        }
    }
}

/// Serializable per-window statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub sample_count: usize,
    pub weighted_average: f64,
    pub simple_average: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub std_dev: f64,
    pub trend: Trend,
    pub trend_magnitude: f64,
    pub window_duration_secs: f64,
}

/// Why an assessment recommends (or declines) an adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessReason {
    EmergencyDeliveryRatio,
    PoorDeliveryRatio,
    RapidDegradation,
    ExcellentStablePerformance,
    GoodImprovingPerformance,
    Stable,
    InsufficientData,
}

impl AssessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessReason::EmergencyDeliveryRatio => "emergency_delivery_ratio",
            AssessReason::PoorDeliveryRatio => "poor_delivery_ratio",
            AssessReason::RapidDegradation => "rapid_degradation",
            AssessReason::ExcellentStablePerformance => "excellent_stable_performance",
            AssessReason::GoodImprovingPerformance => "good_improving_performance",
            AssessReason::Stable => "stable",
            AssessReason::InsufficientData => "insufficient_data",
        }
    }
}

impl std::fmt::Display for AssessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified performance assessment.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub available: bool,
    pub should_degrade: bool,
    pub should_recover: bool,
    pub confidence: f64,
    pub reason: AssessReason,
    pub fast_average: f64,
    pub stable_average: f64,
}

impl Assessment {
    fn unavailable() -> Self {
        Self {
            available: false,
            should_degrade: false,
            should_recover: false,
            confidence: 0.0,
            reason: AssessReason::InsufficientData,
            fast_average: 0.0,
            stable_average: 0.0,
        }
    }
}

/// The standard window pairing for adaptive streaming: a short
/// fast-decaying window for degrade detection, a longer slow-decaying one
/// for recovery confirmation, and a delivery-time window for secondary
/// confirmation.
#[derive(Debug)]
pub struct WindowSet {
    fast: PerformanceWindow,
    stable: PerformanceWindow,
    delivery_time: PerformanceWindow,
}

impl WindowSet {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            fast: PerformanceWindow::new(Duration::from_secs(10), 0.95, clock.clone()),
            stable: PerformanceWindow::new(Duration::from_secs(30), 0.90, clock.clone()),
            delivery_time: PerformanceWindow::new(Duration::from_secs(15), 0.92, clock),
        }
    }

    pub fn add_sample(&mut self, kind: WindowKind, value: f64) {
        match kind {
            WindowKind::DeliveryRatioFast => self.fast.add_sample(value),
            WindowKind::DeliveryRatioStable => self.stable.add_sample(value),
            WindowKind::DeliveryTime => self.delivery_time.add_sample(value),
        }
    }

    /// Records a delivery outcome in both ratio windows.
    pub fn record_delivery_ratio(&mut self, ratio: f64) {
        self.fast.add_sample(ratio);
        self.stable.add_sample(ratio);
    }

    /// Records how long one frame delivery took.
    pub fn record_delivery_time(&mut self, secs: f64) {
        if secs > 0.0 {
            self.delivery_time.add_sample(secs);
        }
    }

    pub fn window_mut(&mut self, kind: WindowKind) -> &mut PerformanceWindow {
        match kind {
            WindowKind::DeliveryRatioFast => &mut self.fast,
            WindowKind::DeliveryRatioStable => &mut self.stable,
            WindowKind::DeliveryTime => &mut self.delivery_time,
        }
    }

    pub fn clear_all(&mut self) {
        self.fast.clear();
        self.stable.clear();
        self.delivery_time.clear();
    }

    pub fn is_empty(&mut self) -> bool {
        self.fast.is_empty() && self.stable.is_empty() && self.delivery_time.is_empty()
    }

    /// Unified assessment combining the delivery-ratio windows (primary
    /// signal, authoritative for the decision) with the delivery-time
    /// window (secondary confidence adjustment).
    pub fn assess(&mut self) -> Assessment {
        if self.fast.is_empty() {
            return Assessment::unavailable();
        }

        let fast_avg = self.fast.weighted_average();
        let (fast_trend, fast_magnitude) = self.fast.trend();
        let stable_avg = self.stable.weighted_average();
        let (stable_trend, _) = self.stable.trend();

        let mut should_degrade = false;
        let mut should_recover = false;
        let mut confidence: f64 = 0.0;
        let mut reason = AssessReason::Stable;

        // Degrade off the fast window (responsive), recover off the stable
        // window (conservative).
        if fast_avg < 0.10 {
            should_degrade = true;
            confidence = 0.95;
            reason = AssessReason::EmergencyDeliveryRatio;
        } else if fast_avg < 0.50 {
            should_degrade = true;
            confidence = 0.85;
            reason = AssessReason::PoorDeliveryRatio;
        } else if fast_trend == Trend::Degrading && fast_magnitude > 0.2 {
            should_degrade = true;
            confidence = 0.75;
            reason = AssessReason::RapidDegradation;
        } else if stable_avg > 0.85 && matches!(stable_trend, Trend::Stable | Trend::Improving) {
            should_recover = true;
            confidence = 0.80;
            reason = AssessReason::ExcellentStablePerformance;
        } else if stable_avg > 0.75 && stable_trend == Trend::Improving {
            should_recover = true;
            confidence = 0.70;
            reason = AssessReason::GoodImprovingPerformance;
        }

        // Secondary confirmation from delivery time.
        if !self.delivery_time.is_empty() {
            let time_avg = self.delivery_time.weighted_average();
            let time_says_degrade = time_avg > 1.5;
            if should_degrade && time_says_degrade {
                confidence += 0.2;
            } else if should_recover && !time_says_degrade {
                confidence += 0.1;
            } else if should_degrade && !time_says_degrade {
                confidence -= 0.1;
            }
        }

        Assessment {
            available: true,
            should_degrade,
            should_recover,
            confidence: confidence.clamp(0.0, 1.0),
            reason,
            fast_average: fast_avg,
            stable_average: stable_avg,
        }
    }

    /// Per-window statistics for the diagnostics surface.
    pub fn stats(&mut self) -> WindowSetStats {
        WindowSetStats {
            delivery_ratio_fast: self.fast.stats(),
            delivery_ratio_stable: self.stable.stats(),
            delivery_time: self.delivery_time.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowSetStats {
    pub delivery_ratio_fast: WindowStats,
    pub delivery_ratio_stable: WindowStats,
    pub delivery_time: WindowStats,
}
