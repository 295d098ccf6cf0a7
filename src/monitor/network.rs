//! Delivery-performance sampling and global adaptation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapt::{AdaptationResult, QualityController};
use crate::queue::{FrameBroadcastQueue, QueueMetrics};

const HISTORY_LEN: usize = 10;

/// Invoked when an adaptation changed the stream settings. Runs on the
/// monitor task, so keep it cheap.
pub type AdaptationCallback = Arc<dyn Fn(&AdaptationResult, &QueueMetrics) + Send + Sync>;

/// Short-horizon trend over recent delivery ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTrend {
    Improving,
    Degrading,
    Stable,
    /// High variance between consecutive samples.
    Unstable,
}

/// Result of one monitoring tick.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkCheck {
    /// None when no frames were scheduled for delivery this tick.
    pub delivery_ratio: Option<f64>,
    pub trend: NetworkTrend,
    pub adaptation: AdaptationResult,
    pub queue: QueueMetrics,
}

struct TickState {
    last_added: u64,
    last_consumed: u64,
    history: VecDeque<f64>,
}

/// Periodically measures delivery performance from the queue counters
/// and feeds the global quality controller.
pub struct NetworkMonitor {
    queue: Arc<FrameBroadcastQueue>,
    controller: Arc<Mutex<QualityController>>,
    interval: Duration,
    state: Mutex<TickState>,
    callback: Mutex<Option<AdaptationCallback>>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(
        queue: Arc<FrameBroadcastQueue>,
        controller: Arc<Mutex<QualityController>>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            controller,
            interval,
            state: Mutex::new(TickState {
                last_added: 0,
                last_consumed: 0,
                history: VecDeque::new(),
            }),
            callback: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: AdaptationCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Runs one monitoring tick. Exposed for deterministic tests; the
    /// background loop calls this on every interval.
    pub fn check_once(&self) -> NetworkCheck {
        let metrics = self.queue.metrics();

        let ratio = {
            let mut state = self.state.lock().unwrap();
            let delta_added = metrics.total_frames_added.saturating_sub(state.last_added);
            let delta_consumed = metrics
                .total_frames_consumed
                .saturating_sub(state.last_consumed);
            state.last_added = metrics.total_frames_added;
            state.last_consumed = metrics.total_frames_consumed;

            // Fan-out schedules one delivery per client per frame.
            let scheduled = delta_added * metrics.client_count as u64;
            if scheduled == 0 {
                None
            } else {
                let ratio = (delta_consumed as f64 / scheduled as f64).clamp(0.0, 1.0);
                if state.history.len() == HISTORY_LEN {
                    state.history.pop_front();
                }
                state.history.push_back(ratio);
                Some(ratio)
            }
        };

        let adaptation = {
            let mut controller = self.controller.lock().unwrap();
            if let Some(r) = ratio {
                controller.feed(r, 0.0);
            }
            controller.perform_adaptation()
        };

        if adaptation.adapted {
            info!(
                "Network adaptation: quality {}%, {} fps ({})",
                adaptation.quality, adaptation.fps, adaptation.reason
            );
        } else {
            debug!(
                "Network check: ratio {:?}, overflow rate {:.2}",
                ratio, metrics.overflow_rate
            );
        }

        let check = NetworkCheck {
            delivery_ratio: ratio,
            trend: self.trend(),
            adaptation,
            queue: metrics,
        };

        if check.adaptation.adapted {
            let callback = self.callback.lock().unwrap().clone();
            if let Some(cb) = callback {
                cb(&check.adaptation, &check.queue);
            }
        }

        check
    }

    /// Trend over the retained ratio history: last third against the
    /// rest, with a variance gate for flapping links.
    pub fn trend(&self) -> NetworkTrend {
        let state = self.state.lock().unwrap();
        let n = state.history.len();
        if n < 4 {
            return NetworkTrend::Stable;
        }

        let values: Vec<f64> = state.history.iter().copied().collect();
        let mean = values.iter().sum::<f64>() / n as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        if variance > 0.05 {
            return NetworkTrend::Unstable;
        }

        let split = n - n / 3;
        let recent = &values[split..];
        let older = &values[..split];
        let recent_avg = recent.iter().sum::<f64>() / recent.len() as f64;
        let older_avg = older.iter().sum::<f64>() / older.len() as f64;

        let change = recent_avg - older_avg;
        if change > 0.05 {
            NetworkTrend::Improving
        } else if change < -0.05 {
            NetworkTrend::Degrading
        } else {
            NetworkTrend::Stable
        }
    }

    /// Spawns the background loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let monitor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                "Network monitor started ({}s interval)",
                monitor.interval.as_secs_f64()
            );
            loop {
                ticker.tick().await;
                if monitor.stop.load(Ordering::SeqCst) {
                    break;
                }
                monitor.check_once();
            }
            info!("Network monitor stopped");
        }));
    }

    /// Signals the loop to stop and waits briefly for it to exit.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = tokio::time::timeout(Duration::from_secs(2), handle).await {
                warn!("Network monitor did not stop cleanly: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::{AdaptLimits, StepTable};
    use crate::clock::ManualClock;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (NetworkMonitor, Arc<FrameBroadcastQueue>, ManualClock) {
        let clock = ManualClock::new();
        let queue = Arc::new(FrameBroadcastQueue::new(10, Arc::new(clock.clone())));
        let controller = Arc::new(Mutex::new(QualityController::new(
            AdaptLimits {
                min_quality: 30,
                max_quality: 85,
                min_fps: 2,
                max_fps: 30,
            },
            StepTable::global(),
            Duration::from_secs(3),
            Arc::new(clock.clone()),
        )));
        let monitor = NetworkMonitor::new(queue.clone(), controller, Duration::from_secs(5));
        (monitor, queue, clock)
    }

    #[test]
    fn idle_tick_produces_no_ratio_sample() {
        let (monitor, _, _) = setup();
        let check = monitor.check_once();
        assert!(check.delivery_ratio.is_none());
        assert!(!check.adaptation.available);
    }

    #[test]
    fn full_consumption_measures_ratio_one() {
        let (monitor, queue, _) = setup();
        queue.add_client("a");
        for i in 0..4u8 {
            queue.put_frame(Bytes::from(vec![i; 8]), 85);
            queue.get_frame("a", Duration::from_secs(5));
        }

        let check = monitor.check_once();
        assert_eq!(check.delivery_ratio, Some(1.0));
    }

    #[test]
    fn unread_frames_measure_ratio_zero_and_degrade() {
        let (monitor, queue, clock) = setup();
        queue.add_client("a");

        // Several ticks of total non-consumption pushes the fast window
        // below the emergency threshold.
        for _ in 0..3 {
            for i in 0..4u8 {
                queue.put_frame(Bytes::from(vec![i; 8]), 85);
            }
            let check = monitor.check_once();
            assert_eq!(check.delivery_ratio, Some(0.0));
            clock.advance_secs(5.0);
        }

        let check = monitor.check_once();
        assert!(check.adaptation.quality < 85 || check.adaptation.rate_limited);
    }

    #[test]
    fn ratio_accounts_for_every_client() {
        let (monitor, queue, _) = setup();
        queue.add_client("a");
        queue.add_client("b");
        queue.put_frame(Bytes::from_static(b"x"), 85);
        queue.get_frame("a", Duration::from_secs(5));
        // Client b never reads: 1 of 2 scheduled deliveries happened.

        let check = monitor.check_once();
        assert_eq!(check.delivery_ratio, Some(0.5));
    }

    #[test]
    fn callback_fires_only_when_settings_change() {
        let (monitor, queue, clock) = setup();
        queue.add_client("a");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor.set_callback(Arc::new(move |result, _| {
            assert!(result.adapted);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // No traffic yet: nothing to adapt to, no callback.
        monitor.check_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Total non-consumption degrades the stream exactly once.
        for i in 0..4u8 {
            queue.put_frame(Bytes::from(vec![i; 8]), 85);
        }
        monitor.check_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Rate-limited follow-up check changes nothing.
        clock.advance_secs(1.0);
        monitor.check_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trend_flags_degradation_and_instability() {
        let (monitor, _, _) = setup();
        {
            let mut state = monitor.state.lock().unwrap();
            for v in [0.9, 0.9, 0.9, 0.9, 0.4, 0.35, 0.3] {
                state.history.push_back(v);
            }
        }
        assert_eq!(monitor.trend(), NetworkTrend::Unstable);

        {
            let mut state = monitor.state.lock().unwrap();
            state.history.clear();
            for v in [0.9, 0.88, 0.9, 0.89, 0.75, 0.72] {
                state.history.push_back(v);
            }
        }
        assert_eq!(monitor.trend(), NetworkTrend::Degrading);

        {
            let mut state = monitor.state.lock().unwrap();
            state.history.clear();
            for v in [0.9, 0.9, 0.9, 0.9, 0.9, 0.9] {
                state.history.push_back(v);
            }
        }
        assert_eq!(monitor.trend(), NetworkTrend::Stable);
    }
}
