//! Camera, stream and session health checks with recovery triggering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientRegistry;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::queue::FrameBroadcastQueue;
use crate::recovery::{CameraAdapter, ProblemKind, RecoveryCoordinator};

const TICK: Duration = Duration::from_secs(1);
const TRIGGER_COOLDOWN: Duration = Duration::from_secs(30);
/// More simultaneous viewers than this flags the session metric.
const CLIENT_COUNT_WARNING: usize = 10;

/// Severity of one health metric. `worst` ordering: Critical > Warning >
/// Healthy > Unknown, so an unprobed metric never masks real results;
/// overall health reads UNKNOWN only before any check has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthMetric {
    pub name: &'static str,
    pub status: HealthState,
    pub message: String,
    pub needs_recovery: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<ProblemKind>,
    pub last_updated: DateTime<Utc>,
}

impl HealthMetric {
    fn new(name: &'static str, status: HealthState, message: String) -> Self {
        Self {
            name,
            status,
            message,
            needs_recovery: false,
            problem: None,
            last_updated: Utc::now(),
        }
    }

    fn with_recovery(mut self, problem: ProblemKind) -> Self {
        self.needs_recovery = true;
        self.problem = Some(problem);
        self
    }
}

/// Aggregate health snapshot. `overall` is the worst metric state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthState,
    pub metrics: Vec<HealthMetric>,
}

struct Counters {
    stale_checks: u32,
    hardware_failures: u32,
    last_frames_produced: u64,
    last_camera_check: Option<Instant>,
    last_stream_check: Option<Instant>,
    last_session_check: Option<Instant>,
    last_trigger: HashMap<&'static str, Instant>,
}

/// Periodic health prober. Each check class runs on its own cadence off
/// a one-second tick; confirmed problems are handed to the recovery
/// coordinator with a per-metric trigger cooldown so a lingering fault
/// does not spam recovery.
pub struct HealthMonitor {
    camera: Arc<dyn CameraAdapter>,
    queue: Arc<FrameBroadcastQueue>,
    registry: Arc<ClientRegistry>,
    recovery: Arc<RecoveryCoordinator>,
    camera_interval: Duration,
    stream_interval: Duration,
    session_interval: Duration,
    client_ttl: Duration,
    max_stale_checks: u32,
    max_hardware_failures: u32,
    counters: Mutex<Counters>,
    metrics: Mutex<HashMap<&'static str, HealthMetric>>,
    system: Mutex<System>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(
        camera: Arc<dyn CameraAdapter>,
        queue: Arc<FrameBroadcastQueue>,
        registry: Arc<ClientRegistry>,
        recovery: Arc<RecoveryCoordinator>,
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            camera,
            queue,
            registry,
            recovery,
            camera_interval: Duration::from_secs_f64(config.camera_check_interval_secs),
            stream_interval: Duration::from_secs_f64(config.stream_check_interval_secs),
            session_interval: Duration::from_secs_f64(config.session_check_interval_secs),
            client_ttl: config.client_inactivity_ttl(),
            max_stale_checks: config.max_stale_checks,
            max_hardware_failures: config.max_hardware_failures,
            counters: Mutex::new(Counters {
                stale_checks: 0,
                hardware_failures: 0,
                last_frames_produced: 0,
                last_camera_check: None,
                last_stream_check: None,
                last_session_check: None,
                last_trigger: HashMap::new(),
            }),
            metrics: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            clock,
        }
    }

    /// Camera responsiveness probe. Consecutive failures escalate from
    /// Warning to Critical at the configured threshold.
    pub fn check_camera(&self) -> HealthMetric {
        let metric = if self.camera.is_responsive() {
            let mut counters = self.counters.lock().unwrap();
            counters.hardware_failures = 0;
            HealthMetric::new("camera", HealthState::Healthy, "camera responsive".into())
        } else {
            let failures = {
                let mut counters = self.counters.lock().unwrap();
                counters.hardware_failures += 1;
                counters.hardware_failures
            };
            if failures >= self.max_hardware_failures {
                warn!("Camera unresponsive for {} consecutive checks", failures);
                HealthMetric::new(
                    "camera",
                    HealthState::Critical,
                    format!("camera unresponsive ({} consecutive failures)", failures),
                )
                .with_recovery(ProblemKind::CameraAvailability)
            } else {
                HealthMetric::new(
                    "camera",
                    HealthState::Warning,
                    format!("camera unresponsive ({} of {})", failures, self.max_hardware_failures),
                )
            }
        };
        self.store(metric.clone());
        metric
    }

    /// Frame production probe: while streaming, the producer counter
    /// must advance between checks.
    pub fn check_stream(&self) -> HealthMetric {
        let produced = self.camera.frames_produced();
        let streaming = self.camera.is_streaming();

        let metric = {
            let mut counters = self.counters.lock().unwrap();
            let advanced = produced > counters.last_frames_produced;
            counters.last_frames_produced = produced;

            if !streaming {
                counters.stale_checks = 0;
                HealthMetric::new("stream", HealthState::Healthy, "stream idle".into())
            } else if advanced {
                counters.stale_checks = 0;
                HealthMetric::new(
                    "stream",
                    HealthState::Healthy,
                    format!("{} frames produced", produced),
                )
            } else {
                counters.stale_checks += 1;
                if counters.stale_checks >= self.max_stale_checks {
                    warn!("Frame production stalled for {} checks", counters.stale_checks);
                    HealthMetric::new(
                        "stream",
                        HealthState::Critical,
                        format!("no frames for {} consecutive checks", counters.stale_checks),
                    )
                    .with_recovery(ProblemKind::FrameGeneration)
                } else {
                    HealthMetric::new(
                        "stream",
                        HealthState::Warning,
                        format!(
                            "no new frames ({} of {})",
                            counters.stale_checks, self.max_stale_checks
                        ),
                    )
                }
            }
        };
        self.store(metric.clone());

        // Delivery drop rate rides on the same cadence.
        let drop_metric = self.check_drop_rate();
        if drop_metric.status > metric.status {
            return drop_metric;
        }
        metric
    }

    /// Queue overflow rate: the share of produced frames that evicted an
    /// undelivered one.
    pub fn check_drop_rate(&self) -> HealthMetric {
        let queue = self.queue.metrics();
        let rate = queue.overflow_rate;
        let metric = if rate > 0.5 {
            HealthMetric::new(
                "delivery",
                HealthState::Critical,
                format!("{:.0}% of frames dropped", rate * 100.0),
            )
            .with_recovery(ProblemKind::StreamingPerformance)
        } else if rate > 0.1 {
            HealthMetric::new(
                "delivery",
                HealthState::Warning,
                format!("{:.0}% of frames dropped", rate * 100.0),
            )
        } else {
            HealthMetric::new(
                "delivery",
                HealthState::Healthy,
                format!("drop rate {:.1}%", rate * 100.0),
            )
        };
        self.store(metric.clone());
        metric
    }

    /// Session sweep: expires inactive clients and reports the count.
    pub fn check_sessions(&self) -> HealthMetric {
        let expired = self.registry.cleanup_inactive(self.client_ttl);
        self.queue.expire_idle_clients(self.client_ttl);

        let active = self.registry.client_count();
        let message = if expired.is_empty() {
            format!("{} active clients", active)
        } else {
            format!("{} active clients, {} expired", active, expired.len())
        };
        let status = if active > CLIENT_COUNT_WARNING {
            HealthState::Warning
        } else {
            HealthState::Healthy
        };
        let metric = HealthMetric::new("sessions", status, message);
        self.store(metric.clone());
        metric
    }

    /// Process resource probe via sysinfo.
    pub fn check_resources(&self) -> HealthMetric {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        system.refresh_cpu();

        let total = system.total_memory();
        let used = system.used_memory();
        let cpu = system.global_cpu_info().cpu_usage() as f64;
        let metric = if total == 0 {
            HealthMetric::new("resources", HealthState::Unknown, "memory stats unavailable".into())
        } else {
            let usage = used as f64 / total as f64;
            let status = if usage > 0.9 || cpu > 90.0 {
                HealthState::Warning
            } else {
                HealthState::Healthy
            };
            HealthMetric::new(
                "resources",
                status,
                format!("memory {:.0}% used, cpu {:.0}%", usage * 100.0, cpu),
            )
        };
        self.store(metric.clone());
        metric
    }

    /// Runs whichever checks are due on this tick, then triggers
    /// recovery for any metric that asks for it.
    pub fn tick(&self) {
        let now = self.clock.now();
        let (camera_due, stream_due, session_due) = {
            let mut counters = self.counters.lock().unwrap();
            let due = |last: &mut Option<Instant>, interval: Duration| {
                let is_due = last
                    .map(|t| now.saturating_duration_since(t) >= interval)
                    .unwrap_or(true);
                if is_due {
                    *last = Some(now);
                }
                is_due
            };
            (
                due(&mut counters.last_camera_check, self.camera_interval),
                due(&mut counters.last_stream_check, self.stream_interval),
                due(&mut counters.last_session_check, self.session_interval),
            )
        };

        if camera_due {
            self.check_camera();
        }
        if stream_due {
            self.check_stream();
        }
        if session_due {
            self.check_sessions();
            self.check_resources();
        }

        self.trigger_pending_recoveries();
    }

    /// Runs every check immediately, ignoring cadences.
    pub fn force_check(&self) -> HealthStatus {
        self.check_camera();
        self.check_stream();
        self.check_sessions();
        self.check_resources();
        self.trigger_pending_recoveries();
        self.status()
    }

    fn trigger_pending_recoveries(&self) {
        let now = self.clock.now();
        let pending: Vec<(&'static str, ProblemKind)> = {
            let metrics = self.metrics.lock().unwrap();
            metrics
                .values()
                .filter(|m| m.needs_recovery)
                .filter_map(|m| m.problem.map(|p| (m.name, p)))
                .collect()
        };

        for (name, problem) in pending {
            let allowed = {
                let mut counters = self.counters.lock().unwrap();
                let ok = counters
                    .last_trigger
                    .get(name)
                    .map(|t| now.saturating_duration_since(*t) >= TRIGGER_COOLDOWN)
                    .unwrap_or(true);
                if ok {
                    counters.last_trigger.insert(name, now);
                }
                ok
            };
            if allowed {
                info!("Health check '{}' requesting recovery for {}", name, problem);
                self.recovery.attempt_recovery(problem);
            } else {
                debug!("Recovery trigger for '{}' suppressed by cooldown", name);
            }
        }
    }

    fn store(&self, metric: HealthMetric) {
        self.metrics.lock().unwrap().insert(metric.name, metric);
    }

    pub fn status(&self) -> HealthStatus {
        let metrics = self.metrics.lock().unwrap();
        let mut list: Vec<HealthMetric> = metrics.values().cloned().collect();
        list.sort_by_key(|m| m.name);
        let overall = list
            .iter()
            .map(|m| m.status)
            .max()
            .unwrap_or(HealthState::Unknown);
        HealthStatus {
            overall,
            metrics: list,
        }
    }

    /// Spawns the one-second tick loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let monitor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Health monitor started");
            loop {
                ticker.tick().await;
                if monitor.stop.load(Ordering::SeqCst) {
                    break;
                }
                monitor.tick();
            }
            info!("Health monitor stopped");
        }));
    }

    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = tokio::time::timeout(Duration::from_secs(2), handle).await {
                warn!("Health monitor did not stop cleanly: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("camera_interval", &self.camera_interval)
            .field("stream_interval", &self.stream_interval)
            .field("session_interval", &self.session_interval)
            .finish()
    }
}
