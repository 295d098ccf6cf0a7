//! Self-healing: recovery strategies, cooldowns and attempt history.
//!
//! Health checks report problems by kind; the coordinator runs the
//! registered strategy pipeline for that kind, least invasive first,
//! stopping at the first strategy that reports success. Cooldowns and a
//! per-problem trailing-hour attempt cap keep a persistent fault from
//! turning into a restart loop.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::StreamError;

const HISTORY_CAPACITY: usize = 50;
const ATTEMPT_WINDOW: Duration = Duration::from_secs(3600);

/// Problem classes the engine knows how to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    CameraAvailability,
    HardwareTimeout,
    FrameGeneration,
    StreamQuality,
    SessionManagement,
    StreamingPerformance,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemKind::CameraAvailability => "camera_availability",
            ProblemKind::HardwareTimeout => "hardware_timeout",
            ProblemKind::FrameGeneration => "frame_generation",
            ProblemKind::StreamQuality => "stream_quality",
            ProblemKind::SessionManagement => "session_management",
            ProblemKind::StreamingPerformance => "streaming_performance",
        }
    }
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Success,
    Failed,
    Partial,
    Skipped,
    InProgress,
}

/// One recovery attempt as recorded in the history ring.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOperation {
    pub problem: ProblemKind,
    pub outcome: RecoveryOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per executed strategy, e.g. `"restart_device: ok"`.
    pub actions: Vec<String>,
    pub detail: Option<String>,
}

/// Hardware control surface the recovery strategies drive.
///
/// Production wires this to the actual capture device; tests substitute
/// a scripted fake.
pub trait CameraAdapter: Send + Sync + fmt::Debug {
    fn is_responsive(&self) -> bool;
    fn is_streaming(&self) -> bool;
    fn frames_produced(&self) -> u64;

    fn restart_device(&self) -> Result<(), StreamError>;
    fn reinitialize(&self) -> Result<(), StreamError>;
    fn reset_configuration(&self) -> Result<(), StreamError>;
    fn reset_connection(&self) -> Result<(), StreamError>;
    fn force_restart(&self) -> Result<(), StreamError>;
    fn restart_streaming(&self) -> Result<(), StreamError>;
}

/// A strategy reports `Ok(true)` when it fixed the problem, `Ok(false)`
/// when it ran cleanly but the problem persists.
pub type StrategyFn = Box<dyn Fn() -> Result<bool, StreamError> + Send + Sync>;

struct Strategy {
    name: &'static str,
    run: Arc<dyn Fn() -> Result<bool, StreamError> + Send + Sync>,
}

struct CoordinatorState {
    last_attempt: HashMap<ProblemKind, Instant>,
    recent_attempts: HashMap<ProblemKind, VecDeque<Instant>>,
    history: VecDeque<RecoveryOperation>,
    in_progress: bool,
}

/// Runs recovery pipelines with cooldown and rate-cap bookkeeping.
pub struct RecoveryCoordinator {
    strategies: Mutex<HashMap<ProblemKind, Vec<Strategy>>>,
    state: Mutex<CoordinatorState>,
    cooldown: Duration,
    max_attempts_per_hour: usize,
    clock: Arc<dyn Clock>,
}

impl RecoveryCoordinator {
    pub fn new(cooldown: Duration, max_attempts_per_hour: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            strategies: Mutex::new(HashMap::new()),
            state: Mutex::new(CoordinatorState {
                last_attempt: HashMap::new(),
                recent_attempts: HashMap::new(),
                history: VecDeque::new(),
                in_progress: false,
            }),
            cooldown,
            max_attempts_per_hour,
            clock,
        }
    }

    /// Appends a strategy to the pipeline for `problem`. Registration
    /// order is execution order, so register least invasive first.
    pub fn register_strategy(&self, problem: ProblemKind, name: &'static str, run: StrategyFn) {
        self.strategies
            .lock()
            .unwrap()
            .entry(problem)
            .or_default()
            .push(Strategy {
                name,
                run: Arc::from(run),
            });
    }

    /// Attempts recovery for `problem`, honoring cooldown and rate cap.
    pub fn attempt_recovery(&self, problem: ProblemKind) -> RecoveryOperation {
        self.run_pipeline(problem, false)
    }

    /// Manual recovery trigger. Bypasses the per-problem cooldown but
    /// still honors the trailing-hour attempt cap.
    pub fn force_recovery(&self, problem: ProblemKind) -> RecoveryOperation {
        self.run_pipeline(problem, true)
    }

    fn run_pipeline(&self, problem: ProblemKind, ignore_cooldown: bool) -> RecoveryOperation {
        let now = self.clock.now();
        let started_at = Utc::now();

        // Admission check under the state lock.
        {
            let mut state = self.state.lock().unwrap();

            if state.in_progress {
                return self.record_skip(&mut state, problem, started_at, "recovery already in progress");
            }

            if !ignore_cooldown {
                if let Some(last) = state.last_attempt.get(&problem) {
                    let since = now.saturating_duration_since(*last);
                    if since < self.cooldown {
                        let msg = format!(
                            "cooldown: {:.0}s of {:.0}s elapsed",
                            since.as_secs_f64(),
                            self.cooldown.as_secs_f64()
                        );
                        return self.record_skip(&mut state, problem, started_at, &msg);
                    }
                }
            }

            // The attempt cap is budgeted per problem type.
            let attempts = state.recent_attempts.entry(problem).or_default();
            while let Some(front) = attempts.front() {
                if now.saturating_duration_since(*front) > ATTEMPT_WINDOW {
                    attempts.pop_front();
                } else {
                    break;
                }
            }
            if attempts.len() >= self.max_attempts_per_hour {
                warn!(
                    "Recovery for {} skipped: {} attempts in the last hour",
                    problem,
                    attempts.len()
                );
                return self.record_skip(&mut state, problem, started_at, "hourly attempt cap reached");
            }
            attempts.push_back(now);

            state.in_progress = true;
            state.last_attempt.insert(problem, now);
        }

        info!("Starting recovery for {}", problem);

        // Snapshot the pipeline so no lock is held while strategies run;
        // they may touch hardware or take other components' locks.
        let pipeline: Vec<(&'static str, Arc<dyn Fn() -> Result<bool, StreamError> + Send + Sync>)> = {
            let strategies = self.strategies.lock().unwrap();
            strategies
                .get(&problem)
                .map(|p| p.iter().map(|s| (s.name, s.run.clone())).collect())
                .unwrap_or_default()
        };

        let mut actions = Vec::new();
        let mut succeeded = false;
        for (name, run) in &pipeline {
            match run() {
                Ok(true) => {
                    actions.push(format!("{}: ok", name));
                    info!("Recovery strategy {} fixed {}", name, problem);
                    succeeded = true;
                    break;
                }
                Ok(false) => {
                    actions.push(format!("{}: failed", name));
                }
                Err(e) => {
                    actions.push(format!("{}: error: {}", name, e));
                    error!("Recovery strategy {} for {} errored: {}", name, problem, e);
                }
            }
        }

        let outcome = if succeeded {
            RecoveryOutcome::Success
        } else if !pipeline.is_empty() {
            RecoveryOutcome::Failed
        } else {
            RecoveryOutcome::Skipped
        };
        let detail = if pipeline.is_empty() {
            Some("no strategies registered".to_string())
        } else {
            None
        };

        if outcome == RecoveryOutcome::Failed {
            warn!("All recovery strategies for {} failed", problem);
        }

        let op = RecoveryOperation {
            problem,
            outcome,
            started_at,
            finished_at: Utc::now(),
            actions,
            detail,
        };

        let mut state = self.state.lock().unwrap();
        state.in_progress = false;
        push_history(&mut state.history, op.clone());
        op
    }

    fn record_skip(
        &self,
        state: &mut CoordinatorState,
        problem: ProblemKind,
        started_at: DateTime<Utc>,
        reason: &str,
    ) -> RecoveryOperation {
        let op = RecoveryOperation {
            problem,
            outcome: RecoveryOutcome::Skipped,
            started_at,
            finished_at: Utc::now(),
            actions: Vec::new(),
            detail: Some(reason.to_string()),
        };
        push_history(&mut state.history, op.clone());
        op
    }

    /// Most recent operations, newest first.
    pub fn history(&self, limit: usize) -> Vec<RecoveryOperation> {
        let state = self.state.lock().unwrap();
        state.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn status(&self) -> RecoveryStatus {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();

        let attempts_by_kind: Vec<ProblemAttempts> = state
            .recent_attempts
            .iter()
            .map(|(problem, attempts)| ProblemAttempts {
                problem: *problem,
                attempts_last_hour: attempts
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) <= ATTEMPT_WINDOW)
                    .count(),
            })
            .filter(|p| p.attempts_last_hour > 0)
            .collect();
        let attempts_last_hour = attempts_by_kind.iter().map(|p| p.attempts_last_hour).sum();

        let completed = state
            .history
            .iter()
            .filter(|op| matches!(op.outcome, RecoveryOutcome::Success | RecoveryOutcome::Failed))
            .count();
        let successes = state
            .history
            .iter()
            .filter(|op| op.outcome == RecoveryOutcome::Success)
            .count();
        let success_rate = if completed > 0 {
            successes as f64 / completed as f64
        } else {
            0.0
        };

        let cooldowns = state
            .last_attempt
            .iter()
            .filter_map(|(problem, last)| {
                let since = now.saturating_duration_since(*last);
                if since < self.cooldown {
                    Some(CooldownStatus {
                        problem: *problem,
                        remaining_secs: (self.cooldown - since).as_secs_f64(),
                    })
                } else {
                    None
                }
            })
            .collect();

        RecoveryStatus {
            in_progress: state.in_progress,
            attempts_last_hour,
            attempts_by_kind,
            max_attempts_per_hour: self.max_attempts_per_hour,
            cooldown_secs: self.cooldown.as_secs_f64(),
            success_rate,
            active_cooldowns: cooldowns,
            history_len: state.history.len(),
        }
    }
}

impl fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("cooldown", &self.cooldown)
            .field("max_attempts_per_hour", &self.max_attempts_per_hour)
            .finish()
    }
}

fn push_history(history: &mut VecDeque<RecoveryOperation>, op: RecoveryOperation) {
    if history.len() == HISTORY_CAPACITY {
        history.pop_front();
    }
    history.push_back(op);
}

#[derive(Debug, Clone, Serialize)]
pub struct CooldownStatus {
    pub problem: ProblemKind,
    pub remaining_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProblemAttempts {
    pub problem: ProblemKind,
    pub attempts_last_hour: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub in_progress: bool,
    /// Total attempts across all problem types; the cap applies per type.
    pub attempts_last_hour: usize,
    pub attempts_by_kind: Vec<ProblemAttempts>,
    pub max_attempts_per_hour: usize,
    pub cooldown_secs: f64,
    /// Share of completed attempts (success or failure) that succeeded.
    pub success_rate: f64,
    pub active_cooldowns: Vec<CooldownStatus>,
    pub history_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> (RecoveryCoordinator, ManualClock) {
        let clock = ManualClock::new();
        let c = RecoveryCoordinator::new(Duration::from_secs(60), 3, Arc::new(clock.clone()));
        (c, clock)
    }

    #[test]
    fn pipeline_stops_at_first_success() {
        let (c, _) = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = calls.clone();
        c.register_strategy(ProblemKind::CameraAvailability, "soft_reset", Box::new(move || {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }));
        let b = calls.clone();
        c.register_strategy(ProblemKind::CameraAvailability, "restart_device", Box::new(move || {
            b.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }));
        let never = calls.clone();
        c.register_strategy(ProblemKind::CameraAvailability, "force_restart", Box::new(move || {
            never.fetch_add(100, Ordering::SeqCst);
            Ok(true)
        }));

        let op = c.attempt_recovery(ProblemKind::CameraAvailability);
        assert_eq!(op.outcome, RecoveryOutcome::Success);
        assert_eq!(op.actions, vec!["soft_reset: failed", "restart_device: ok"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn erroring_strategy_does_not_abort_the_pipeline() {
        let (c, _) = coordinator();
        c.register_strategy(ProblemKind::FrameGeneration, "broken", Box::new(|| {
            Err(StreamError::StreamSetupFailure("ioctl failed".into()))
        }));
        c.register_strategy(ProblemKind::FrameGeneration, "fallback", Box::new(|| Ok(true)));

        let op = c.attempt_recovery(ProblemKind::FrameGeneration);
        assert_eq!(op.outcome, RecoveryOutcome::Success);
        assert_eq!(op.actions.len(), 2);
        assert!(op.actions[0].contains("error"));
    }

    #[test]
    fn cooldown_skips_back_to_back_attempts() {
        let (c, clock) = coordinator();
        c.register_strategy(ProblemKind::HardwareTimeout, "restart", Box::new(|| Ok(true)));

        let first = c.attempt_recovery(ProblemKind::HardwareTimeout);
        assert_eq!(first.outcome, RecoveryOutcome::Success);

        let second = c.attempt_recovery(ProblemKind::HardwareTimeout);
        assert_eq!(second.outcome, RecoveryOutcome::Skipped);
        assert!(second.detail.as_deref().unwrap_or("").contains("cooldown"));

        clock.advance_secs(61.0);
        let third = c.attempt_recovery(ProblemKind::HardwareTimeout);
        assert_eq!(third.outcome, RecoveryOutcome::Success);
    }

    #[test]
    fn force_recovery_bypasses_cooldown_only() {
        let (c, clock) = coordinator();
        c.register_strategy(ProblemKind::StreamQuality, "reset", Box::new(|| Ok(true)));

        assert_eq!(c.attempt_recovery(ProblemKind::StreamQuality).outcome, RecoveryOutcome::Success);
        assert_eq!(c.force_recovery(ProblemKind::StreamQuality).outcome, RecoveryOutcome::Success);
        assert_eq!(c.force_recovery(ProblemKind::StreamQuality).outcome, RecoveryOutcome::Success);

        // Three attempts within the hour: the cap still applies to force.
        let capped = c.force_recovery(ProblemKind::StreamQuality);
        assert_eq!(capped.outcome, RecoveryOutcome::Skipped);
        assert!(capped.detail.as_deref().unwrap_or("").contains("cap"));

        clock.advance_secs(3601.0);
        assert_eq!(c.force_recovery(ProblemKind::StreamQuality).outcome, RecoveryOutcome::Success);
    }

    #[test]
    fn attempt_cap_is_budgeted_per_problem() {
        let (c, clock) = coordinator();
        c.register_strategy(ProblemKind::CameraAvailability, "restart", Box::new(|| Ok(true)));
        c.register_strategy(ProblemKind::FrameGeneration, "restart", Box::new(|| Ok(true)));

        // Exhaust the camera budget with attempts spaced past the cooldown.
        for _ in 0..3 {
            assert_eq!(
                c.attempt_recovery(ProblemKind::CameraAvailability).outcome,
                RecoveryOutcome::Success
            );
            clock.advance_secs(61.0);
        }
        let capped = c.attempt_recovery(ProblemKind::CameraAvailability);
        assert_eq!(capped.outcome, RecoveryOutcome::Skipped);
        assert!(capped.detail.as_deref().unwrap_or("").contains("cap"));

        // A different problem type still has its full budget.
        let other = c.attempt_recovery(ProblemKind::FrameGeneration);
        assert_eq!(other.outcome, RecoveryOutcome::Success);

        let status = c.status();
        assert_eq!(status.attempts_last_hour, 4);
        let camera = status
            .attempts_by_kind
            .iter()
            .find(|p| p.problem == ProblemKind::CameraAvailability)
            .map(|p| p.attempts_last_hour);
        assert_eq!(camera, Some(3));
    }

    #[test]
    fn strategy_may_register_further_strategies() {
        let (c, _) = coordinator();
        let c = Arc::new(c);
        let inner = c.clone();
        c.register_strategy(ProblemKind::StreamQuality, "escalate", Box::new(move || {
            inner.register_strategy(ProblemKind::StreamQuality, "added_later", Box::new(|| Ok(true)));
            Ok(true)
        }));

        // Would deadlock if the strategies lock were held across the run.
        let op = c.attempt_recovery(ProblemKind::StreamQuality);
        assert_eq!(op.outcome, RecoveryOutcome::Success);
    }

    #[test]
    fn cooldowns_are_tracked_per_problem() {
        let (c, _) = coordinator();
        c.register_strategy(ProblemKind::CameraAvailability, "a", Box::new(|| Ok(true)));
        c.register_strategy(ProblemKind::SessionManagement, "b", Box::new(|| Ok(true)));

        assert_eq!(c.attempt_recovery(ProblemKind::CameraAvailability).outcome, RecoveryOutcome::Success);
        // Different problem kind is not blocked by the first cooldown.
        assert_eq!(c.attempt_recovery(ProblemKind::SessionManagement).outcome, RecoveryOutcome::Success);
    }

    #[test]
    fn history_ring_is_bounded() {
        let (c, clock) = coordinator();
        c.register_strategy(ProblemKind::StreamingPerformance, "noop", Box::new(|| Ok(true)));

        // Mix of skipped (cooldown) and real attempts, far more than the cap.
        for _ in 0..60 {
            c.attempt_recovery(ProblemKind::StreamingPerformance);
            clock.advance_secs(1.0);
        }
        assert_eq!(c.status().history_len, HISTORY_CAPACITY);

        let recent = c.history(5);
        assert_eq!(recent.len(), 5);
    }

    #[test]
    fn no_strategies_reports_skip() {
        let (c, _) = coordinator();
        let op = c.attempt_recovery(ProblemKind::SessionManagement);
        assert_eq!(op.outcome, RecoveryOutcome::Skipped);
        assert_eq!(op.detail.as_deref(), Some("no strategies registered"));
    }

    #[test]
    fn status_reports_active_cooldowns() {
        let (c, clock) = coordinator();
        c.register_strategy(ProblemKind::HardwareTimeout, "x", Box::new(|| Ok(true)));
        c.attempt_recovery(ProblemKind::HardwareTimeout);

        clock.advance_secs(10.0);
        let status = c.status();
        assert_eq!(status.attempts_last_hour, 1);
        assert!((status.success_rate - 1.0).abs() < 1e-9);
        assert_eq!(status.active_cooldowns.len(), 1);
        assert!((status.active_cooldowns[0].remaining_secs - 50.0).abs() < 1.0);
    }
}
