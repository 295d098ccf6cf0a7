//! The streaming engine: owns the queue, the adaptation controllers,
//! the monitors and the recovery coordinator, and exposes the surface
//! the capture loop and any HTTP frontend talk to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;
use tokio_stream::Stream;
use tracing::{info, warn};

use crate::adapt::{AdaptLimits, AdaptationStatus, QualityController, StepTable};
use crate::client::{ClientRegistry, ClientsSummary};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::StreamError;
use crate::monitor::{AdaptationCallback, HealthMonitor, HealthState, HealthStatus, NetworkMonitor};
use crate::queue::{FrameBroadcastQueue, QueueMetrics};
use crate::recovery::{
    CameraAdapter, ProblemKind, RecoveryCoordinator, RecoveryOperation, RecoveryStatus,
};

/// Combined performance snapshot for the reporting surface.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub queue: QueueMetrics,
    pub clients: ClientsSummary,
    pub adaptation: AdaptationStatus,
}

/// Multi-client adaptive streaming engine.
///
/// The capture loop pushes encoded frames in via [`write`]; clients
/// pull paced MJPEG parts out via [`open_client_stream`]. Everything
/// between, backlog control, adaptation, health probing and recovery,
/// runs inside.
///
/// [`write`]: StreamEngine::write
/// [`open_client_stream`]: StreamEngine::open_client_stream
pub struct StreamEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<FrameBroadcastQueue>,
    registry: Arc<ClientRegistry>,
    controller: Arc<Mutex<QualityController>>,
    network: Arc<NetworkMonitor>,
    recovery: Arc<RecoveryCoordinator>,
    health: Mutex<Option<Arc<HealthMonitor>>>,
    camera: Mutex<Option<Arc<dyn CameraAdapter>>>,
    running: AtomicBool,
}

impl StreamEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let queue = Arc::new(FrameBroadcastQueue::new(config.queue_max_size, clock.clone()));

        let limits = AdaptLimits {
            min_quality: config.min_stream_quality,
            max_quality: config.initial_quality(),
            min_fps: config.min_frame_rate,
            max_fps: config.max_frame_rate,
        };

        let registry = Arc::new(ClientRegistry::new(
            queue.clone(),
            limits,
            config.adaptation_interval(),
            config.max_frame_age(),
            clock.clone(),
        ));

        let controller = {
            let mut c = QualityController::new(
                limits,
                StepTable::global(),
                config.adaptation_interval(),
                clock.clone(),
            );
            c.set_enabled(config.adaptive_quality, config.adaptive_streaming);
            Arc::new(Mutex::new(c))
        };

        let network = Arc::new(NetworkMonitor::new(
            queue.clone(),
            controller.clone(),
            config.network_check_interval(),
        ));

        let recovery = Arc::new(RecoveryCoordinator::new(
            config.recovery_cooldown(),
            config.max_recovery_attempts,
            clock.clone(),
        ));

        Self {
            config,
            clock,
            queue,
            registry,
            controller,
            network,
            recovery,
            health: Mutex::new(None),
            camera: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Wires a camera to health monitoring and registers the default
    /// recovery pipelines, least invasive action first.
    pub fn attach_camera(&self, camera: Arc<dyn CameraAdapter>) {
        let monitor = Arc::new(HealthMonitor::new(
            camera.clone(),
            self.queue.clone(),
            self.registry.clone(),
            self.recovery.clone(),
            &self.config,
            self.clock.clone(),
        ));
        *self.health.lock().unwrap() = Some(monitor);
        *self.camera.lock().unwrap() = Some(camera.clone());
        self.register_default_strategies(camera);
        info!("Camera attached");
    }

    fn register_default_strategies(&self, camera: Arc<dyn CameraAdapter>) {
        let r = &self.recovery;

        let cam = camera.clone();
        r.register_strategy(ProblemKind::CameraAvailability, "restart_device", Box::new(move || {
            cam.restart_device()?;
            Ok(cam.is_responsive())
        }));
        let cam = camera.clone();
        r.register_strategy(ProblemKind::CameraAvailability, "reinitialize", Box::new(move || {
            cam.reinitialize()?;
            Ok(cam.is_responsive())
        }));
        let cam = camera.clone();
        r.register_strategy(ProblemKind::CameraAvailability, "force_restart", Box::new(move || {
            cam.force_restart()?;
            Ok(cam.is_responsive())
        }));

        let cam = camera.clone();
        r.register_strategy(ProblemKind::HardwareTimeout, "reset_connection", Box::new(move || {
            cam.reset_connection()?;
            Ok(cam.is_responsive())
        }));
        let cam = camera.clone();
        r.register_strategy(ProblemKind::HardwareTimeout, "restart_device", Box::new(move || {
            cam.restart_device()?;
            Ok(cam.is_responsive())
        }));

        let cam = camera.clone();
        r.register_strategy(ProblemKind::FrameGeneration, "restart_streaming", Box::new(move || {
            let before = cam.frames_produced();
            cam.restart_streaming()?;
            Ok(cam.is_streaming() || cam.frames_produced() > before)
        }));
        let cam = camera.clone();
        r.register_strategy(ProblemKind::FrameGeneration, "restart_device", Box::new(move || {
            cam.restart_device()?;
            Ok(cam.is_responsive())
        }));

        let cam = camera.clone();
        let controller = self.controller.clone();
        r.register_strategy(ProblemKind::StreamQuality, "reset_configuration", Box::new(move || {
            cam.reset_configuration()?;
            controller.lock().unwrap().reset_to_maximum();
            Ok(true)
        }));

        let registry = self.registry.clone();
        let queue = self.queue.clone();
        let ttl = self.config.client_inactivity_ttl();
        r.register_strategy(ProblemKind::SessionManagement, "expire_idle_sessions", Box::new(move || {
            let expired = registry.cleanup_inactive(ttl);
            queue.expire_idle_clients(ttl);
            Ok(!expired.is_empty())
        }));

        let controller = self.controller.clone();
        let queue = self.queue.clone();
        r.register_strategy(ProblemKind::StreamingPerformance, "shed_backlog", Box::new(move || {
            queue.clear();
            let mut c = controller.lock().unwrap();
            let target = c.limits().min_quality.max(c.current_quality().saturating_sub(15));
            c.force_quality(target);
            Ok(true)
        }));
    }

    /// Starts the background monitors. Requires an attached camera.
    pub fn start(self: &Arc<Self>) -> Result<(), StreamError> {
        let health = self.health.lock().unwrap().clone();
        let health = health.ok_or(StreamError::HardwareUnavailable)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.controller.lock().unwrap().reset_to_maximum();
        self.network.start();
        health.start();
        info!(
            "Engine started: quality {}%, {} fps, queue depth {}",
            self.config.initial_quality(),
            self.config.max_frame_rate,
            self.config.queue_max_size
        );
        Ok(())
    }

    /// Stops the monitors and drops all buffered frames.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.network.stop().await;
        let health = self.health.lock().unwrap().clone();
        if let Some(health) = health {
            health.stop().await;
        }
        self.queue.clear();
        info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_camera(&self) -> bool {
        self.camera.lock().unwrap().is_some()
    }

    /// Fans one encoded frame out to every connected client.
    pub fn write(&self, jpeg: Bytes) -> bool {
        let quality = self.controller.lock().unwrap().current_quality();
        let accepted = self.queue.put_frame(jpeg, quality);
        if !accepted {
            warn!("Rejected empty frame");
        }
        accepted
    }

    /// Quality the capture loop should encode at right now.
    pub fn target_quality(&self) -> u8 {
        self.controller.lock().unwrap().current_quality()
    }

    /// Frame rate the capture loop should produce at right now.
    pub fn target_fps(&self) -> u32 {
        self.controller.lock().unwrap().current_fps()
    }

    /// Registers a client and returns its paced MJPEG part stream.
    pub fn open_client_stream(&self) -> (String, impl Stream<Item = Bytes>) {
        self.registry.open_stream()
    }

    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }

    pub fn set_adaptation_callback(&self, callback: AdaptationCallback) {
        self.network.set_callback(callback);
    }

    pub fn performance_report(&self) -> PerformanceReport {
        PerformanceReport {
            queue: self.queue.metrics(),
            clients: self.registry.summary(),
            adaptation: self.controller.lock().unwrap().status(),
        }
    }

    pub fn adaptation_status(&self) -> AdaptationStatus {
        self.controller.lock().unwrap().status()
    }

    pub fn health_status(&self) -> HealthStatus {
        match self.health.lock().unwrap().as_ref() {
            Some(h) => h.status(),
            None => HealthStatus {
                overall: HealthState::Unknown,
                metrics: Vec::new(),
            },
        }
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.recovery.status()
    }

    pub fn recovery_history(&self, limit: usize) -> Vec<RecoveryOperation> {
        self.recovery.history(limit)
    }

    /// Manual quality override, clamped to configured bounds.
    pub fn force_quality_change(&self, quality: u8) -> u8 {
        self.controller.lock().unwrap().force_quality(quality)
    }

    /// Manual frame-rate override, clamped to configured bounds.
    pub fn force_frame_rate_change(&self, fps: u32) -> u32 {
        self.controller.lock().unwrap().force_fps(fps)
    }

    /// Restores maximum quality and frame rate, clearing adaptation
    /// history.
    pub fn reset_to_maximum(&self) {
        self.controller.lock().unwrap().reset_to_maximum();
    }

    /// Manual recovery trigger, bypassing the per-problem cooldown.
    pub fn force_recovery(&self, problem: ProblemKind) -> RecoveryOperation {
        self.recovery.force_recovery(problem)
    }
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("running", &self.is_running())
            .field("clients", &self.client_count())
            .finish()
    }
}
