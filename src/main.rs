//! camrelay: adaptive multi-client MJPEG relay with self-healing.
//!
//! Runs the streaming engine against a synthetic frame source. A real
//! deployment replaces the synthetic producer with a capture loop that
//! encodes JPEGs at [`StreamEngine::target_quality`] and
//! [`StreamEngine::target_fps`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camrelay::recovery::CameraAdapter;
use camrelay::{EngineConfig, StreamEngine, StreamError};

/// Minimal valid JPEG used as the synthetic frame payload.
const TEST_FRAME: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

/// Software stand-in for a capture device.
#[derive(Debug)]
struct SyntheticCamera {
    responsive: AtomicBool,
    streaming: AtomicBool,
    frames: AtomicU64,
}

impl SyntheticCamera {
    fn new() -> Self {
        Self {
            responsive: AtomicBool::new(true),
            streaming: AtomicBool::new(true),
            frames: AtomicU64::new(0),
        }
    }

    fn produce(&self) -> Bytes {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Bytes::from_static(TEST_FRAME)
    }
}

impl CameraAdapter for SyntheticCamera {
    fn is_responsive(&self) -> bool {
        self.responsive.load(Ordering::Relaxed)
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    fn frames_produced(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn restart_device(&self) -> Result<(), StreamError> {
        self.responsive.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn reinitialize(&self) -> Result<(), StreamError> {
        Ok(())
    }

    fn reset_configuration(&self) -> Result<(), StreamError> {
        Ok(())
    }

    fn reset_connection(&self) -> Result<(), StreamError> {
        Ok(())
    }

    fn force_restart(&self) -> Result<(), StreamError> {
        self.responsive.store(true, Ordering::Relaxed);
        self.streaming.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn restart_streaming(&self) -> Result<(), StreamError> {
        self.streaming.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Pushes frames into the engine at the adaptive target rate.
fn start_producer(engine: Arc<StreamEngine>, camera: Arc<SyntheticCamera>) {
    tokio::spawn(async move {
        loop {
            let fps = engine.target_fps().max(1);
            engine.write(camera.produce());
            tokio::time::sleep(Duration::from_secs_f64(1.0 / fps as f64)).await;
        }
    });
}

/// Logs a performance summary every 30 seconds.
fn start_reporter(engine: Arc<StreamEngine>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = engine.performance_report();
            info!(
                "{} clients, quality {}%, {} fps, overflow rate {:.1}%, health {:?}",
                report.clients.client_count,
                report.adaptation.current_quality,
                report.adaptation.current_fps,
                report.queue.overflow_rate * 100.0,
                engine.health_status().overall,
            );
            match serde_json::to_string(&report) {
                Ok(json) => debug!("performance report: {}", json),
                Err(e) => warn!("Failed to serialize performance report: {}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    let problems = config.validate();
    if !problems.is_empty() {
        for p in &problems {
            warn!("Config error: {}", p);
        }
        bail!("invalid configuration");
    }

    info!(
        "camrelay starting: quality {}%, {} fps max, queue depth {}",
        config.initial_quality(),
        config.max_frame_rate,
        config.queue_max_size
    );

    let engine = Arc::new(StreamEngine::new(config));
    let camera = Arc::new(SyntheticCamera::new());
    engine.attach_camera(camera.clone());
    engine.start().context("failed to start engine")?;

    start_producer(engine.clone(), camera);
    start_reporter(engine.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    engine.shutdown().await;

    Ok(())
}
