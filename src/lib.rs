/*!
 * camrelay library
 *
 * Adaptive multi-client frame streaming with self-healing.
 */

pub mod adapt;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod mjpeg;
pub mod monitor;
pub mod queue;
pub mod recovery;

// Re-export commonly used types
pub use adapt::{AdaptLimits, AdaptationResult, QualityController, StepTable};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::StreamEngine;
pub use error::StreamError;
pub use frame::Frame;
pub use queue::{FrameBroadcastQueue, QueueMetrics};
pub use recovery::{CameraAdapter, ProblemKind, RecoveryCoordinator};
