//! Error taxonomy for the streaming engine.
//!
//! Only genuine failure states live here. Frame starvation surfaces as a
//! skipped delivery, queue overflow as a metric, and rate-limited
//! adaptations as a flag on the adaptation result; none of those are
//! errors.

use thiserror::Error;

use crate::recovery::ProblemKind;

#[derive(Debug, Error)]
pub enum StreamError {
    /// No frame producer is attached to the engine.
    #[error("no camera producer attached")]
    HardwareUnavailable,

    /// The encoder or recording pipeline could not be (re)started.
    #[error("stream setup failed: {0}")]
    StreamSetupFailure(String),

    /// Recovery attempt cap reached for a problem type.
    #[error("recovery attempts exhausted for {0}")]
    RecoveryExhausted(ProblemKind),

    /// An uncaught failure inside a monitor tick.
    #[error("monitoring loop error: {0}")]
    MonitoringLoopError(String),

    /// Operation referenced a client that is not registered.
    #[error("unknown client: {0}")]
    UnknownClient(String),
}
