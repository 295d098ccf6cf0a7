//! Background monitoring loops.
//!
//! Two loops run alongside the stream: the network monitor samples
//! delivery performance and drives the global adaptation controller,
//! and the health monitor probes camera, stream and session health and
//! hands confirmed problems to the recovery coordinator.

mod health;
mod network;

pub use health::{HealthMetric, HealthMonitor, HealthState, HealthStatus};
pub use network::{AdaptationCallback, NetworkCheck, NetworkMonitor, NetworkTrend};
