//! Frame representation.
//!
//! Frames arrive from the camera adapter as opaque encoded bytes plus a
//! quality label; the engine never inspects the payload.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

/// An encoded frame with delivery metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing frame id assigned by the broadcast queue.
    pub id: u64,
    /// Encoded payload (typically JPEG).
    pub data: Bytes,
    /// When the frame was enqueued.
    pub timestamp: Instant,
    /// Quality label the encoder used for this frame.
    pub quality: u8,
    /// Producer tag for diagnostics.
    pub producer: &'static str,
}

impl Frame {
    pub fn new(id: u64, data: Bytes, timestamp: Instant, quality: u8) -> Self {
        Self {
            id,
            data,
            timestamp,
            quality,
            producer: "camera",
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Frame age relative to `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    /// True when the frame is older than `max_age` at `now`.
    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// Serializable metadata snapshot for diagnostics.
    pub fn info(&self, now: Instant) -> FrameInfo {
        FrameInfo {
            id: self.id,
            quality: self.quality,
            size: self.size(),
            age_secs: self.age(now).as_secs_f64(),
            producer: self.producer,
        }
    }
}

/// Frame metadata exposed through the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct FrameInfo {
    pub id: u64,
    pub quality: u8,
    pub size: usize,
    pub age_secs: f64,
    pub producer: &'static str,
}
