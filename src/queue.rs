//! Bounded per-client frame broadcast queue.
//!
//! A single producer pushes frames with [`FrameBroadcastQueue::put_frame`];
//! the frame fans out to every registered client sub-queue. Each sub-queue
//! is bounded with drop-oldest eviction so a slow consumer can never stall
//! the producer or grow memory without bound. All mutations happen under
//! one short-held lock; no I/O or sleeping while locked.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::frame::Frame;

struct SubQueue {
    frames: VecDeque<Frame>,
    last_read: Instant,
}

struct Inner {
    clients: HashMap<String, SubQueue>,
    max_size: usize,
    next_frame_id: u64,
    total_frames_added: u64,
    total_frames_consumed: u64,
    overflow_count: u64,
    expired_count: u64,
    peak_size: usize,
    last_frame_time: Option<Instant>,
    last_overflow_time: Option<Instant>,
    created: Instant,
}

/// Thread-safe bounded frame fan-out queue.
pub struct FrameBroadcastQueue {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl FrameBroadcastQueue {
    pub fn new(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                max_size: max_size.max(1),
                next_frame_id: 0,
                total_frames_added: 0,
                total_frames_consumed: 0,
                overflow_count: 0,
                expired_count: 0,
                peak_size: 0,
                last_frame_time: None,
                last_overflow_time: None,
                created: now,
            }),
            clock,
        }
    }

    /// Registers a client sub-queue. Re-adding an existing client clears
    /// its backlog.
    pub fn add_client(&self, client_id: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.clients.insert(
            client_id.to_string(),
            SubQueue {
                frames: VecDeque::new(),
                last_read: now,
            },
        );
    }

    /// Removes a client sub-queue. Returns false when the client was not
    /// registered.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.clients.remove(client_id).is_some()
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.inner.lock().unwrap().clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    /// Pushes a frame to every registered sub-queue without blocking.
    ///
    /// Empty payloads are rejected. Sub-queues at capacity evict their
    /// oldest entry; each eviction counts as one overflow.
    pub fn put_frame(&self, data: Bytes, quality: u8) -> bool {
        if data.is_empty() {
            return false;
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        inner.next_frame_id += 1;
        let id = inner.next_frame_id;
        let frame = Frame::new(id, data, now, quality);

        let max_size = inner.max_size;
        let mut overflowed = 0u64;
        let mut peak = inner.peak_size;
        for sub in inner.clients.values_mut() {
            if sub.frames.len() >= max_size {
                sub.frames.pop_front();
                overflowed += 1;
            }
            sub.frames.push_back(frame.clone());
            peak = peak.max(sub.frames.len());
        }

        inner.total_frames_added += 1;
        inner.peak_size = peak;
        inner.last_frame_time = Some(now);
        if overflowed > 0 {
            inner.overflow_count += overflowed;
            inner.last_overflow_time = Some(now);
        }

        true
    }

    /// Pops the oldest still-fresh frame for a client (FIFO within the
    /// freshness window).
    ///
    /// Stale entries at the head are discarded until a fresh frame is
    /// found; returns None when the sub-queue is empty or fully stale.
    pub fn get_frame(&self, client_id: &str, max_age: Duration) -> Option<Frame> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let sub = inner.clients.get_mut(client_id)?;
        sub.last_read = now;

        let mut expired = 0u64;
        let found = loop {
            match sub.frames.pop_front() {
                Some(frame) if frame.is_stale(now, max_age) => expired += 1,
                other => break other,
            }
        };

        inner.expired_count += expired;
        if found.is_some() {
            inner.total_frames_consumed += 1;
        }
        found
    }

    /// Removes sub-queues whose last read is older than `ttl`, reclaiming
    /// resources from clients that disconnected without a clean close.
    pub fn expire_idle_clients(&self, ttl: Duration) -> Vec<String> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let expired: Vec<String> = inner
            .clients
            .iter()
            .filter(|(_, sub)| now.saturating_duration_since(sub.last_read) > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            inner.clients.remove(id);
        }
        if !expired.is_empty() {
            debug!("Expired {} idle client sub-queue(s)", expired.len());
        }
        expired
    }

    /// Changes the per-client capacity, evicting oldest entries in any
    /// sub-queue that now exceeds it. Evictions count as overflow.
    pub fn resize(&self, new_max_size: usize) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let new_max = new_max_size.max(1);
        inner.max_size = new_max;

        let mut dropped = 0u64;
        for sub in inner.clients.values_mut() {
            while sub.frames.len() > new_max {
                sub.frames.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            inner.overflow_count += dropped;
            inner.last_overflow_time = Some(now);
        }
    }

    /// Drops all buffered frames from every sub-queue.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for sub in inner.clients.values_mut() {
            sub.frames.clear();
        }
    }

    /// Snapshot of queue performance metrics.
    ///
    /// `queue_size` reports the deepest sub-queue backlog, i.e. the slowest
    /// consumer's lag, since that is the pressure signal adaptation cares
    /// about.
    pub fn metrics(&self) -> QueueMetrics {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();

        let queue_size = inner
            .clients
            .values()
            .map(|s| s.frames.len())
            .max()
            .unwrap_or(0);

        let uptime = now.saturating_duration_since(inner.created).as_secs_f64();
        let add_rate = if uptime > 0.0 {
            inner.total_frames_added as f64 / uptime
        } else {
            0.0
        };
        let consume_rate = if uptime > 0.0 {
            inner.total_frames_consumed as f64 / uptime
        } else {
            0.0
        };
        let overflow_rate = if inner.total_frames_added > 0 {
            inner.overflow_count as f64 / inner.total_frames_added as f64
        } else {
            0.0
        };
        let time_since_last_frame = inner
            .last_frame_time
            .map(|t| now.saturating_duration_since(t).as_secs_f64());
        let time_since_last_overflow = inner
            .last_overflow_time
            .map(|t| now.saturating_duration_since(t).as_secs_f64());

        QueueMetrics {
            queue_size,
            max_size: inner.max_size,
            client_count: inner.clients.len(),
            utilization: queue_size as f64 / inner.max_size as f64,
            overflow_rate,
            total_frames_added: inner.total_frames_added,
            total_frames_consumed: inner.total_frames_consumed,
            overflow_count: inner.overflow_count,
            expired_count: inner.expired_count,
            peak_size: inner.peak_size,
            add_rate,
            consume_rate,
            net_rate: add_rate - consume_rate,
            uptime_secs: uptime,
            time_since_last_frame_secs: time_since_last_frame,
            time_since_last_overflow_secs: time_since_last_overflow,
            is_healthy: overflow_rate < 0.3,
            is_under_pressure: overflow_rate > 0.7,
            is_critical: overflow_rate > 0.9,
            has_recent_activity: time_since_last_frame.map(|t| t < 5.0).unwrap_or(false),
        }
    }
}

/// Queue performance snapshot. `overflow_rate` is the primary adaptation
/// signal.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub queue_size: usize,
    pub max_size: usize,
    pub client_count: usize,
    pub utilization: f64,
    pub overflow_rate: f64,
    pub total_frames_added: u64,
    pub total_frames_consumed: u64,
    pub overflow_count: u64,
    pub expired_count: u64,
    pub peak_size: usize,
    pub add_rate: f64,
    pub consume_rate: f64,
    pub net_rate: f64,
    pub uptime_secs: f64,
    pub time_since_last_frame_secs: Option<f64>,
    pub time_since_last_overflow_secs: Option<f64>,
    pub is_healthy: bool,
    pub is_under_pressure: bool,
    pub is_critical: bool,
    pub has_recent_activity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MAX_AGE: Duration = Duration::from_secs(5);

    fn queue_with_clock(max_size: usize) -> (FrameBroadcastQueue, ManualClock) {
        let clock = ManualClock::new();
        let queue = FrameBroadcastQueue::new(max_size, Arc::new(clock.clone()));
        (queue, clock)
    }

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n; 16])
    }

    #[test]
    fn rejects_empty_frames() {
        let (queue, _) = queue_with_clock(10);
        queue.add_client("a");
        assert!(!queue.put_frame(Bytes::new(), 85));
        assert_eq!(queue.metrics().total_frames_added, 0);
    }

    #[test]
    fn overflow_evicts_oldest_and_counts() {
        let (queue, _) = queue_with_clock(10);
        queue.add_client("a");

        for i in 0..15u8 {
            assert!(queue.put_frame(payload(i), 85));
        }

        let metrics = queue.metrics();
        assert_eq!(metrics.queue_size, 10);
        assert_eq!(metrics.overflow_count, 5);
        assert_eq!(metrics.total_frames_added, 15);

        // Oldest five frames were evicted, so the head is frame id 6.
        let frame = queue.get_frame("a", MAX_AGE).unwrap();
        assert_eq!(frame.id, 6);
    }

    #[test]
    fn frames_delivered_in_fifo_order() {
        let (queue, _) = queue_with_clock(10);
        queue.add_client("a");

        for i in 0..5u8 {
            queue.put_frame(payload(i), 85);
        }

        let mut last_id = 0;
        while let Some(frame) = queue.get_frame("a", MAX_AGE) {
            assert!(frame.id > last_id);
            last_id = frame.id;
        }
        assert_eq!(last_id, 5);
    }

    #[test]
    fn stale_frames_never_returned() {
        let (queue, clock) = queue_with_clock(10);
        queue.add_client("a");

        queue.put_frame(payload(1), 85);
        clock.advance(Duration::from_secs(10));

        assert!(queue.get_frame("a", MAX_AGE).is_none());
        assert_eq!(queue.metrics().expired_count, 1);
    }

    #[test]
    fn stale_head_discarded_fresh_frame_behind_returned() {
        let (queue, clock) = queue_with_clock(10);
        queue.add_client("a");

        queue.put_frame(payload(1), 85);
        clock.advance(Duration::from_secs(10));
        queue.put_frame(payload(2), 85);

        let frame = queue.get_frame("a", MAX_AGE).unwrap();
        assert_eq!(frame.id, 2);
        assert_eq!(queue.metrics().expired_count, 1);
    }

    #[test]
    fn empty_subqueue_returns_none() {
        let (queue, _) = queue_with_clock(10);
        queue.add_client("a");
        assert!(queue.get_frame("a", MAX_AGE).is_none());
        assert!(queue.get_frame("unknown", MAX_AGE).is_none());
    }

    #[test]
    fn fan_out_delivers_independently() {
        let (queue, _) = queue_with_clock(10);
        queue.add_client("a");
        queue.add_client("b");

        queue.put_frame(payload(1), 85);
        queue.put_frame(payload(2), 85);

        assert_eq!(queue.get_frame("a", MAX_AGE).unwrap().id, 1);
        assert_eq!(queue.get_frame("a", MAX_AGE).unwrap().id, 2);
        // b's sub-queue is untouched by a's reads.
        assert_eq!(queue.get_frame("b", MAX_AGE).unwrap().id, 1);
    }

    #[test]
    fn overflow_counted_per_subqueue() {
        let (queue, _) = queue_with_clock(2);
        queue.add_client("a");
        queue.add_client("b");

        for i in 0..3u8 {
            queue.put_frame(payload(i), 85);
        }

        // Both sub-queues evicted one frame.
        assert_eq!(queue.metrics().overflow_count, 2);
    }

    #[test]
    fn idle_clients_expire() {
        let (queue, clock) = queue_with_clock(10);
        queue.add_client("idle");
        queue.add_client("busy");

        clock.advance(Duration::from_secs(100));
        queue.put_frame(payload(1), 85);
        queue.get_frame("busy", MAX_AGE);

        clock.advance(Duration::from_secs(250));
        let expired = queue.expire_idle_clients(Duration::from_secs(300));
        assert_eq!(expired, vec!["idle".to_string()]);
        assert!(!queue.has_client("idle"));
        assert!(queue.has_client("busy"));
    }

    #[test]
    fn resize_drops_excess_as_overflow() {
        let (queue, _) = queue_with_clock(10);
        queue.add_client("a");
        for i in 0..10u8 {
            queue.put_frame(payload(i), 85);
        }

        queue.resize(4);
        let metrics = queue.metrics();
        assert_eq!(metrics.queue_size, 4);
        assert_eq!(metrics.overflow_count, 6);

        // Remaining head is the oldest surviving frame.
        assert_eq!(queue.get_frame("a", MAX_AGE).unwrap().id, 7);
    }

    #[test]
    fn overflow_rate_bounds_and_health_flags() {
        let (queue, _) = queue_with_clock(1);
        queue.add_client("a");
        for i in 0..20u8 {
            queue.put_frame(payload(i), 85);
        }

        let metrics = queue.metrics();
        assert!(metrics.overflow_rate > 0.9);
        assert!(metrics.overflow_rate <= 1.0);
        assert!(metrics.is_critical);
        assert!(metrics.is_under_pressure);
        assert!(!metrics.is_healthy);
        assert!(metrics.overflow_count <= metrics.total_frames_added);
    }

    #[test]
    fn clear_empties_all_subqueues() {
        let (queue, _) = queue_with_clock(10);
        queue.add_client("a");
        queue.put_frame(payload(1), 85);
        queue.clear();
        assert!(queue.get_frame("a", MAX_AGE).is_none());
    }
}
