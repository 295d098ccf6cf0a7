//! Per-client sessions and paced MJPEG delivery streams.
//!
//! Each connected viewer gets a session tracking its delivery counters
//! plus its own pacing controller, so one slow client backs off without
//! dragging the shared encoder settings down for everyone else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_stream::stream;
use bytes::Bytes;
use serde::Serialize;
use tokio_stream::Stream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapt::{AdaptLimits, QualityController, StepTable};
use crate::clock::Clock;
use crate::mjpeg;
use crate::queue::FrameBroadcastQueue;

/// State for one connected viewer.
#[derive(Debug)]
pub struct ClientSession {
    pub id: String,
    connected_at: Instant,
    last_activity: Instant,
    frames_delivered: u64,
    frames_skipped: u64,
    bytes_delivered: u64,
    controller: QualityController,
}

impl ClientSession {
    fn new(id: String, limits: AdaptLimits, adaptation_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            id,
            connected_at: now,
            last_activity: now,
            frames_delivered: 0,
            frames_skipped: 0,
            bytes_delivered: 0,
            controller: QualityController::new(
                limits,
                StepTable::per_client(),
                adaptation_interval,
                clock,
            ),
        }
    }

    fn record_delivery(&mut self, bytes: usize, delivery_time_secs: f64, now: Instant) {
        self.frames_delivered += 1;
        self.bytes_delivered += bytes as u64;
        self.last_activity = now;
        self.controller.feed(1.0, delivery_time_secs);
    }

    fn record_skip(&mut self) {
        self.frames_skipped += 1;
        self.controller.feed(0.0, 0.0);
    }

    pub fn delivery_efficiency(&self) -> f64 {
        let total = self.frames_delivered + self.frames_skipped;
        if total == 0 {
            return 1.0;
        }
        self.frames_delivered as f64 / total as f64
    }

    pub fn target_fps(&self) -> u32 {
        self.controller.current_fps()
    }

    pub fn is_active(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) < ttl
    }

    fn stats(&mut self, now: Instant) -> ClientStats {
        let uptime = now.saturating_duration_since(self.connected_at).as_secs_f64();
        let consumption_rate = if uptime > 0.0 {
            self.frames_delivered as f64 / uptime
        } else {
            0.0
        };
        let throughput_mbps = if uptime > 0.0 {
            self.bytes_delivered as f64 * 8.0 / 1_000_000.0 / uptime
        } else {
            0.0
        };
        ClientStats {
            id: self.id.clone(),
            uptime_secs: uptime,
            frames_delivered: self.frames_delivered,
            frames_skipped: self.frames_skipped,
            bytes_delivered: self.bytes_delivered,
            delivery_efficiency: self.delivery_efficiency(),
            consumption_rate,
            throughput_mbps,
            target_fps: self.controller.current_fps(),
            pacing_quality: self.controller.current_quality(),
            idle_secs: now.saturating_duration_since(self.last_activity).as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub id: String,
    pub uptime_secs: f64,
    pub frames_delivered: u64,
    pub frames_skipped: u64,
    pub bytes_delivered: u64,
    pub delivery_efficiency: f64,
    pub consumption_rate: f64,
    pub throughput_mbps: f64,
    pub target_fps: u32,
    pub pacing_quality: u8,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientsSummary {
    pub client_count: usize,
    pub total_frames_delivered: u64,
    pub total_frames_skipped: u64,
    pub total_bytes_delivered: u64,
    pub aggregate_delivery_efficiency: f64,
    pub clients: Vec<ClientStats>,
}

/// Tracks every connected client and hands out delivery streams.
pub struct ClientRegistry {
    sessions: Mutex<HashMap<String, Arc<Mutex<ClientSession>>>>,
    queue: Arc<FrameBroadcastQueue>,
    limits: AdaptLimits,
    adaptation_interval: Duration,
    max_frame_age: Duration,
    clock: Arc<dyn Clock>,
}

impl ClientRegistry {
    pub fn new(
        queue: Arc<FrameBroadcastQueue>,
        limits: AdaptLimits,
        adaptation_interval: Duration,
        max_frame_age: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            queue,
            limits,
            adaptation_interval,
            max_frame_age,
            clock,
        }
    }

    /// Registers a client with the queue and the session table.
    pub fn register(&self) -> String {
        let client_id = Uuid::new_v4().to_string();
        let session = ClientSession::new(
            client_id.clone(),
            self.limits,
            self.adaptation_interval,
            self.clock.clone(),
        );
        self.queue.add_client(&client_id);
        self.sessions
            .lock()
            .unwrap()
            .insert(client_id.clone(), Arc::new(Mutex::new(session)));
        info!("Client {} connected", client_id);
        client_id
    }

    /// Removes a client from the session table and the queue.
    pub fn remove(&self, client_id: &str) -> bool {
        let existed = self.sessions.lock().unwrap().remove(client_id).is_some();
        self.queue.remove_client(client_id);
        if existed {
            info!("Client {} disconnected", client_id);
        }
        existed
    }

    pub fn client_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Drops clients that have not consumed a frame within `ttl`.
    pub fn cleanup_inactive(&self, ttl: Duration) -> Vec<String> {
        let now = self.clock.now();
        let stale: Vec<String> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| !s.lock().unwrap().is_active(now, ttl))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            self.remove(id);
            info!("Client {} expired after inactivity", id);
        }
        stale
    }

    pub fn summary(&self) -> ClientsSummary {
        let now = self.clock.now();
        let sessions = self.sessions.lock().unwrap();
        let clients: Vec<ClientStats> = sessions
            .values()
            .map(|s| s.lock().unwrap().stats(now))
            .collect();

        let total_frames_delivered = clients.iter().map(|c| c.frames_delivered).sum();
        let total_frames_skipped: u64 = clients.iter().map(|c| c.frames_skipped).sum();
        let total_bytes_delivered = clients.iter().map(|c| c.bytes_delivered).sum();
        let total: u64 = total_frames_delivered + total_frames_skipped;
        let aggregate_delivery_efficiency = if total == 0 {
            1.0
        } else {
            total_frames_delivered as f64 / total as f64
        };

        ClientsSummary {
            client_count: clients.len(),
            total_frames_delivered,
            total_frames_skipped,
            total_bytes_delivered,
            aggregate_delivery_efficiency,
            clients,
        }
    }

    /// Opens a paced MJPEG delivery stream for a new client.
    ///
    /// Each pacing slot polls the client's sub-queue every 10 ms until a
    /// frame arrives or the slot expires; a missed slot counts against
    /// the client's delivery ratio and its pacing controller backs the
    /// frame rate off. Dropping the stream deregisters the client.
    pub fn open_stream(self: &Arc<Self>) -> (String, impl Stream<Item = Bytes>) {
        let client_id = self.register();
        let registry = Arc::clone(self);
        let id = client_id.clone();

        let s = stream! {
            let _guard = StreamGuard {
                registry: Arc::clone(&registry),
                client_id: id.clone(),
            };

            loop {
                let session = {
                    let sessions = registry.sessions.lock().unwrap();
                    match sessions.get(&id) {
                        Some(s) => Arc::clone(s),
                        // Expired by the cleanup sweep.
                        None => break,
                    }
                };

                let target_fps = session.lock().unwrap().target_fps().max(1);
                let slot = Duration::from_secs_f64(1.0 / target_fps as f64);
                let slot_start = registry.clock.now();
                let wall_start = tokio::time::Instant::now();

                let mut delivered = None;
                while registry.clock.now().saturating_duration_since(slot_start) < slot {
                    if let Some(frame) = registry.queue.get_frame(&id, registry.max_frame_age) {
                        delivered = Some(frame);
                        break;
                    }
                    if !registry.queue.has_client(&id) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }

                if !registry.queue.has_client(&id) {
                    debug!("Client {} removed from queue, ending stream", id);
                    break;
                }

                match delivered {
                    Some(frame) => {
                        let now = registry.clock.now();
                        let delivery_time =
                            now.saturating_duration_since(slot_start).as_secs_f64();
                        {
                            let mut s = session.lock().unwrap();
                            s.record_delivery(frame.size(), delivery_time, now);
                            s.controller.perform_adaptation();
                        }
                        yield mjpeg::encode_part(&frame.data);

                        // Pace out the rest of the slot.
                        let elapsed = wall_start.elapsed();
                        if elapsed < slot {
                            tokio::time::sleep(slot - elapsed).await;
                        }
                    }
                    None => {
                        let mut s = session.lock().unwrap();
                        s.record_skip();
                        s.controller.perform_adaptation();
                    }
                }
            }
        };

        (client_id, s)
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("client_count", &self.client_count())
            .finish()
    }
}

struct StreamGuard {
    registry: Arc<ClientRegistry>,
    client_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_stream::StreamExt;

    fn limits() -> AdaptLimits {
        AdaptLimits {
            min_quality: 30,
            max_quality: 85,
            min_fps: 2,
            max_fps: 30,
        }
    }

    fn registry_with_clock() -> (Arc<ClientRegistry>, Arc<FrameBroadcastQueue>, ManualClock) {
        let clock = ManualClock::new();
        let queue = Arc::new(FrameBroadcastQueue::new(10, Arc::new(clock.clone())));
        let registry = Arc::new(ClientRegistry::new(
            queue.clone(),
            limits(),
            Duration::from_secs(3),
            Duration::from_secs(5),
            Arc::new(clock.clone()),
        ));
        (registry, queue, clock)
    }

    #[test]
    fn register_and_remove_track_the_queue() {
        let (registry, queue, _) = registry_with_clock();
        let id = registry.register();
        assert_eq!(registry.client_count(), 1);
        assert!(queue.has_client(&id));

        assert!(registry.remove(&id));
        assert_eq!(registry.client_count(), 0);
        assert!(!queue.has_client(&id));
        assert!(!registry.remove(&id));
    }

    #[test]
    fn delivery_efficiency_math() {
        let clock = ManualClock::new();
        let mut session = ClientSession::new(
            "c".into(),
            limits(),
            Duration::from_secs(3),
            Arc::new(clock.clone()),
        );
        assert_eq!(session.delivery_efficiency(), 1.0);

        let now = clock.now();
        session.record_delivery(1000, 0.05, now);
        session.record_delivery(1000, 0.05, now);
        session.record_delivery(1000, 0.05, now);
        session.record_skip();
        assert!((session.delivery_efficiency() - 0.75).abs() < 1e-9);

        clock.advance_secs(2.0);
        let stats = session.stats(clock.now());
        assert_eq!(stats.frames_delivered, 3);
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.bytes_delivered, 3000);
        assert!(stats.consumption_rate > 0.0);
    }

    #[test]
    fn cleanup_removes_only_idle_clients() {
        let (registry, queue, clock) = registry_with_clock();
        let idle = registry.register();
        clock.advance_secs(100.0);
        let fresh = registry.register();

        clock.advance_secs(250.0);
        let expired = registry.cleanup_inactive(Duration::from_secs(300));
        assert_eq!(expired, vec![idle.clone()]);
        assert_eq!(registry.client_count(), 1);
        assert!(!queue.has_client(&idle));
        assert!(queue.has_client(&fresh));
    }

    #[test]
    fn summary_aggregates_across_clients() {
        let (registry, _, clock) = registry_with_clock();
        let a = registry.register();
        registry.register();

        {
            let sessions = registry.sessions.lock().unwrap();
            let mut s = sessions[&a].lock().unwrap();
            let now = clock.now();
            s.record_delivery(500, 0.01, now);
            s.record_skip();
        }

        let summary = registry.summary();
        assert_eq!(summary.client_count, 2);
        assert_eq!(summary.total_frames_delivered, 1);
        assert_eq!(summary.total_frames_skipped, 1);
        assert_eq!(summary.total_bytes_delivered, 500);
        assert!((summary.aggregate_delivery_efficiency - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stream_yields_framed_parts_and_deregisters_on_drop() {
        let (registry, queue, _) = registry_with_clock();
        queue.put_frame(Bytes::from_static(b"\xff\xd8first\xff\xd9"), 85);

        let (id, stream) = registry.open_stream();
        let mut stream = Box::pin(stream);
        assert_eq!(registry.client_count(), 1);

        // The client registered after that first frame, so feed one now.
        queue.put_frame(Bytes::from_static(b"\xff\xd8jpeg\xff\xd9"), 85);

        let part = stream.next().await.unwrap();
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(b"\xff\xd9\r\n"));

        drop(stream);
        assert_eq!(registry.client_count(), 0);
        assert!(!queue.has_client(&id));
    }
}
