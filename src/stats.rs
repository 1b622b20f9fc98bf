use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of the counters of one proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Connections that reached the connected state
    pub connections_opened: u64,
    /// Connections that finished teardown
    pub connections_closed: u64,
    /// Text messages accepted for handling
    pub messages_received: u64,
    /// Payload bytes of accepted text messages
    pub bytes_received: u64,
    /// Frames written by `send`
    pub frames_sent: u64,
    /// Messages dropped by the per-connection rps limiter
    pub dropped_by_rps: u64,
    /// Messages dropped by the shared bandwidth limiter
    pub dropped_by_bandwidth: u64,
    /// Binary frames received and discarded
    pub dropped_non_text: u64,
    /// Upgrade requests rejected by the server
    pub upgrades_rejected: u64,
    /// Unix timestamp of the tracker creation
    pub start_time: u64,
}

impl StatsSnapshot {
    /// Connections currently alive
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

/// Lock-free counters shared by a proxy and its connection managers
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    dropped_by_rps: AtomicU64,
    dropped_by_bandwidth: AtomicU64,
    dropped_non_text: AtomicU64,
    upgrades_rejected: AtomicU64,
    start_time: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Counters {
                start_time: SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default(),
                ..Default::default()
            }),
        }
    }

    pub fn connection_opened(&self) {
        self.inner.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.inner.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self, bytes: usize) {
        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_by_rps(&self) {
        self.inner.dropped_by_rps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_by_bandwidth(&self) {
        self.inner.dropped_by_bandwidth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_non_text(&self) {
        self.inner.dropped_non_text.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upgrade_rejected(&self) {
        self.inner.upgrades_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.inner;
        StatsSnapshot {
            connections_opened: c.connections_opened.load(Ordering::Relaxed),
            connections_closed: c.connections_closed.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            dropped_by_rps: c.dropped_by_rps.load(Ordering::Relaxed),
            dropped_by_bandwidth: c.dropped_by_bandwidth.load(Ordering::Relaxed),
            dropped_non_text: c.dropped_non_text.load(Ordering::Relaxed),
            upgrades_rejected: c.upgrades_rejected.load(Ordering::Relaxed),
            start_time: c.start_time,
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}
