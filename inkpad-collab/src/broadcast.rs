//! Per-room fan-out with backpressure.
//!
//! Uses a tokio broadcast channel: one encoded frame, shared by `Arc`, is
//! delivered to every subscriber. Each frame is tagged with the participant
//! it originated from so a connection can skip its own messages.
//!
//! A subscriber that falls more than `capacity` frames behind loses the
//! oldest ones (`RecvError::Lagged`); the server recovers it with a fresh
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, RelayMessage};

/// A frame on its way to room subscribers.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Participant that caused it; `None` for server-originated frames
    pub origin: Option<Uuid>,
    pub frame: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters, read via [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast channel for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn broadcast(&self, origin: Option<Uuid>, msg: &RelayMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(origin, frame))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: Option<Uuid>, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Outbound { origin, frame }).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.receiver_count(),
        }
    }
}
