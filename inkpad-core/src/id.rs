//! Replica and item identifiers.
//!
//! Every character ever inserted into a [`TextEngine`](crate::TextEngine) is
//! named by an [`ItemId`]: the replica that created it plus a Lamport counter.
//! The total order on `ItemId` (counter first, replica second) is the
//! tie-break used when concurrent inserts land at the same position.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a replica (one per engine instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Draw a fresh random replica id.
    ///
    /// Zero is never returned so it can serve as a sentinel in tests.
    pub fn random() -> Self {
        loop {
            let bytes = Uuid::new_v4().into_bytes();
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[..8]);
            let id = u64::from_le_bytes(word);
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Largest counter an item may carry.
///
/// Kept well below `u64::MAX` so counter arithmetic on a run never wraps,
/// and exactly representable as an f64 for clients that store ids as numbers.
pub const MAX_COUNTER: u64 = 1 << 53;

/// Identifier of a single character item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    /// Replica that created this item
    pub replica: ReplicaId,
    /// Lamport counter at creation (starts at 1)
    pub counter: u64,
}

impl ItemId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// The id `n` positions further along the same replica's counter.
    ///
    /// Runs of characters typed together get consecutive counters, so the
    /// k-th character of a run is `first.offset(k)`.
    pub fn offset(self, n: u64) -> Self {
        Self {
            replica: self.replica,
            counter: self.counter.saturating_add(n),
        }
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}
