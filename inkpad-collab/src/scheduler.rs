//! Debounced text persistence.
//!
//! Each room has at most one pending save timer. Rescheduling aborts the
//! previous timer and starts a new one, so a burst of edits ends in a
//! single write of the final text once the room has been quiet for the
//! debounce window.
//!
//! A failed write leaves the room dirty; the next scheduled save or flush
//! writes it again. Writes never hold the room's state lock, so incoming
//! edits are never blocked on storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::rooms::Room;
use crate::storage::{DocumentRepository, SaveOutcome, StoreError};

/// Result of one persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    Written,
    /// Nothing changed since the last save
    Unchanged,
    /// Document was deleted; the write was dropped
    DocumentMissing,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub writes: u64,
    pub failures: u64,
}

struct PendingSave {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct PersistenceScheduler {
    repository: Arc<dyn DocumentRepository>,
    window: Duration,
    timers: Mutex<HashMap<String, PendingSave>>,
    next_generation: AtomicU64,
    scheduled: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
}

impl PersistenceScheduler {
    pub fn new(repository: Arc<dyn DocumentRepository>, window: Duration) -> Self {
        Self {
            repository,
            window,
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            scheduled: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// (Re)start the debounce window for a room.
    pub async fn schedule_save(self: &Arc<Self>, room: &Arc<Room>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock().await;

        let scheduler = Arc::clone(self);
        let target = Arc::clone(room);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(scheduler.window).await;
            {
                let mut timers = scheduler.timers.lock().await;
                match timers.get(target.id()) {
                    Some(pending) if pending.generation == generation => {
                        timers.remove(target.id());
                    }
                    _ => return,
                }
            }
            if let Err(e) = scheduler.write_room(&target).await {
                log::error!("Debounced save of {} failed: {e}", target.id());
            }
        });

        if let Some(previous) = timers.insert(room.id().to_string(), PendingSave { generation, handle }) {
            previous.handle.abort();
        }
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Cancel any pending timer and write now.
    pub async fn flush(&self, room: &Arc<Room>) -> Result<SaveResult, StoreError> {
        if let Some(pending) = self.timers.lock().await.remove(room.id()) {
            pending.handle.abort();
        }
        self.write_room(room).await
    }

    async fn write_room(&self, room: &Room) -> Result<SaveResult, StoreError> {
        let _save = room.save_lock.lock().await;
        let Some((revision, text)) = room.dirty_text().await else {
            return Ok(SaveResult::Unchanged);
        };

        match self.repository.save_document_text(room.id(), &text).await {
            Ok(SaveOutcome::Saved) => {
                room.mark_saved(revision).await;
                self.writes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Saved {} ({} chars, revision {revision})", room.id(), text.chars().count());
                Ok(SaveResult::Written)
            }
            Ok(SaveOutcome::NotFound) => {
                room.mark_saved(revision).await;
                log::debug!("Document {} no longer exists; dropped text write", room.id());
                Ok(SaveResult::DocumentMissing)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Rooms with a timer still running.
    pub async fn pending_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
