//! Room session manager.
//!
//! One [`Room`] per active document. The room owns the authoritative
//! [`TextEngine`] replica; every mutation goes through the room's state
//! lock, so updates to one document are applied one at a time while
//! different rooms proceed independently.
//!
//! ```text
//!            join                     last leave
//!  (none) ─────────► Active ───────────────────────► Draining ── flushed ──► Closed
//!                      ▲                                │                  (removed)
//!                      └─────────── join ───────────────┘
//! ```
//!
//! Lock order: `save_lock` before `state`, and `state` before the room map.
//! The room map lock is never held across an await on a room lock.

use std::collections::HashMap;
use std::sync::Arc;

use inkpad_core::{EngineError, IntegrationReport, ReplicaId, SelectionAnchors, TextEngine};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Outbound};
use crate::protocol::{apply_attachment_op, Attachment, AttachmentOp, ParticipantInfo, ProtocolError, RelayMessage};
use crate::scheduler::PersistenceScheduler;
use crate::storage::{DocumentRepository, SaveOutcome, StoreError, StoredDocument, DEFAULT_TITLE};

/// Flush attempts before a draining room gives up and stays in memory.
const MAX_DRAIN_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Active,
    /// Last participant left; pending text is being flushed
    Draining,
    /// Flushed and removed from the manager
    Closed,
}

struct RoomState {
    engine: TextEngine,
    participants: Vec<ParticipantInfo>,
    title: String,
    attachments: Vec<Attachment>,
    phase: RoomPhase,
    /// Bumped on every text change
    revision: u64,
    /// Revision last handed to storage
    saved_revision: u64,
}

/// An active document room.
pub struct Room {
    id: String,
    /// Fresh per hydration; item ids from another incarnation do not match
    incarnation: Uuid,
    state: Mutex<RoomState>,
    /// Serializes storage writes for this room.
    pub(crate) save_lock: Mutex<()>,
    broadcast: BroadcastGroup,
}

impl Room {
    pub(crate) fn new(id: &str, engine: TextEngine, document: StoredDocument, broadcast_capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            incarnation: Uuid::new_v4(),
            state: Mutex::new(RoomState {
                engine,
                participants: Vec::new(),
                title: document.title,
                attachments: document.attachments,
                phase: RoomPhase::Active,
                revision: 0,
                saved_revision: 0,
            }),
            save_lock: Mutex::new(()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Materialized text of the authoritative replica.
    pub async fn text(&self) -> String {
        self.state.lock().await.engine.materialize()
    }

    pub async fn title(&self) -> String {
        self.state.lock().await.title.clone()
    }

    pub async fn attachments(&self) -> Vec<Attachment> {
        self.state.lock().await.attachments.clone()
    }

    pub async fn phase(&self) -> RoomPhase {
        self.state.lock().await.phase
    }

    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.participants.len()
    }

    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.state.lock().await.participants.clone()
    }

    /// Current text and its revision, if it changed since the last save.
    pub(crate) async fn dirty_text(&self) -> Option<(u64, String)> {
        let state = self.state.lock().await;
        (state.revision != state.saved_revision).then(|| (state.revision, state.engine.materialize()))
    }

    pub(crate) async fn mark_saved(&self, revision: u64) {
        let mut state = self.state.lock().await;
        state.saved_revision = state.saved_revision.max(revision);
    }

    #[cfg(test)]
    pub(crate) async fn add_participant_for_test(&self, participant: ParticipantInfo) {
        self.state.lock().await.participants.push(participant);
    }

    /// Merge an update into the replica and relay the original bytes to
    /// everyone else. A malformed update leaves the replica untouched and
    /// is not relayed.
    pub(crate) async fn apply_and_relay(
        &self,
        participant_id: Uuid,
        update: &[u8],
    ) -> Result<IntegrationReport, RoomError> {
        let mut state = self.state.lock().await;
        ensure_member(&state, participant_id)?;

        let report = state
            .engine
            .apply_remote_update(update)
            .map_err(RoomError::MalformedUpdate)?;
        if report.changed() {
            state.revision += 1;
        }

        // Relayed while still holding the lock so per-room relay order
        // matches application order.
        let msg = RelayMessage::SyncUpdate {
            from: Some(participant_id),
            update: update.to_vec(),
        };
        self.broadcast.broadcast(Some(participant_id), &msg)?;
        log::trace!(
            "Relayed {} byte update from {participant_id} in room {} (+{} -{} parked {})",
            update.len(),
            self.id,
            report.inserted,
            report.deleted,
            report.parked
        );
        Ok(report)
    }
}

fn ensure_member(state: &RoomState, participant_id: Uuid) -> Result<(), RoomError> {
    if state.participants.iter().any(|p| p.participant_id == participant_id) {
        Ok(())
    } else {
        Err(RoomError::NotJoined(participant_id))
    }
}

/// Everything a joining participant needs.
pub struct JoinOutcome {
    pub room: Arc<Room>,
    pub receiver: broadcast::Receiver<Outbound>,
    pub incarnation: Uuid,
    pub snapshot: Vec<u8>,
    pub title: String,
    pub attachments: Vec<Attachment>,
    pub participants: Vec<ParticipantInfo>,
}

/// Room-level errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomError {
    RoomFull { room_id: String, limit: usize },
    UnknownRoom(String),
    /// Participant is not in the room it addressed
    NotJoined(Uuid),
    MalformedUpdate(EngineError),
    Engine(EngineError),
    Storage(StoreError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::RoomFull { room_id, limit } => {
                write!(f, "Room {room_id} is full ({limit} participants)")
            }
            RoomError::UnknownRoom(id) => write!(f, "Unknown room: {id}"),
            RoomError::NotJoined(id) => write!(f, "Participant {id} has not joined this room"),
            RoomError::MalformedUpdate(e) => write!(f, "Rejected update: {e}"),
            RoomError::Engine(e) => write!(f, "Engine error: {e}"),
            RoomError::Storage(e) => write!(f, "Storage error: {e}"),
            RoomError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<StoreError> for RoomError {
    fn from(e: StoreError) -> Self {
        RoomError::Storage(e)
    }
}

impl From<ProtocolError> for RoomError {
    fn from(e: ProtocolError) -> Self {
        RoomError::Protocol(e)
    }
}

impl From<EngineError> for RoomError {
    fn from(e: EngineError) -> Self {
        RoomError::Engine(e)
    }
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub max_participants: usize,
    pub broadcast_capacity: usize,
    /// Create an empty record for unknown room ids on first join
    pub create_missing_documents: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: 100,
            broadcast_capacity: 256,
            create_missing_documents: true,
        }
    }
}

/// Where a draining room stands after a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainCheck {
    Closed,
    /// Someone rejoined; the room is live again
    Reactivated,
    /// Unsaved text remains
    Dirty,
}

/// Close a draining room and drop it from the registry once its text is saved.
async fn try_close(rooms: &RwLock<HashMap<String, Arc<Room>>>, room: &Arc<Room>) -> DrainCheck {
    let mut state = room.state.lock().await;
    if state.phase != RoomPhase::Draining || !state.participants.is_empty() {
        log::debug!("Room {} reactivated while draining", room.id());
        return DrainCheck::Reactivated;
    }
    if state.revision != state.saved_revision {
        return DrainCheck::Dirty;
    }

    state.phase = RoomPhase::Closed;
    let mut rooms = rooms.write().await;
    if rooms.get(room.id()).is_some_and(|current| Arc::ptr_eq(current, room)) {
        rooms.remove(room.id());
    }
    log::info!("Room {} closed", room.id());
    DrainCheck::Closed
}

/// Registry of active rooms.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    repository: Arc<dyn DocumentRepository>,
    scheduler: Arc<PersistenceScheduler>,
    settings: RoomSettings,
}

impl RoomManager {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        scheduler: Arc<PersistenceScheduler>,
        settings: RoomSettings,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            repository,
            scheduler,
            settings,
        }
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub fn scheduler(&self) -> &Arc<PersistenceScheduler> {
        &self.scheduler
    }

    /// Write every live room's unsaved text now. Returns the number of
    /// rooms whose write failed.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut failed = 0;
        for room in rooms {
            if let Err(e) = self.scheduler.flush(&room).await {
                log::error!("Failed to flush room {}: {e}", room.id());
                failed += 1;
            }
        }
        failed
    }

    /// Existing room, or a new one hydrated from storage.
    async fn get_or_hydrate(&self, room_id: &str) -> Result<Arc<Room>, RoomError> {
        if let Some(room) = self.room(room_id).await {
            return Ok(room);
        }

        let document = match self.repository.load_document(room_id).await? {
            Some(document) => document,
            None if self.settings.create_missing_documents => {
                self.repository.create_document(room_id, DEFAULT_TITLE).await?
            }
            None => StoredDocument {
                title: DEFAULT_TITLE.to_string(),
                ..StoredDocument::default()
            },
        };
        let engine = TextEngine::from_text(ReplicaId::random(), &document.text);
        let hydrated = Arc::new(Room::new(room_id, engine, document, self.settings.broadcast_capacity));

        // Another join may have hydrated the same room meanwhile.
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::info!("Room {room_id} hydrated");
            hydrated
        });
        Ok(Arc::clone(room))
    }

    /// Add a participant and hand back the room's full snapshot.
    pub async fn join(&self, room_id: &str, participant: ParticipantInfo) -> Result<JoinOutcome, RoomError> {
        loop {
            let room = self.get_or_hydrate(room_id).await?;
            let mut state = room.state.lock().await;
            if state.phase == RoomPhase::Closed {
                // Lost a race with the drain that removed it; hydrate again.
                continue;
            }
            if state.participants.len() >= self.settings.max_participants {
                return Err(RoomError::RoomFull {
                    room_id: room_id.to_string(),
                    limit: self.settings.max_participants,
                });
            }

            state.phase = RoomPhase::Active;
            let receiver = room.broadcast.subscribe();
            let participant_id = participant.participant_id;
            state.participants.retain(|p| p.participant_id != participant_id);
            state.participants.push(participant);

            let snapshot = state.engine.encode_full_state()?;
            let participants = state.participants.clone();
            room.broadcast.broadcast(
                Some(participant_id),
                &RelayMessage::Presence {
                    participants: participants.clone(),
                },
            )?;
            log::info!(
                "Participant {participant_id} joined room {room_id} ({} present)",
                participants.len()
            );

            let title = state.title.clone();
            let attachments = state.attachments.clone();
            drop(state);
            return Ok(JoinOutcome {
                incarnation: room.incarnation(),
                room,
                receiver,
                snapshot,
                title,
                attachments,
                participants,
            });
        }
    }

    /// Remove a participant. The last one out drains the room.
    pub async fn leave(&self, room_id: &str, participant_id: Uuid) -> Result<(), RoomError> {
        let Some(room) = self.room(room_id).await else {
            return Ok(());
        };

        let drain = {
            let mut state = room.state.lock().await;
            let before = state.participants.len();
            state.participants.retain(|p| p.participant_id != participant_id);
            if state.participants.len() == before {
                return Ok(());
            }

            room.broadcast
                .broadcast(Some(participant_id), &RelayMessage::ParticipantLeft { participant_id })?;
            room.broadcast.broadcast(
                Some(participant_id),
                &RelayMessage::Presence {
                    participants: state.participants.clone(),
                },
            )?;
            log::info!(
                "Participant {participant_id} left room {room_id} ({} present)",
                state.participants.len()
            );

            if state.participants.is_empty() && state.phase == RoomPhase::Active {
                state.phase = RoomPhase::Draining;
                true
            } else {
                false
            }
        };

        if drain {
            self.drain(&room).await;
        }
        Ok(())
    }

    /// Flush and discard an empty room, unless someone rejoins first.
    ///
    /// If storage keeps failing the room stays in memory and a background
    /// task keeps flushing it once per debounce window until a write lands.
    async fn drain(&self, room: &Arc<Room>) {
        for attempt in 1..=MAX_DRAIN_ATTEMPTS {
            let flushed = match self.scheduler.flush(room).await {
                Ok(_) => true,
                Err(e) => {
                    log::error!("Failed to flush room {} (attempt {attempt}): {e}", room.id());
                    false
                }
            };

            match try_close(&self.rooms, room).await {
                DrainCheck::Closed | DrainCheck::Reactivated => return,
                DrainCheck::Dirty if !flushed => tokio::time::sleep(self.scheduler.window()).await,
                DrainCheck::Dirty => {}
            }
        }

        log::warn!(
            "Room {} kept in memory after {MAX_DRAIN_ATTEMPTS} failed flushes, retrying in background",
            room.id()
        );
        let rooms = Arc::clone(&self.rooms);
        let scheduler = Arc::clone(&self.scheduler);
        let room = Arc::clone(room);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(scheduler.window()).await;
                if let Err(e) = scheduler.flush(&room).await {
                    log::warn!("Background flush of room {} failed: {e}", room.id());
                    continue;
                }
                match try_close(&rooms, &room).await {
                    DrainCheck::Closed | DrainCheck::Reactivated => return,
                    DrainCheck::Dirty => {}
                }
            }
        });
    }

    /// Merge a participant's update and relay it to the rest of the room.
    pub async fn apply_and_broadcast(
        &self,
        room_id: &str,
        participant_id: Uuid,
        update: &[u8],
    ) -> Result<IntegrationReport, RoomError> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| RoomError::UnknownRoom(room_id.to_string()))?;
        let report = room.apply_and_relay(participant_id, update).await?;
        if report.changed() {
            self.scheduler.schedule_save(&room).await;
        }
        Ok(report)
    }

    /// Relay a cursor move. Never stored, never merged.
    pub async fn update_cursor(
        &self,
        room_id: &str,
        participant_id: Uuid,
        selection: SelectionAnchors,
    ) -> Result<(), RoomError> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| RoomError::UnknownRoom(room_id.to_string()))?;
        let state = room.state.lock().await;
        ensure_member(&state, participant_id)?;
        room.broadcast.broadcast(
            Some(participant_id),
            &RelayMessage::CursorMove {
                from: Some(participant_id),
                selection,
            },
        )?;
        Ok(())
    }

    /// Last-writer-wins title: update, relay, write through.
    pub async fn set_title(&self, room_id: &str, participant_id: Uuid, title: String) -> Result<(), RoomError> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| RoomError::UnknownRoom(room_id.to_string()))?;
        let _save = room.save_lock.lock().await;
        {
            let mut state = room.state.lock().await;
            ensure_member(&state, participant_id)?;
            state.title = title.clone();
            room.broadcast.broadcast(
                Some(participant_id),
                &RelayMessage::TitleChange {
                    from: Some(participant_id),
                    title: title.clone(),
                },
            )?;
        }
        let outcome = self.repository.save_title(room_id, &title).await;
        log_write_through(room_id, "title", outcome);
        Ok(())
    }

    /// Apply an attachment edit, relay it, and write the full list through.
    ///
    /// Returns whether the list changed; no-op edits are not relayed.
    pub async fn change_attachment(
        &self,
        room_id: &str,
        participant_id: Uuid,
        op: AttachmentOp,
        attachment: Attachment,
    ) -> Result<bool, RoomError> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| RoomError::UnknownRoom(room_id.to_string()))?;
        let _save = room.save_lock.lock().await;
        let attachments = {
            let mut state = room.state.lock().await;
            ensure_member(&state, participant_id)?;
            if !apply_attachment_op(&mut state.attachments, op, &attachment) {
                return Ok(false);
            }
            room.broadcast.broadcast(
                Some(participant_id),
                &RelayMessage::AttachmentChange {
                    from: Some(participant_id),
                    op,
                    attachment,
                },
            )?;
            state.attachments.clone()
        };
        let outcome = self.repository.save_attachments(room_id, &attachments).await;
        log_write_through(room_id, "attachments", outcome);
        Ok(true)
    }

    /// Full state for a connection that fell behind.
    pub async fn resync(&self, room_id: &str) -> Result<RelayMessage, RoomError> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| RoomError::UnknownRoom(room_id.to_string()))?;
        let state = room.state.lock().await;
        Ok(RelayMessage::Resync {
            snapshot: state.engine.encode_full_state()?,
            title: state.title.clone(),
            attachments: state.attachments.clone(),
            participants: state.participants.clone(),
        })
    }
}

fn log_write_through(room_id: &str, what: &str, outcome: Result<SaveOutcome, StoreError>) {
    match outcome {
        Ok(SaveOutcome::Saved) => {}
        Ok(SaveOutcome::NotFound) => {
            log::debug!("Document {room_id} no longer exists; dropped {what} write")
        }
        Err(e) => log::error!("Failed to write {what} for {room_id}: {e}"),
    }
}
