//! # inkpad-collab — Real-time collaboration layer for Inkpad
//!
//! Relays CRDT updates between editors over WebSocket and checkpoints the
//! converged text to storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ EditorSession │ ◄────────────────► │ SyncServer  │
//! │  SyncClient   │   bincode frames   │ (relay)     │
//! └───────┬───────┘                    └──────┬──────┘
//!         │                                   │
//!         ▼                                   ▼
//! ┌───────────────┐                    ┌─────────────┐     ┌──────────────────────┐
//! │ EditorReplica │                    │ RoomManager │ ──► │ PersistenceScheduler │
//! │ (local)       │                    │ Room: engine│     │ (debounced saves)    │
//! └───────────────┘                    │ + broadcast │     └──────────┬───────────┘
//!                                      └─────────────┘                ▼
//!                                                          DocumentRepository
//!                                                          (memory | RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — wire messages (bincode-encoded [`RelayMessage`])
//! - [`broadcast`] — per-room fan-out with backpressure
//! - [`presence`] — participant descriptors and remote cursors
//! - [`rooms`] — room lifecycle and the authoritative replicas
//! - [`scheduler`] — debounced text persistence
//! - [`storage`] — document repository (in-memory and RocksDB)
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket client with offline queue
//! - [`session`] — editor-facing session tying the client to a replica

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod rooms;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use presence::{color_for, PresenceRoom, PALETTE};
pub use protocol::{apply_attachment_op, Attachment, AttachmentOp, ParticipantInfo, ProtocolError, RelayMessage};
pub use rooms::{JoinOutcome, Room, RoomError, RoomManager, RoomPhase, RoomSettings};
pub use scheduler::{PersistenceScheduler, SaveResult, SchedulerStats};
pub use server::{BoxError, ServerConfig, ServerStats, SyncServer};
pub use session::{EditorSession, SessionError, UiEvent};
pub use storage::{
    DocumentMetadata, DocumentRepository, MemoryRepository, RocksRepository, SaveOutcome, StoreConfig,
    StoreError, StoredDocument,
};
