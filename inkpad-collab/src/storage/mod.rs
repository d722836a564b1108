//! Document storage collaborator.
//!
//! ```text
//! ┌──────────────┐  load / create   ┌──────────────────────┐
//! │ RoomManager  │ ───────────────► │  DocumentRepository  │
//! │ Scheduler    │  save_* (text,   │  ├─ MemoryRepository │
//! └──────────────┘  title, images)  │  └─ RocksRepository  │
//!                                   └──────────────────────┘
//! ```
//!
//! The collaboration core only checkpoints materialized text here; while a
//! room is active its in-memory replica is the source of truth. A save
//! against a document that no longer exists reports [`SaveOutcome::NotFound`]
//! rather than failing.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::Attachment;

pub use memory::MemoryRepository;
pub use rocks::{DocumentMetadata, RocksRepository, StoreConfig};

/// Title given to documents created on first join.
pub const DEFAULT_TITLE: &str = "Untitled";

/// Durable document record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredDocument {
    pub text: String,
    pub title: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Document was deleted concurrently; the write was dropped
    NotFound,
}

/// Storage consumed by the collaboration core.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn load_document(&self, short_id: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Create an empty document. Returns the existing record if there is one.
    async fn create_document(&self, short_id: &str, title: &str) -> Result<StoredDocument, StoreError>;

    async fn save_document_text(&self, short_id: &str, text: &str) -> Result<SaveOutcome, StoreError>;

    async fn save_title(&self, short_id: &str, title: &str) -> Result<SaveOutcome, StoreError>;

    async fn save_attachments(
        &self,
        short_id: &str,
        attachments: &[Attachment],
    ) -> Result<SaveOutcome, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
