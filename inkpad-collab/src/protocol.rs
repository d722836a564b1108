//! Relay wire protocol.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`RelayMessage`].
//! CRDT updates and snapshots travel inside as opaque byte vectors and are
//! never re-encoded by the relay.
//!
//! ```text
//! client                                server
//!   │ ── JoinRoom{room, author, name} ──► │
//!   │ ◄── Joined{id, incarnation, ─────── │   full snapshot, not a replay
//!   │       snapshot, meta}               │
//!   │ ── SyncUpdate{update} ────────────► │ ──► SyncUpdate{from, update} to others
//!   │ ── CursorMove{anchors} ───────────► │ ──► CursorMove{from, anchors} to others
//!   │ ◄── Presence{participants} ──────── │   whenever the set changes
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use inkpad_core::SelectionAnchors;

/// Upper bound on a decoded frame.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_BYTES>()
}

/// A connected participant as seen by everyone in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Connection id, assigned by the server
    pub participant_id: Uuid,
    /// Stable author or guest id
    pub author_id: String,
    pub name: String,
    /// CSS hex color, derived from the connection id
    pub color: String,
    /// Join time, milliseconds since the Unix epoch
    pub joined_at: u64,
}

/// Image placed on the document canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub url: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentOp {
    Add,
    Update,
    Delete,
}

/// Apply an attachment edit to a list (last writer wins per record).
///
/// `Update` of an unknown id is a no-op. Returns whether the list changed.
pub fn apply_attachment_op(list: &mut Vec<Attachment>, op: AttachmentOp, attachment: &Attachment) -> bool {
    match op {
        AttachmentOp::Add => {
            list.push(attachment.clone());
            true
        }
        AttachmentOp::Update => match list.iter_mut().find(|a| a.id == attachment.id) {
            Some(existing) => {
                *existing = attachment.clone();
                true
            }
            None => false,
        },
        AttachmentOp::Delete => {
            let before = list.len();
            list.retain(|a| a.id != attachment.id);
            list.len() != before
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Client asks to enter a room. Leaves any room the connection is in.
    JoinRoom {
        room_id: String,
        author_id: Option<String>,
        display_name: Option<String>,
    },
    LeaveRoom,
    /// Join reply: the room's full state plus out-of-band metadata.
    Joined {
        participant_id: Uuid,
        /// Identifies this in-memory copy of the room; a new value means the
        /// room was rebuilt from storage and old item ids are gone
        incarnation: Uuid,
        snapshot: Vec<u8>,
        title: String,
        attachments: Vec<Attachment>,
        participants: Vec<ParticipantInfo>,
    },
    /// Fresh full state for a connection that fell behind. Merged, not replaced.
    Resync {
        snapshot: Vec<u8>,
        title: String,
        attachments: Vec<Attachment>,
        participants: Vec<ParticipantInfo>,
    },
    /// CRDT update. `from` is filled in by the server when relaying.
    SyncUpdate {
        from: Option<Uuid>,
        update: Vec<u8>,
    },
    CursorMove {
        from: Option<Uuid>,
        selection: SelectionAnchors,
    },
    Presence {
        participants: Vec<ParticipantInfo>,
    },
    ParticipantLeft {
        participant_id: Uuid,
    },
    TitleChange {
        from: Option<Uuid>,
        title: String,
    },
    AttachmentChange {
        from: Option<Uuid>,
        op: AttachmentOp,
        attachment: Attachment,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
}

impl RelayMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::Joined { .. } => "joined",
            Self::Resync { .. } => "resync",
            Self::SyncUpdate { .. } => "sync-update",
            Self::CursorMove { .. } => "cursor-move",
            Self::Presence { .. } => "presence",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::TitleChange { .. } => "title-change",
            Self::AttachmentChange { .. } => "attachment-change",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionFailed(String),
    ConnectionClosed,
    /// Offline queue is at capacity
    QueueFull,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::QueueFull => write!(f, "Offline queue full"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use inkpad_core::{ReplicaId, TextEngine};

    fn attachment(id: &str, x: f64) -> Attachment {
        Attachment {
            id: id.into(),
            url: format!("/uploads/{id}.png"),
            x,
            y: 10.0,
            width: 200.0,
            height: 100.0,
        }
    }

    #[test]
    fn test_sync_update_carries_bytes_exactly() {
        let update = vec![0u8, 0xFF, 0x80, 0x0A, 0x0D, 0xC3, 0x28];
        let msg = RelayMessage::SyncUpdate {
            from: Some(Uuid::new_v4()),
            update: update.clone(),
        };
        match RelayMessage::decode(&msg.encode().unwrap()).unwrap() {
            RelayMessage::SyncUpdate { update: decoded, .. } => assert_eq!(decoded, update),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_join_roundtrip() {
        let msg = RelayMessage::JoinRoom {
            room_id: "abc123".into(),
            author_id: None,
            display_name: Some("Ada".into()),
        };
        assert_eq!(RelayMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_cursor_move_roundtrip() {
        let engine = TextEngine::from_text(ReplicaId::from_u64(1), "hello");
        let msg = RelayMessage::CursorMove {
            from: None,
            selection: SelectionAnchors::capture(&engine, 1, 4),
        };
        assert_eq!(RelayMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(RelayMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(RelayMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(RelayMessage::Ping.kind(), "ping");
        assert_eq!(RelayMessage::LeaveRoom.kind(), "leave-room");
    }

    #[test]
    fn test_attachment_ops() {
        let mut list = Vec::new();
        assert!(apply_attachment_op(&mut list, AttachmentOp::Add, &attachment("a", 0.0)));
        assert!(apply_attachment_op(&mut list, AttachmentOp::Add, &attachment("b", 0.0)));

        assert!(apply_attachment_op(&mut list, AttachmentOp::Update, &attachment("a", 50.0)));
        assert_eq!(list[0].x, 50.0);

        assert!(!apply_attachment_op(&mut list, AttachmentOp::Update, &attachment("zzz", 1.0)));
        assert_eq!(list.len(), 2);

        assert!(apply_attachment_op(&mut list, AttachmentOp::Delete, &attachment("a", 0.0)));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "b");
        assert!(!apply_attachment_op(&mut list, AttachmentOp::Delete, &attachment("a", 0.0)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ProtocolError::ConnectionClosed.to_string(), "Connection closed");
        assert!(ProtocolError::DeserializationError("x".into())
            .to_string()
            .starts_with("Deserialization"));
    }
}
