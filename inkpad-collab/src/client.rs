//! WebSocket client for the relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Update send/receive as opaque CRDT bytes
//! - Cursor, title and attachment messages
//! - Offline queue for updates made while disconnected
//!
//! The client does not own a replica; [`crate::session::EditorSession`]
//! pairs it with one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use inkpad_core::SelectionAnchors;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Attachment, AttachmentOp, ParticipantInfo, ProtocolError, RelayMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket open, waiting for the join reply
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Socket established; join not yet acknowledged
    Connected,
    Disconnected,
    Joined {
        participant_id: Uuid,
        /// Changes whenever the server rebuilds the room from storage
        incarnation: Uuid,
        snapshot: Vec<u8>,
        title: String,
        attachments: Vec<Attachment>,
        participants: Vec<ParticipantInfo>,
    },
    /// Full state after falling behind; merge it
    Resync {
        snapshot: Vec<u8>,
        title: String,
        attachments: Vec<Attachment>,
        participants: Vec<ParticipantInfo>,
    },
    RemoteUpdate {
        from: Option<Uuid>,
        update: Vec<u8>,
    },
    RemoteCursor {
        from: Uuid,
        selection: SelectionAnchors,
    },
    Presence(Vec<ParticipantInfo>),
    ParticipantLeft(Uuid),
    TitleChanged {
        from: Option<Uuid>,
        title: String,
    },
    AttachmentChanged {
        from: Option<Uuid>,
        op: AttachmentOp,
        attachment: Attachment,
    },
    ServerError(String),
}

/// Updates made while disconnected, replayed after the next join.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns `false` when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Take every queued update, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    room_id: String,
    author_id: Option<String>,
    display_name: Option<String>,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    /// Assigned by the server on join
    participant_id: Arc<RwLock<Option<Uuid>>>,

    /// Bumped per socket; a stale reader task must not touch the state
    epoch: Arc<AtomicU64>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            room_id: room_id.into(),
            author_id: None,
            display_name: None,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            participant_id: Arc::new(RwLock::new(None)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Identity sent with every join.
    pub fn with_identity(mut self, author_id: Option<String>, display_name: Option<String>) -> Self {
        self.author_id = author_id;
        self.display_name = display_name;
        self
    }

    pub fn with_offline_capacity(self, max_size: usize) -> Self {
        Self {
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(max_size))),
            ..self
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and request to join the room.
    ///
    /// The client only counts as connected once the join reply arrives;
    /// updates sent before that are queued.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = RelayMessage::JoinRoom {
            room_id: self.room_id.clone(),
            author_id: self.author_id.clone(),
            display_name: self.display_name.clone(),
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: turn incoming frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let participant_id = self.participant_id.clone();
        let current_epoch = self.epoch.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let relay = match RelayMessage::decode(&data) {
                            Ok(relay) => relay,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        if let RelayMessage::Joined { participant_id: id, .. } = &relay {
                            *participant_id.write().await = Some(*id);
                            *state.write().await = ConnectionState::Connected;
                        }
                        if let Some(event) = into_event(relay) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            let mut state = state.write().await;
            if current_epoch.load(Ordering::SeqCst) == epoch {
                *state = ConnectionState::Disconnected;
                drop(state);
                let _ = event_tx.send(SyncEvent::Disconnected).await;
            }
        });

        Ok(())
    }

    /// Drop the current socket and join again from scratch.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Leave the room and close the socket.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            if let Ok(leave) = RelayMessage::LeaveRoom.encode() {
                let _ = tx.send(leave).await;
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a CRDT update; queued while not connected.
    ///
    /// An update the socket refuses is queued too, and the client drops to
    /// `Disconnected` so later updates queue behind it.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        if self.connection_state().await == ConnectionState::Connected {
            let encoded = RelayMessage::SyncUpdate {
                from: None,
                update: update.clone(),
            }
            .encode()?;
            let sent = match self.outgoing_tx {
                Some(ref tx) => tx.send(encoded).await.is_ok(),
                None => false,
            };
            if sent {
                return Ok(());
            }
            log::warn!("Send to room {} failed, queueing update", self.room_id);
            *self.state.write().await = ConnectionState::Disconnected;
        }
        self.enqueue(update).await
    }

    async fn enqueue(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        if self.offline_queue.lock().await.enqueue(update) {
            Ok(())
        } else {
            Err(ProtocolError::QueueFull)
        }
    }

    /// Send a cursor move. Dropped while offline.
    pub async fn send_cursor(&self, selection: SelectionAnchors) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(&RelayMessage::CursorMove { from: None, selection }).await
    }

    pub async fn send_title(&self, title: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&RelayMessage::TitleChange {
            from: None,
            title: title.into(),
        })
        .await
    }

    pub async fn send_attachment(&self, op: AttachmentOp, attachment: Attachment) -> Result<(), ProtocolError> {
        self.send(&RelayMessage::AttachmentChange {
            from: None,
            op,
            attachment,
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&RelayMessage::Ping).await
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Take queued updates for replay.
    pub async fn drain_offline(&self) -> Vec<Vec<u8>> {
        self.offline_queue.lock().await.drain()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn participant_id(&self) -> Option<Uuid> {
        *self.participant_id.read().await
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn set_state_for_test(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }
}

fn into_event(msg: RelayMessage) -> Option<SyncEvent> {
    let event = match msg {
        RelayMessage::Joined {
            participant_id,
            incarnation,
            snapshot,
            title,
            attachments,
            participants,
        } => SyncEvent::Joined {
            participant_id,
            incarnation,
            snapshot,
            title,
            attachments,
            participants,
        },
        RelayMessage::Resync {
            snapshot,
            title,
            attachments,
            participants,
        } => SyncEvent::Resync {
            snapshot,
            title,
            attachments,
            participants,
        },
        RelayMessage::SyncUpdate { from, update } => SyncEvent::RemoteUpdate { from, update },
        RelayMessage::CursorMove {
            from: Some(from),
            selection,
        } => SyncEvent::RemoteCursor { from, selection },
        RelayMessage::Presence { participants } => SyncEvent::Presence(participants),
        RelayMessage::ParticipantLeft { participant_id } => SyncEvent::ParticipantLeft(participant_id),
        RelayMessage::TitleChange { from, title } => SyncEvent::TitleChanged { from, title },
        RelayMessage::AttachmentChange { from, op, attachment } => {
            SyncEvent::AttachmentChanged { from, op, attachment }
        }
        RelayMessage::Error { message } => SyncEvent::ServerError(message),
        other => {
            log::trace!("Ignoring server-sent {}", other.kind());
            return None;
        }
    };
    Some(event)
}
