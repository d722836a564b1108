//! Client-side editor session.
//!
//! ```text
//!  UI ── submit_text / move_cursor / set_title / change_attachment ──► EditorSession
//!  UI ◄──────────────── UiEvent (text, presence, cursors, meta) ────── EditorSession
//!                                                                          │
//!                        EditorReplica (local TextEngine) ◄────────────────┤
//!                        PresenceRoom (remote cursors)    ◄────────────────┤
//!                        SyncClient (socket, offline queue) ◄──────────────┘
//! ```
//!
//! Local text changes flow out through a [`ReplicaObserver`]: the replica
//! only reports updates for local mutations, so integrating a remote
//! update never produces an outgoing one.

use inkpad_core::{
    EditorReplica, EngineError, MutationOrigin, ReplicaId, ReplicaObserver, SelectionAnchors, TextEdit,
    TextEngine,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::presence::PresenceRoom;
use crate::protocol::{apply_attachment_op, Attachment, AttachmentOp, ParticipantInfo, ProtocolError};

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Text changed because of a remote update
    TextChanged(String),
    PresenceChanged(Vec<ParticipantInfo>),
    /// Resolved remote cursor; `None` means hidden
    RemoteCursor {
        participant_id: Uuid,
        range: Option<(usize, usize)>,
    },
    ParticipantLeft(Uuid),
    TitleChanged(String),
    AttachmentsChanged(Vec<Attachment>),
    ConnectionChanged(ConnectionState),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Protocol(ProtocolError),
    Engine(EngineError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Protocol(e) => write!(f, "{e}"),
            SessionError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        SessionError::Engine(e)
    }
}

struct SessionObserver {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    ui: mpsc::UnboundedSender<UiEvent>,
}

impl ReplicaObserver for SessionObserver {
    fn local_update(&mut self, update: &[u8]) {
        let _ = self.outgoing.send(update.to_vec());
    }

    fn text_changed(&mut self, text: &str, origin: MutationOrigin) {
        if origin == MutationOrigin::Remote {
            let _ = self.ui.send(UiEvent::TextChanged(text.to_string()));
        }
    }
}

pub struct EditorSession {
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
    replica: EditorReplica,
    outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    presence: PresenceRoom,
    title: String,
    attachments: Vec<Attachment>,
    selection: (usize, usize),
    /// Room incarnation from the last join
    incarnation: Option<Uuid>,
    ui: mpsc::UnboundedSender<UiEvent>,
}

impl EditorSession {
    /// Connect to `server_url` and request to join `room_id`.
    pub async fn connect(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        author_id: Option<String>,
        display_name: Option<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UiEvent>), SessionError> {
        let client = SyncClient::new(server_url, room_id).with_identity(author_id, display_name);
        let (mut session, ui_rx) = Self::new(client)?;
        session.client.connect().await?;
        Ok((session, ui_rx))
    }

    /// Wrap an unconnected client.
    pub fn new(mut client: SyncClient) -> Result<(Self, mpsc::UnboundedReceiver<UiEvent>), SessionError> {
        let events = client.take_event_rx().ok_or(ProtocolError::ConnectionClosed)?;
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let mut replica = EditorReplica::new(TextEngine::new(ReplicaId::random()));
        replica.subscribe(Box::new(SessionObserver {
            outgoing: outgoing_tx,
            ui: ui_tx.clone(),
        }));

        let session = Self {
            client,
            events,
            replica,
            outgoing: outgoing_rx,
            presence: PresenceRoom::new(),
            title: String::new(),
            attachments: Vec::new(),
            selection: (0, 0),
            incarnation: None,
            ui: ui_tx,
        };
        Ok((session, ui_rx))
    }

    // ─── Imperative surface ───────────────────────────────────────────

    /// Replace the editor text; the change is diffed and sent.
    pub async fn submit_text(&mut self, text: &str) -> Result<(), SessionError> {
        self.replica.set_text(text)?;
        self.clamp_selection();
        self.flush_outgoing().await
    }

    pub async fn submit_edit(&mut self, edit: &TextEdit) -> Result<(), SessionError> {
        self.replica.edit(edit)?;
        self.clamp_selection();
        self.flush_outgoing().await
    }

    /// Move the local cursor and tell the room. Dropped while offline.
    pub async fn move_cursor(&mut self, start: usize, end: usize) -> Result<(), SessionError> {
        let len = self.replica.engine().len();
        let (start, end) = (start.min(len), end.min(len));
        self.selection = (start.min(end), start.max(end));
        let anchors = SelectionAnchors::capture(self.replica.engine(), self.selection.0, self.selection.1);
        self.client.send_cursor(anchors).await?;
        Ok(())
    }

    pub async fn set_title(&mut self, title: impl Into<String>) -> Result<(), SessionError> {
        self.title = title.into();
        self.client.send_title(self.title.clone()).await?;
        Ok(())
    }

    pub async fn change_attachment(&mut self, op: AttachmentOp, attachment: Attachment) -> Result<(), SessionError> {
        apply_attachment_op(&mut self.attachments, op, &attachment);
        self.client.send_attachment(op, attachment).await?;
        Ok(())
    }

    /// Re-run the join protocol on a fresh socket.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        self.client.reconnect().await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
    }

    // ─── Event processing ─────────────────────────────────────────────

    /// Handle the next client event. Returns `false` once the client is gone.
    pub async fn process_next(&mut self) -> Result<bool, SessionError> {
        match self.events.recv().await {
            Some(event) => {
                self.handle_event(event).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process events until the join reply has been integrated.
    pub async fn wait_joined(&mut self) -> Result<(), SessionError> {
        loop {
            match self.events.recv().await {
                Some(event) => {
                    let joined = matches!(event, SyncEvent::Joined { .. });
                    self.handle_event(event).await?;
                    if joined {
                        return Ok(());
                    }
                }
                None => return Err(ProtocolError::ConnectionClosed.into()),
            }
        }
    }

    pub async fn handle_event(&mut self, event: SyncEvent) -> Result<(), SessionError> {
        match event {
            SyncEvent::Connected => self.emit(UiEvent::ConnectionChanged(ConnectionState::Connecting)),
            SyncEvent::Disconnected => self.emit(UiEvent::ConnectionChanged(ConnectionState::Disconnected)),
            SyncEvent::Joined {
                participant_id,
                incarnation,
                snapshot,
                title,
                attachments,
                participants,
            } => {
                self.presence.set_local_id(participant_id);
                self.integrate_join_snapshot(incarnation, &snapshot).await?;
                self.set_meta(title, attachments, participants);
                self.emit(UiEvent::ConnectionChanged(ConnectionState::Connected));
            }
            SyncEvent::Resync {
                snapshot,
                title,
                attachments,
                participants,
            } => {
                self.apply_remote(&snapshot);
                self.set_meta(title, attachments, participants);
            }
            SyncEvent::RemoteUpdate { update, .. } => self.apply_remote(&update),
            SyncEvent::RemoteCursor { from, selection } => {
                if self.presence.set_cursor(from, selection) {
                    let range = self.presence.resolve(from, self.replica.engine());
                    self.emit(UiEvent::RemoteCursor {
                        participant_id: from,
                        range,
                    });
                }
            }
            SyncEvent::Presence(participants) => {
                self.presence.set_participants(participants.clone());
                self.emit(UiEvent::PresenceChanged(participants));
            }
            SyncEvent::ParticipantLeft(participant_id) => {
                if self.presence.remove(participant_id) {
                    self.emit(UiEvent::ParticipantLeft(participant_id));
                }
            }
            SyncEvent::TitleChanged { title, .. } => {
                self.title = title.clone();
                self.emit(UiEvent::TitleChanged(title));
            }
            SyncEvent::AttachmentChanged { op, attachment, .. } => {
                if apply_attachment_op(&mut self.attachments, op, &attachment) {
                    self.emit(UiEvent::AttachmentsChanged(self.attachments.clone()));
                }
            }
            SyncEvent::ServerError(message) => {
                log::warn!("Server error: {message}");
                self.emit(UiEvent::Error(message));
            }
        }
        Ok(())
    }

    /// Bring the replica in line with a join snapshot without losing
    /// local edits the server never received.
    ///
    /// Within one room incarnation the snapshot is merged and everything the
    /// server lacks is sent as one catch-up update; that covers the offline
    /// queue as well as updates lost in a dying socket. A rebuilt room
    /// shares no item ids with us, so unsent local text is re-applied as an
    /// edit on top of the stored text instead.
    async fn integrate_join_snapshot(&mut self, incarnation: Uuid, snapshot: &[u8]) -> Result<(), SessionError> {
        let queued = self.client.drain_offline().await;
        let rebuilt = self.incarnation.is_some_and(|previous| previous != incarnation);
        self.incarnation = Some(incarnation);

        if rebuilt {
            if queued.is_empty() {
                self.replica.replace_with_snapshot(snapshot)?;
            } else {
                log::warn!(
                    "Room {} was rebuilt while offline; re-applying {} local updates as a text edit",
                    self.client.room_id(),
                    queued.len()
                );
                let local = self.replica.text().to_string();
                self.replica.replace_with_snapshot(snapshot)?;
                self.replica.set_text(&local)?;
            }
            self.clamp_selection();
            return self.flush_outgoing().await;
        }

        let server = TextEngine::decode_full_state(ReplicaId::random(), snapshot)?;
        self.selection = self
            .replica
            .apply_remote_preserving_selection(snapshot, self.selection)?;
        let catch_up = self.replica.engine().delta_for(&server);
        if !catch_up.is_empty() {
            log::debug!(
                "Sending {} catch-up ops to room {}",
                catch_up.ops().len(),
                self.client.room_id()
            );
            self.client.send_update(catch_up.encode()?).await?;
        }
        self.flush_outgoing().await
    }

    fn set_meta(&mut self, title: String, attachments: Vec<Attachment>, participants: Vec<ParticipantInfo>) {
        self.title = title.clone();
        self.attachments = attachments.clone();
        self.presence.set_participants(participants.clone());
        self.emit(UiEvent::TitleChanged(title));
        self.emit(UiEvent::AttachmentsChanged(attachments));
        self.emit(UiEvent::PresenceChanged(participants));
    }

    /// Merge a remote update, keep the local selection on the same text,
    /// and re-resolve remote cursors. Bad updates are reported, not fatal.
    fn apply_remote(&mut self, update: &[u8]) {
        match self.replica.apply_remote_preserving_selection(update, self.selection) {
            Ok(selection) => {
                self.selection = selection;
                self.emit_cursors();
            }
            Err(e) => {
                log::warn!("Ignoring bad update from relay: {e}");
                self.emit(UiEvent::Error(e.to_string()));
            }
        }
    }

    fn emit_cursors(&self) {
        for (participant_id, range) in self.presence.resolve_all(self.replica.engine()) {
            self.emit(UiEvent::RemoteCursor { participant_id, range });
        }
    }

    async fn flush_outgoing(&mut self) -> Result<(), SessionError> {
        while let Ok(update) = self.outgoing.try_recv() {
            self.client.send_update(update).await?;
        }
        Ok(())
    }

    fn clamp_selection(&mut self) {
        let len = self.replica.engine().len();
        self.selection = (self.selection.0.min(len), self.selection.1.min(len));
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn text(&self) -> &str {
        self.replica.text()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn selection(&self) -> (usize, usize) {
        self.selection
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn replica(&self) -> &EditorReplica {
        &self.replica
    }

    pub fn participant_id(&self) -> Option<Uuid> {
        self.presence.local_id()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.client.connection_state().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.client.offline_queue_len().await
    }
}
