//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── TextEngine (authoritative)
//!             ├── Connection ── Room ─┼── BroadcastGroup ──► other connections
//! Client B ──┘     (per socket)       └── PersistenceScheduler ──► DocumentRepository
//! ```
//!
//! Each connection runs one task that multiplexes three sources: frames
//! from its socket, frames broadcast to its room, and the heartbeat
//! timer. Updates from one socket are handled in arrival order, so a
//! participant's updates are relayed in the order it sent them.
//!
//! A dropped socket is an implicit leave.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Outbound;
use crate::protocol::{Attachment, AttachmentOp, ParticipantInfo, RelayMessage};
use crate::rooms::{RoomError, RoomManager, RoomSettings};
use crate::scheduler::PersistenceScheduler;
use crate::storage::{DocumentRepository, MemoryRepository, RocksRepository, StoreConfig, StoreError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub max_participants_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Quiet period before a room's text is saved
    pub save_debounce_ms: u64,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Create a document record for unknown room ids on first join
    pub create_missing_documents: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            max_participants_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            save_debounce_ms: 1500,
            storage_path: None,
            create_missing_documents: true,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `INKPAD_*` / `PORT` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = parse_var::<u16>(&lookup, "PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(bind) = lookup("INKPAD_BIND").filter(|b| !b.trim().is_empty()) {
            config.bind_addr = bind.trim().to_string();
        }
        if let Some(dir) = lookup("INKPAD_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(dir.trim()));
        }
        if let Some(ms) = parse_var(&lookup, "INKPAD_SAVE_DEBOUNCE_MS") {
            config.save_debounce_ms = ms;
        }
        if let Some(max) = parse_var(&lookup, "INKPAD_MAX_PARTICIPANTS") {
            config.max_participants_per_room = max;
        }
        if let Some(secs) = parse_var(&lookup, "INKPAD_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = secs;
        }
        config
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            max_participants: self.max_participants_per_room,
            broadcast_capacity: self.broadcast_capacity,
            create_missing_documents: self.create_missing_documents,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub text_saves: u64,
    pub failed_saves: u64,
    pub rejected_updates: u64,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open storage per the configuration and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let repository: Arc<dyn DocumentRepository> = match &config.storage_path {
            Some(path) => {
                let store = RocksRepository::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                match store.list_documents() {
                    Ok(ids) => log::info!("Opened document store at {} ({} documents)", path.display(), ids.len()),
                    Err(e) => log::warn!("Opened document store at {} but could not list it: {e}", path.display()),
                }
                Arc::new(store)
            }
            None => {
                log::info!("No storage path configured; documents live in memory");
                Arc::new(MemoryRepository::new())
            }
        };
        Ok(Self::with_repository(config, repository))
    }

    /// Build the server around an existing repository.
    pub fn with_repository(config: ServerConfig, repository: Arc<dyn DocumentRepository>) -> Self {
        let scheduler = Arc::new(PersistenceScheduler::new(repository.clone(), config.save_debounce()));
        let rooms = Arc::new(RoomManager::new(repository, scheduler, config.room_settings()));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, heartbeat).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::new(rooms, stats.clone());
        log::info!("WebSocket connection {} established from {addr}", conn.participant_id);

        let result = conn.pump(ws_stream, heartbeat).await;

        conn.leave_current().await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection {} from {addr} closed", conn.participant_id);
        result
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        let saves = self.rooms.scheduler().stats();
        stats.text_saves = saves.writes;
        stats.failed_saves = saves.failures;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// Per-socket state.
struct Connection {
    /// Assigned once per socket; reused across room switches
    participant_id: Uuid,
    room_id: Option<String>,
    receiver: Option<broadcast::Receiver<Outbound>>,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Connection {
    fn new(rooms: Arc<RoomManager>, stats: Arc<RwLock<ServerStats>>) -> Self {
        Self {
            participant_id: Uuid::new_v4(),
            room_id: None,
            receiver: None,
            rooms,
            stats,
        }
    }

    async fn pump(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        for reply in self.handle_frame(&data).await {
                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {}: {e}", self.participant_id);
                        break;
                    }
                    _ => {}
                },

                outbound = self.next_outbound() => match outbound {
                    Ok(outbound) => {
                        // Never echo a participant's own messages back.
                        if outbound.origin != Some(self.participant_id) {
                            ws_sender.send(Message::Binary(outbound.frame.to_vec().into())).await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        if let Some(resync) = self.recover_lag(skipped).await {
                            ws_sender.send(Message::Binary(resync.encode()?.into())).await?;
                        }
                    }
                    Err(RecvError::Closed) => self.receiver = None,
                },

                _ = ticker.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
        Ok(())
    }

    async fn next_outbound(&mut self) -> Result<Outbound, RecvError> {
        match self.receiver.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Handle one client frame; returns replies for this socket only.
    async fn handle_frame(&mut self, bytes: &[u8]) -> Vec<RelayMessage> {
        let msg = match RelayMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Undecodable frame from {}: {e}", self.participant_id);
                return error_reply(e);
            }
        };
        log::trace!("{} from {}", msg.kind(), self.participant_id);

        match msg {
            RelayMessage::JoinRoom {
                room_id,
                author_id,
                display_name,
            } => self.join(room_id, author_id, display_name).await,
            RelayMessage::LeaveRoom => {
                self.leave_current().await;
                Vec::new()
            }
            RelayMessage::SyncUpdate { update, .. } => self.sync_update(&update).await,
            RelayMessage::CursorMove { selection, .. } => {
                let Some(room_id) = self.room_id.clone() else {
                    return not_joined();
                };
                self.reply_on_error(self.rooms.update_cursor(&room_id, self.participant_id, selection).await)
            }
            RelayMessage::TitleChange { title, .. } => {
                let Some(room_id) = self.room_id.clone() else {
                    return not_joined();
                };
                self.reply_on_error(self.rooms.set_title(&room_id, self.participant_id, title).await)
            }
            RelayMessage::AttachmentChange { op, attachment, .. } => self.change_attachment(op, attachment).await,
            RelayMessage::Ping => vec![RelayMessage::Pong],
            other => {
                log::debug!("Ignoring client-sent {} from {}", other.kind(), self.participant_id);
                Vec::new()
            }
        }
    }

    async fn join(
        &mut self,
        room_id: String,
        author_id: Option<String>,
        display_name: Option<String>,
    ) -> Vec<RelayMessage> {
        // Switching rooms leaves the previous one first.
        self.leave_current().await;

        let info = ParticipantInfo::new(self.participant_id, author_id, display_name);
        match self.rooms.join(&room_id, info).await {
            Ok(outcome) => {
                self.room_id = Some(room_id);
                self.receiver = Some(outcome.receiver);
                vec![RelayMessage::Joined {
                    participant_id: self.participant_id,
                    incarnation: outcome.incarnation,
                    snapshot: outcome.snapshot,
                    title: outcome.title,
                    attachments: outcome.attachments,
                    participants: outcome.participants,
                }]
            }
            Err(e) => {
                log::warn!("Join of {room_id} by {} rejected: {e}", self.participant_id);
                error_reply(e)
            }
        }
    }

    async fn sync_update(&mut self, update: &[u8]) -> Vec<RelayMessage> {
        let Some(room_id) = self.room_id.clone() else {
            return not_joined();
        };
        match self
            .rooms
            .apply_and_broadcast(&room_id, self.participant_id, update)
            .await
        {
            Ok(_) => Vec::new(),
            Err(e @ RoomError::MalformedUpdate(_)) => {
                log::warn!(
                    "Rejected {} byte update from {} in room {room_id}: {e}",
                    update.len(),
                    self.participant_id
                );
                self.stats.write().await.rejected_updates += 1;
                error_reply(e)
            }
            Err(e) => self.reply_on_error(Err(e)),
        }
    }

    async fn change_attachment(&mut self, op: AttachmentOp, attachment: Attachment) -> Vec<RelayMessage> {
        let Some(room_id) = self.room_id.clone() else {
            return not_joined();
        };
        let result = self
            .rooms
            .change_attachment(&room_id, self.participant_id, op, attachment)
            .await
            .map(|_| ());
        self.reply_on_error(result)
    }

    fn reply_on_error(&self, result: Result<(), RoomError>) -> Vec<RelayMessage> {
        match result {
            Ok(()) => Vec::new(),
            Err(e) => {
                log::warn!("Request from {} failed: {e}", self.participant_id);
                error_reply(e)
            }
        }
    }

    async fn recover_lag(&mut self, skipped: u64) -> Option<RelayMessage> {
        let room_id = self.room_id.clone()?;
        if let Some(room) = self.rooms.room(&room_id).await {
            room.broadcast().record_lag(skipped);
        }
        log::warn!(
            "Participant {} lagged by {skipped} messages in room {room_id}; sending resync",
            self.participant_id
        );
        match self.rooms.resync(&room_id).await {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::warn!("Resync for {} failed: {e}", self.participant_id);
                None
            }
        }
    }

    async fn leave_current(&mut self) {
        self.receiver = None;
        if let Some(room_id) = self.room_id.take() {
            if let Err(e) = self.rooms.leave(&room_id, self.participant_id).await {
                log::warn!("Leave of {room_id} by {} failed: {e}", self.participant_id);
            }
        }
    }
}

fn error_reply(e: impl Display) -> Vec<RelayMessage> {
    vec![RelayMessage::Error { message: e.to_string() }]
}

fn not_joined() -> Vec<RelayMessage> {
    error_reply("Join a room first")
}
