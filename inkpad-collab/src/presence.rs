//! Participant presence: identity, colors and remote cursors.
//!
//! ```text
//! server: ParticipantInfo::new(conn id) ──► Presence{participants}
//!                                                │
//! client: PresenceRoom ◄──── CursorMove{from, anchors}
//!            │
//!            └── resolve(anchors, engine) ──► absolute (start, end) | hidden
//! ```
//!
//! Cursor anchors are stored unresolved and resolved against the local
//! replica on demand, so a remote cursor keeps pointing at the same
//! characters while text changes around it.

use std::collections::HashMap;
use std::time::SystemTime;

use inkpad_core::{SelectionAnchors, TextEngine};
use uuid::Uuid;

use crate::protocol::ParticipantInfo;

/// Cursor color palette.
pub const PALETTE: [&str; 10] = [
    "#6366f1", "#8b5cf6", "#ec4899", "#f43f5e", "#f97316",
    "#eab308", "#22c55e", "#14b8a6", "#06b6d4", "#3b82f6",
];

pub const DEFAULT_AUTHOR_ID: &str = "anonymous";
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// Stable palette color for a key.
///
/// Rolling string hash `h = c + ((h << 5) - h)` over UTF-16 units, with
/// `h` kept as an f64 and only the shift done in 32-bit integer space.
/// The subtraction uses the untruncated hash, so `h` can grow past the
/// i32 range; the palette index is `|h| mod len`. Browser clients compute
/// the same colors.
pub fn color_for(key: &str) -> &'static str {
    let mut hash = 0f64;
    for unit in key.encode_utf16() {
        let shifted = f64::from(to_int32(hash).wrapping_shl(5));
        hash = f64::from(unit) + (shifted - hash);
    }
    PALETTE[(hash.abs() % PALETTE.len() as f64) as usize]
}

/// Wrap a float to a 32-bit signed integer, modulo 2^32.
fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    value.trunc().rem_euclid(4_294_967_296.0) as u32 as i32
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ParticipantInfo {
    /// Build a descriptor for a new connection, applying defaults.
    pub fn new(participant_id: Uuid, author_id: Option<String>, name: Option<String>) -> Self {
        let author_id = author_id
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AUTHOR_ID.to_string());
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());
        Self {
            participant_id,
            author_id,
            name,
            color: color_for(&participant_id.to_string()).to_string(),
            joined_at: now_millis(),
        }
    }
}

/// Client-side view of everyone else in the room.
pub struct PresenceRoom {
    local_id: Option<Uuid>,
    participants: Vec<ParticipantInfo>,
    cursors: HashMap<Uuid, SelectionAnchors>,
}

impl Default for PresenceRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self {
            local_id: None,
            participants: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    /// Set our own participant id; our own entries are filtered from views.
    pub fn set_local_id(&mut self, id: Uuid) {
        self.local_id = Some(id);
        self.cursors.remove(&id);
    }

    pub fn local_id(&self) -> Option<Uuid> {
        self.local_id
    }

    /// Replace the participant list. Cursors of departed participants are dropped.
    pub fn set_participants(&mut self, participants: Vec<ParticipantInfo>) {
        self.cursors
            .retain(|id, _| participants.iter().any(|p| p.participant_id == *id));
        self.participants = participants;
    }

    /// Drop a participant and their cursor.
    pub fn remove(&mut self, participant_id: Uuid) -> bool {
        let had_cursor = self.cursors.remove(&participant_id).is_some();
        let before = self.participants.len();
        self.participants.retain(|p| p.participant_id != participant_id);
        had_cursor || self.participants.len() != before
    }

    /// Record a remote cursor. Returns `false` for our own echo.
    pub fn set_cursor(&mut self, participant_id: Uuid, selection: SelectionAnchors) -> bool {
        if Some(participant_id) == self.local_id {
            return false;
        }
        self.cursors.insert(participant_id, selection);
        true
    }

    /// Everyone in the room, ourselves included.
    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    /// Participants other than ourselves.
    pub fn others(&self) -> impl Iterator<Item = &ParticipantInfo> {
        let local = self.local_id;
        self.participants
            .iter()
            .filter(move |p| Some(p.participant_id) != local)
    }

    pub fn participant(&self, participant_id: Uuid) -> Option<&ParticipantInfo> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    /// Resolve one remote cursor. `None` means hidden (context deleted or no cursor yet).
    pub fn resolve(&self, participant_id: Uuid, engine: &TextEngine) -> Option<(usize, usize)> {
        self.cursors
            .get(&participant_id)
            .and_then(|selection| selection.resolve(engine))
    }

    /// Resolve every known remote cursor.
    pub fn resolve_all(&self, engine: &TextEngine) -> Vec<(Uuid, Option<(usize, usize)>)> {
        let mut resolved: Vec<_> = self
            .cursors
            .iter()
            .map(|(id, selection)| (*id, selection.resolve(engine)))
            .collect();
        resolved.sort_by_key(|(id, _)| *id);
        resolved
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }
}
