//! Replicated text sequence.
//!
//! An RGA-style sequence CRDT: every character is an item carrying a unique
//! [`ItemId`] and the id of the character it was inserted after (its
//! *origin*). Deleted characters stay in place as tombstones so that later
//! operations can still refer to them.
//!
//! ```text
//!   origin ──► [ c (5@B) ][ b (4@A) ][ a (2@A) ] ...
//!                 ▲ newer siblings sort first (higher Lamport id)
//! ```
//!
//! Integration rule: place a new item directly after its origin, then skip
//! right past every item with a greater id. Because a child's counter is
//! always greater than its origin's, this visits exactly the newer siblings
//! and their descendants, which gives the same order on every replica no
//! matter which order operations arrive in.
//!
//! Operations whose dependency (origin of an insert, target of a delete) is
//! not known yet are parked and retried whenever new items are integrated.

use crate::diff::TextEdit;
use crate::id::{ItemId, ReplicaId, MAX_COUNTER};
use crate::sequence::{Item, Pos, Sequence};
use crate::update::{EngineError, Op, Update};

/// Outcome of integrating an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationReport {
    /// Characters newly inserted
    pub inserted: usize,
    /// Characters newly tombstoned
    pub deleted: usize,
    /// Operations still waiting for a dependency after this update
    pub parked: usize,
}

impl IntegrationReport {
    /// Whether the materialized text changed.
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.deleted > 0
    }
}

/// Run of consecutive items that can be encoded as one insert.
struct InsertRun {
    id: ItemId,
    origin: Option<ItemId>,
    text: String,
    len: u64,
}

impl InsertRun {
    fn start(item: &Item) -> Self {
        Self {
            id: item.id,
            origin: item.origin,
            text: item.ch.to_string(),
            len: 1,
        }
    }

    fn extends(&self, item: &Item) -> bool {
        let last = self.id.offset(self.len - 1);
        item.id == self.id.offset(self.len) && item.origin == Some(last)
    }

    fn push(&mut self, ch: char) {
        self.text.push(ch);
        self.len += 1;
    }

    fn into_op(self) -> Op {
        Op::Insert {
            id: self.id,
            origin: self.origin,
            text: self.text,
        }
    }
}

/// Collects consecutive ids into `Delete` runs.
#[derive(Default)]
struct DeleteRuns {
    run: Option<(ItemId, u64)>,
}

impl DeleteRuns {
    fn push(&mut self, id: ItemId, update: &mut Update) {
        self.run = match self.run.take() {
            Some((first, n)) if id == first.offset(n) => Some((first, n + 1)),
            Some((target, len)) => {
                update.push(Op::Delete { target, len });
                Some((id, 1))
            }
            None => Some((id, 1)),
        };
    }

    fn finish(self, update: &mut Update) {
        if let Some((target, len)) = self.run {
            update.push(Op::Delete { target, len });
        }
    }
}

/// A single replica of the shared text.
#[derive(Debug, Clone)]
pub struct TextEngine {
    replica: ReplicaId,
    /// Highest Lamport counter integrated so far
    clock: u64,
    /// All items in document order, tombstones included
    items: Sequence,
    /// Operations waiting for a missing dependency
    pending: Vec<Op>,
}

impl Default for TextEngine {
    fn default() -> Self {
        Self::new(ReplicaId::random())
    }
}

impl TextEngine {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            items: Sequence::default(),
            pending: Vec::new(),
        }
    }

    /// Create a replica seeded with `text` as a local insert.
    pub fn from_text(replica: ReplicaId, text: &str) -> Self {
        let mut engine = Self::new(replica);
        engine.insert(0, text);
        engine
    }

    /// Rebuild a replica from a full-state snapshot.
    ///
    /// `replica` must be fresh: a replica id is never shared between two
    /// engines that edit independently.
    pub fn decode_full_state(replica: ReplicaId, snapshot: &[u8]) -> Result<Self, EngineError> {
        let update = Update::decode(snapshot)?;
        let mut engine = Self::new(replica);
        engine.apply_update(&update);
        Ok(engine)
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Highest Lamport counter seen.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.items.visible()
    }

    pub fn is_empty(&self) -> bool {
        self.items.visible() == 0
    }

    /// Number of operations parked on missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether an item with this id has been integrated (deleted or not).
    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains(id)
    }

    /// Whether an item with this id has been integrated and tombstoned.
    pub fn is_deleted(&self, id: ItemId) -> bool {
        self.items
            .find(id)
            .and_then(|pos| self.items.get(pos))
            .is_some_and(|item| item.deleted)
    }

    /// The current text.
    pub fn materialize(&self) -> String {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.ch)
            .collect()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Insert `text` at a character offset (clamped to the text length).
    ///
    /// Returns an empty update, leaving the text untouched, if the run would
    /// push this replica's counter past [`MAX_COUNTER`].
    pub fn insert(&mut self, offset: usize, text: &str) -> Update {
        if text.is_empty() {
            return Update::new();
        }
        let len = text.chars().count() as u64;
        if self.clock.checked_add(len).filter(|&last| last <= MAX_COUNTER).is_none() {
            log::error!(
                "Replica {} counter exhausted at {}, dropping {len}-char insert",
                self.replica,
                self.clock
            );
            return Update::new();
        }

        let offset = offset.min(self.len());
        let hint = offset.checked_sub(1).and_then(|o| self.items.nth_visible(o));
        let origin = hint.and_then(|pos| self.items.get(pos)).map(|item| item.id);
        let id = ItemId::new(self.replica, self.clock + 1);
        let mut report = IntegrationReport::default();
        self.integrate_insert(id, origin, text, hint, &mut report);
        Update::from_ops(vec![Op::Insert {
            id,
            origin,
            text: text.to_owned(),
        }])
    }

    /// Delete `len` characters starting at a character offset.
    pub fn delete(&mut self, offset: usize, len: usize) -> Update {
        let start = offset.min(self.len());
        let end = start.saturating_add(len).min(self.len());
        let mut update = Update::new();
        let Some(mut pos) = self.items.nth_visible(start).filter(|_| start < end) else {
            return update;
        };

        let mut runs = DeleteRuns::default();
        let mut remaining = end - start;
        while remaining > 0 {
            let Some(item) = self.items.get(pos) else {
                break;
            };
            let id = item.id;
            if self.items.delete(pos) {
                runs.push(id, &mut update);
                remaining -= 1;
            }
            pos = self.items.after(pos);
        }
        runs.finish(&mut update);
        update
    }

    /// Apply a differencer edit: delete the replaced span, then insert.
    pub fn apply_local_edit(&mut self, edit: &TextEdit) -> Update {
        let mut update = self.delete(edit.retain, edit.delete);
        update.extend(self.insert(edit.retain, &edit.insert));
        update
    }

    // ─── Remote updates ───────────────────────────────────────────────

    /// Decode and integrate a binary update.
    ///
    /// A malformed payload is rejected before any state is touched.
    /// Re-applying a known update is a no-op.
    pub fn apply_remote_update(&mut self, bytes: &[u8]) -> Result<IntegrationReport, EngineError> {
        let update = Update::decode(bytes)?;
        Ok(self.apply_update(&update))
    }

    /// Integrate an already-decoded update.
    pub fn apply_update(&mut self, update: &Update) -> IntegrationReport {
        let mut report = IntegrationReport::default();
        for op in update.ops() {
            self.integrate(op, &mut report);
        }
        if report.inserted > 0 && !self.pending.is_empty() {
            self.retry_pending(&mut report);
        }
        report.parked = self.pending.len();
        if report.parked > 0 {
            log::trace!("{} ops parked on missing dependencies", report.parked);
        }
        report
    }

    /// Full state as an update: every item (tombstones included) plus any
    /// parked operations. Applying it to an empty engine reproduces this one;
    /// applying it to an existing replica merges.
    pub fn full_state(&self) -> Update {
        self.state_ops(None)
    }

    /// What `other` is missing from this replica: items it has never seen,
    /// tombstones it has not applied, and every parked operation.
    ///
    /// Applying the result to `other` brings it up to date with this replica.
    pub fn delta_for(&self, other: &TextEngine) -> Update {
        self.state_ops(Some(other))
    }

    /// Binary full-state snapshot.
    pub fn encode_full_state(&self) -> Result<Vec<u8>, EngineError> {
        self.full_state().encode()
    }

    fn state_ops(&self, other: Option<&TextEngine>) -> Update {
        let mut update = Update::new();

        let mut run: Option<InsertRun> = None;
        let missing = self
            .items
            .iter()
            .filter(|item| other.map_or(true, |other| !other.contains(item.id)));
        for item in missing {
            match run.as_mut() {
                Some(current) if current.extends(item) => current.push(item.ch),
                _ => {
                    if let Some(done) = run.replace(InsertRun::start(item)) {
                        update.push(done.into_op());
                    }
                }
            }
        }
        if let Some(done) = run {
            update.push(done.into_op());
        }

        let mut tombstones = DeleteRuns::default();
        let unapplied = self
            .items
            .iter()
            .filter(|item| item.deleted)
            .filter(|item| other.map_or(true, |other| !other.is_deleted(item.id)));
        for item in unapplied {
            tombstones.push(item.id, &mut update);
        }
        tombstones.finish(&mut update);

        for op in &self.pending {
            update.push(op.clone());
        }
        update
    }

    // ─── Offsets and ids ──────────────────────────────────────────────

    /// Id of the visible character at `offset`.
    pub fn id_at(&self, offset: usize) -> Option<ItemId> {
        self.items
            .nth_visible(offset)
            .and_then(|pos| self.items.get(pos))
            .map(|item| item.id)
    }

    /// Visible offset of an item, or `None` if it is deleted or unknown.
    pub fn offset_of(&self, id: ItemId) -> Option<usize> {
        let pos = self.items.find(id)?;
        let item = self.items.get(pos)?;
        (!item.deleted).then(|| self.items.visible_before(pos))
    }

    // ─── Integration ──────────────────────────────────────────────────

    /// Integrate one op. Returns `true` if any part of it was resolved.
    fn integrate(&mut self, op: &Op, report: &mut IntegrationReport) -> bool {
        match op {
            Op::Insert { id, origin, text } => {
                if let Some(origin) = origin {
                    if !self.items.contains(*origin) {
                        self.park(op.clone());
                        return false;
                    }
                }
                self.integrate_insert(*id, *origin, text, None, report);
                true
            }
            Op::Delete { target, len } => self.integrate_delete(*target, *len, report),
        }
    }

    fn integrate_insert(
        &mut self,
        id: ItemId,
        origin: Option<ItemId>,
        text: &str,
        mut hint: Option<Pos>,
        report: &mut IntegrationReport,
    ) {
        let mut left = origin;
        for (k, ch) in text.chars().enumerate() {
            let char_id = id.offset(k as u64);
            if self.items.contains(char_id) {
                left = Some(char_id);
                hint = None;
                continue;
            }
            let pos = self.insert_position(left, char_id, hint);
            let placed = self.items.insert(
                pos,
                Item {
                    id: char_id,
                    origin: left,
                    ch,
                    deleted: false,
                },
            );
            self.clock = self.clock.max(char_id.counter);
            report.inserted += 1;
            left = Some(char_id);
            hint = Some(placed);
        }
    }

    /// `hint`, if given, is where the origin is expected to sit.
    fn insert_position(&self, origin: Option<ItemId>, id: ItemId, hint: Option<Pos>) -> Pos {
        let mut pos = match origin {
            None => self.items.start(),
            Some(origin) => {
                let at_hint = hint.filter(|&h| self.items.get(h).is_some_and(|it| it.id == origin));
                match at_hint.or_else(|| self.items.find(origin)) {
                    Some(found) => self.items.after(found),
                    None => self.items.end(),
                }
            }
        };
        while self.items.get(pos).is_some_and(|item| item.id > id) {
            pos = self.items.after(pos);
        }
        pos
    }

    fn integrate_delete(&mut self, target: ItemId, len: u64, report: &mut IntegrationReport) -> bool {
        let end = target.counter.saturating_add(len);
        let found = self.items.counters_in(target.replica, target.counter, end);
        for &counter in &found {
            let id = ItemId::new(target.replica, counter);
            if let Some(pos) = self.items.find(id) {
                if self.items.delete(pos) {
                    report.deleted += 1;
                }
            }
        }

        if found.len() as u64 != len {
            let mut next = target.counter;
            for &counter in &found {
                if counter > next {
                    self.park_delete(ItemId::new(target.replica, next), counter - next);
                }
                next = counter + 1;
            }
            if next < end {
                self.park_delete(ItemId::new(target.replica, next), end - next);
            }
        }
        !found.is_empty()
    }

    fn park_delete(&mut self, target: ItemId, len: u64) {
        self.park(Op::Delete { target, len });
    }

    fn park(&mut self, op: Op) {
        if !self.pending.contains(&op) {
            self.pending.push(op);
        }
    }

    fn retry_pending(&mut self, report: &mut IntegrationReport) {
        while !self.pending.is_empty() {
            let parked = std::mem::take(&mut self.pending);
            let mut progressed = false;
            for op in &parked {
                if self.integrate(op, report) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(replica: u64) -> TextEngine {
        TextEngine::new(ReplicaId::from_u64(replica))
    }

    #[test]
    fn test_local_insert_and_delete() {
        let mut doc = engine(1);
        doc.insert(0, "hello");
        doc.insert(5, " world");
        assert_eq!(doc.materialize(), "hello world");
        assert_eq!(doc.len(), 11);

        doc.delete(0, 6);
        assert_eq!(doc.materialize(), "world");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_insert_clamps_offset() {
        let mut doc = engine(1);
        doc.insert(0, "ab");
        doc.insert(99, "c");
        assert_eq!(doc.materialize(), "abc");
    }

    #[test]
    fn test_delete_out_of_range_is_empty() {
        let mut doc = engine(1);
        doc.insert(0, "ab");
        assert!(doc.delete(5, 3).is_empty());
        assert!(doc.delete(1, 0).is_empty());
        assert_eq!(doc.materialize(), "ab");
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let mut doc = engine(1);
        doc.insert(0, "héllo");
        doc.insert(2, "✓");
        assert_eq!(doc.materialize(), "hé✓llo");
        doc.delete(1, 2);
        assert_eq!(doc.materialize(), "hllo");
    }

    #[test]
    fn test_remote_apply_matches_local() {
        let mut a = engine(1);
        let mut b = engine(2);

        let u1 = a.insert(0, "hello").encode().unwrap();
        let u2 = a.insert(5, "!").encode().unwrap();
        let u3 = a.delete(0, 1).encode().unwrap();

        for u in [&u1, &u2, &u3] {
            b.apply_remote_update(u).unwrap();
        }
        assert_eq!(b.materialize(), "ello!");
        assert_eq!(a.materialize(), b.materialize());
    }

    #[test]
    fn test_concurrent_inserts_same_position_converge() {
        let mut a = engine(1);
        let mut b = engine(2);
        let ua = a.insert(0, "a").encode().unwrap();
        let ub = b.insert(0, "b").encode().unwrap();

        a.apply_remote_update(&ub).unwrap();
        b.apply_remote_update(&ua).unwrap();
        assert_eq!(a.materialize(), b.materialize());
        // Equal counters: the higher replica id sorts first.
        assert_eq!(a.materialize(), "ba");
    }

    #[test]
    fn test_local_insert_after_remote_goes_after_origin() {
        let mut a = engine(1);
        let mut b = engine(2);
        let base = a.insert(0, "xy").encode().unwrap();
        b.apply_remote_update(&base).unwrap();

        b.insert(1, "Q");
        assert_eq!(b.materialize(), "xQy");
        assert!(b.clock() > a.clock());
    }

    #[test]
    fn test_duplicate_update_is_noop() {
        let mut a = engine(1);
        let mut b = engine(2);
        let u = a.insert(0, "abc").encode().unwrap();

        let first = b.apply_remote_update(&u).unwrap();
        let second = b.apply_remote_update(&u).unwrap();
        assert_eq!(first.inserted, 3);
        assert!(!second.changed());
        assert_eq!(b.materialize(), "abc");
    }

    #[test]
    fn test_concurrent_delete_same_char_is_noop() {
        let mut a = engine(1);
        let mut b = engine(2);
        let base = a.insert(0, "abc").encode().unwrap();
        b.apply_remote_update(&base).unwrap();

        let da = a.delete(1, 1).encode().unwrap();
        let db = b.delete(1, 1).encode().unwrap();
        let ra = a.apply_remote_update(&db).unwrap();
        let rb = b.apply_remote_update(&da).unwrap();
        assert_eq!(ra.deleted, 0);
        assert_eq!(rb.deleted, 0);
        assert_eq!(a.materialize(), "ac");
        assert_eq!(b.materialize(), "ac");
    }

    #[test]
    fn test_out_of_order_delivery_is_parked() {
        let mut a = engine(1);
        let mut b = engine(2);
        let u1 = a.insert(0, "ab").encode().unwrap();
        let u2 = a.insert(2, "cd").encode().unwrap();
        let u3 = a.delete(0, 1).encode().unwrap();

        let r = b.apply_remote_update(&u3).unwrap();
        assert_eq!(r.parked, 1);
        let r = b.apply_remote_update(&u2).unwrap();
        assert_eq!(r.parked, 2);
        assert_eq!(b.materialize(), "");

        let r = b.apply_remote_update(&u1).unwrap();
        assert_eq!(r.parked, 0);
        assert_eq!(b.materialize(), "bcd");
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_partial_delete_parks_missing_gap() {
        let mut a = engine(1);
        let mut b = engine(2);
        let u1 = a.insert(0, "ab").encode().unwrap();
        let u2 = a.insert(2, "cd").encode().unwrap();
        let del = a.delete(0, 4).encode().unwrap();

        b.apply_remote_update(&u1).unwrap();
        let r = b.apply_remote_update(&del).unwrap();
        assert_eq!(r.deleted, 2);
        assert_eq!(r.parked, 1);

        b.apply_remote_update(&u2).unwrap();
        assert_eq!(b.materialize(), "");
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_malformed_update_leaves_state_untouched() {
        let mut doc = engine(1);
        doc.insert(0, "keep");
        let before = doc.encode_full_state().unwrap();

        assert!(doc.apply_remote_update(b"IK\x01\xFF\xFF\xFF").is_err());
        assert!(doc.apply_remote_update(b"not an update").is_err());
        assert_eq!(doc.materialize(), "keep");
        assert_eq!(doc.encode_full_state().unwrap(), before);
    }

    #[test]
    fn test_snapshot_roundtrip_with_tombstones() {
        let mut a = engine(1);
        a.insert(0, "hello world");
        a.delete(5, 6);
        a.insert(5, ", there");

        let snapshot = a.encode_full_state().unwrap();
        let b = TextEngine::decode_full_state(ReplicaId::from_u64(2), &snapshot).unwrap();
        assert_eq!(b.materialize(), "hello, there");
        assert_eq!(b.clock(), a.clock());
        assert_eq!(b.replica(), ReplicaId::from_u64(2));
    }

    #[test]
    fn test_snapshot_replica_accepts_later_updates() {
        let mut a = engine(1);
        a.insert(0, "abc");
        let snapshot = a.encode_full_state().unwrap();
        let mut b = TextEngine::decode_full_state(ReplicaId::from_u64(2), &snapshot).unwrap();

        let del = a.delete(1, 1).encode().unwrap();
        let ins = b.insert(3, "d").encode().unwrap();
        b.apply_remote_update(&del).unwrap();
        a.apply_remote_update(&ins).unwrap();
        assert_eq!(a.materialize(), "acd");
        assert_eq!(b.materialize(), "acd");
    }

    #[test]
    fn test_snapshot_merges_into_existing_replica() {
        let mut a = engine(1);
        let mut b = engine(2);
        let base = a.insert(0, "shared").encode().unwrap();
        b.apply_remote_update(&base).unwrap();

        a.insert(6, " A");
        b.insert(0, "B ");

        let snapshot = a.encode_full_state().unwrap();
        b.apply_remote_update(&snapshot).unwrap();
        let b_update = b.encode_full_state().unwrap();
        a.apply_remote_update(&b_update).unwrap();
        assert_eq!(a.materialize(), "B shared A");
        assert_eq!(b.materialize(), a.materialize());
    }

    #[test]
    fn test_snapshot_keeps_parked_ops() {
        let mut a = engine(1);
        let mut b = engine(2);
        let u1 = a.insert(0, "x").encode().unwrap();
        let u2 = a.insert(1, "y").encode().unwrap();
        b.apply_remote_update(&u2).unwrap();

        let snapshot = b.encode_full_state().unwrap();
        let mut c = TextEngine::decode_full_state(ReplicaId::from_u64(3), &snapshot).unwrap();
        assert_eq!(c.pending_len(), 1);
        c.apply_remote_update(&u1).unwrap();
        assert_eq!(c.materialize(), "xy");
    }

    #[test]
    fn test_apply_local_edit() {
        let mut doc = engine(1);
        doc.insert(0, "hello world");
        let edit = TextEdit {
            retain: 6,
            delete: 5,
            insert: "there".into(),
        };
        let update = doc.apply_local_edit(&edit);
        assert_eq!(doc.materialize(), "hello there");
        assert_eq!(update.ops().len(), 2);
    }

    #[test]
    fn test_id_and_offset_lookup() {
        let mut doc = engine(1);
        doc.insert(0, "abc");
        let b = doc.id_at(1).unwrap();
        assert_eq!(doc.offset_of(b), Some(1));
        doc.delete(1, 1);
        assert_eq!(doc.offset_of(b), None);
        assert!(doc.contains(b));
        assert_eq!(doc.id_at(5), None);
    }

    #[test]
    fn test_from_text() {
        let doc = TextEngine::from_text(ReplicaId::from_u64(9), "seed");
        assert_eq!(doc.materialize(), "seed");
        assert_eq!(doc.clock(), 4);
    }

    #[test]
    fn test_counter_near_cap_rejected_and_local_insert_stops() {
        let mut doc = engine(1);
        doc.insert(0, "a");

        let wrap = Update::from_ops(vec![Op::Insert {
            id: ItemId::new(ReplicaId::from_u64(7), u64::MAX - 1),
            origin: None,
            text: "z".into(),
        }]);
        assert!(matches!(
            doc.apply_remote_update(&wrap.encode().unwrap()),
            Err(EngineError::MalformedUpdate(_))
        ));

        let at_cap = Update::from_ops(vec![Op::Insert {
            id: ItemId::new(ReplicaId::from_u64(7), MAX_COUNTER),
            origin: None,
            text: "z".into(),
        }]);
        doc.apply_remote_update(&at_cap.encode().unwrap()).unwrap();
        assert_eq!(doc.clock(), MAX_COUNTER);

        let update = doc.insert(1, "ab");
        assert!(update.is_empty());
        assert_eq!(doc.materialize(), "za");
        // Deletes need no new counters.
        assert!(!doc.delete(0, 1).is_empty());
        assert_eq!(doc.materialize(), "a");
    }

    #[test]
    fn test_delta_for_carries_only_missing_state() {
        let mut server = engine(1);
        let base = server.insert(0, "base").encode().unwrap();
        let mut client = engine(2);
        client.apply_remote_update(&base).unwrap();

        client.insert(4, "!");
        client.delete(0, 1);
        let delta = client.delta_for(&server);
        assert_eq!(delta.ops().len(), 2);

        server.apply_update(&delta);
        assert_eq!(server.materialize(), "ase!");
        assert!(client.delta_for(&server).is_empty());
        assert!(server.is_deleted(ItemId::new(ReplicaId::from_u64(1), 1)));
    }

    #[test]
    fn test_delta_for_includes_parked_ops() {
        let mut a = engine(1);
        let mut b = engine(2);
        a.insert(0, "x");
        let u2 = a.insert(1, "y").encode().unwrap();
        b.apply_remote_update(&u2).unwrap();
        assert_eq!(b.delta_for(&a).ops().len(), 1);
    }

    #[test]
    fn test_large_document_matches_string_model() {
        let mut doc = engine(1);
        let mut model: Vec<char> = Vec::new();
        let mut seed = 0x2545_f491_u64;
        for step in 0..3000u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let offset = (seed % (model.len() as u64 + 1)) as usize;
            if step % 5 == 4 && !model.is_empty() {
                let len = ((seed >> 20) % 4) as usize + 1;
                let at = offset.min(model.len() - 1);
                let end = (at + len).min(model.len());
                doc.delete(at, len);
                model.drain(at..end);
            } else {
                let ch = char::from(b'a' + (seed % 26) as u8);
                let text: String = std::iter::repeat(ch).take(((seed >> 8) % 3) as usize + 1).collect();
                doc.insert(offset, &text);
                for (k, c) in text.chars().enumerate() {
                    model.insert(offset + k, c);
                }
            }
        }
        let expected: String = model.iter().collect();
        assert_eq!(doc.materialize(), expected);
        assert_eq!(doc.len(), model.len());

        for offset in (0..model.len()).step_by(97) {
            let id = doc.id_at(offset).unwrap();
            assert_eq!(doc.offset_of(id), Some(offset));
        }

        let copy = TextEngine::decode_full_state(ReplicaId::from_u64(2), &doc.encode_full_state().unwrap()).unwrap();
        assert_eq!(copy.materialize(), expected);
    }
}
