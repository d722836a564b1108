//! Editor-side replica with change observers.
//!
//! Wraps a [`TextEngine`] and tags every mutation with where it came from.
//! Observers see every text change, but only local mutations produce
//! outgoing updates. That is what stops a remote update from being echoed
//! back to the relay.

use crate::anchor::SelectionAnchors;
use crate::diff::{diff, TextEdit};
use crate::engine::{IntegrationReport, TextEngine};
use crate::id::ReplicaId;
use crate::update::{EngineError, Update};

/// Where a mutation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrigin {
    /// Typed into this editor
    Local,
    /// Received from the relay
    Remote,
}

/// Receives replica change notifications.
pub trait ReplicaObserver: Send {
    /// Encoded update produced by a local mutation, ready to send.
    fn local_update(&mut self, update: &[u8]);

    /// The materialized text changed.
    fn text_changed(&mut self, _text: &str, _origin: MutationOrigin) {}
}

pub struct EditorReplica {
    engine: TextEngine,
    text: String,
    observers: Vec<Box<dyn ReplicaObserver>>,
}

impl Default for EditorReplica {
    fn default() -> Self {
        Self::new(TextEngine::default())
    }
}

impl EditorReplica {
    pub fn new(engine: TextEngine) -> Self {
        let text = engine.materialize();
        Self {
            engine,
            text,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Box<dyn ReplicaObserver>) {
        self.observers.push(observer);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn engine(&self) -> &TextEngine {
        &self.engine
    }

    /// Replace the editor's text, diffing against the current text.
    ///
    /// Returns the encoded update, or `None` when nothing changed.
    pub fn set_text(&mut self, new_text: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let edit = diff(&self.text, new_text);
        self.edit(&edit)
    }

    /// Apply a local edit.
    pub fn edit(&mut self, edit: &TextEdit) -> Result<Option<Vec<u8>>, EngineError> {
        if edit.is_noop() {
            return Ok(None);
        }
        let update = self.engine.apply_local_edit(edit);
        self.commit(update)
    }

    /// Local insert at a character offset.
    pub fn insert(&mut self, offset: usize, text: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let update = self.engine.insert(offset, text);
        self.commit(update)
    }

    /// Local delete at a character offset.
    pub fn delete(&mut self, offset: usize, len: usize) -> Result<Option<Vec<u8>>, EngineError> {
        let update = self.engine.delete(offset, len);
        self.commit(update)
    }

    /// Integrate an update received from the relay.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<IntegrationReport, EngineError> {
        let report = self.engine.apply_remote_update(bytes)?;
        if report.changed() {
            self.dispatch(MutationOrigin::Remote, None);
        }
        Ok(report)
    }

    /// Integrate a remote update while keeping a local selection stable.
    ///
    /// Both ends are captured as anchors before the update and resolved
    /// after it. An end whose neighbours were both deleted falls back to
    /// its old offset clamped to the new length.
    pub fn apply_remote_preserving_selection(
        &mut self,
        bytes: &[u8],
        selection: (usize, usize),
    ) -> Result<(usize, usize), EngineError> {
        let anchors = SelectionAnchors::capture(&self.engine, selection.0, selection.1);
        self.apply_remote(bytes)?;

        let len = self.engine.len();
        let start = crate::anchor::from_anchor(&self.engine, &anchors.start)
            .unwrap_or_else(|| selection.0.min(len));
        let end = crate::anchor::from_anchor(&self.engine, &anchors.end)
            .unwrap_or_else(|| selection.1.min(len));
        Ok((start.min(end), start.max(end)))
    }

    /// Replace the whole replica with one rebuilt from a snapshot.
    pub fn replace_with_snapshot(&mut self, snapshot: &[u8]) -> Result<(), EngineError> {
        self.engine = TextEngine::decode_full_state(ReplicaId::random(), snapshot)?;
        self.dispatch(MutationOrigin::Remote, None);
        Ok(())
    }

    fn commit(&mut self, update: Update) -> Result<Option<Vec<u8>>, EngineError> {
        if update.is_empty() {
            return Ok(None);
        }
        let bytes = update.encode()?;
        self.dispatch(MutationOrigin::Local, Some(&bytes));
        Ok(Some(bytes))
    }

    fn dispatch(&mut self, origin: MutationOrigin, update: Option<&[u8]>) {
        self.text = self.engine.materialize();
        for observer in self.observers.iter_mut() {
            if let (MutationOrigin::Local, Some(bytes)) = (origin, update) {
                observer.local_update(bytes);
            }
            observer.text_changed(&self.text, origin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        outgoing: Vec<Vec<u8>>,
        changes: Vec<(String, MutationOrigin)>,
    }

    struct Recorder(Arc<Mutex<Recorded>>);

    impl ReplicaObserver for Recorder {
        fn local_update(&mut self, update: &[u8]) {
            self.0.lock().unwrap().outgoing.push(update.to_vec());
        }

        fn text_changed(&mut self, text: &str, origin: MutationOrigin) {
            self.0.lock().unwrap().changes.push((text.to_string(), origin));
        }
    }

    fn observed(replica: u64) -> (EditorReplica, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let mut replica = EditorReplica::new(TextEngine::new(ReplicaId::from_u64(replica)));
        replica.subscribe(Box::new(Recorder(log.clone())));
        (replica, log)
    }

    #[test]
    fn test_local_edit_emits_update() {
        let (mut replica, log) = observed(1);
        let update = replica.set_text("hello").unwrap();
        assert!(update.is_some());
        assert_eq!(replica.text(), "hello");

        let log = log.lock().unwrap();
        assert_eq!(log.outgoing.len(), 1);
        assert_eq!(log.changes, vec![("hello".to_string(), MutationOrigin::Local)]);
    }

    #[test]
    fn test_unchanged_text_emits_nothing() {
        let (mut replica, log) = observed(1);
        replica.set_text("same").unwrap();
        assert!(replica.set_text("same").unwrap().is_none());
        assert_eq!(log.lock().unwrap().outgoing.len(), 1);
    }

    #[test]
    fn test_remote_update_is_not_echoed() {
        let (mut a, _) = observed(1);
        let (mut b, b_log) = observed(2);
        let update = a.set_text("from a").unwrap().unwrap();

        b.apply_remote(&update).unwrap();
        assert_eq!(b.text(), "from a");

        let log = b_log.lock().unwrap();
        assert!(log.outgoing.is_empty());
        assert_eq!(log.changes, vec![("from a".to_string(), MutationOrigin::Remote)]);
    }

    #[test]
    fn test_duplicate_remote_update_is_silent() {
        let (mut a, _) = observed(1);
        let (mut b, b_log) = observed(2);
        let update = a.set_text("x").unwrap().unwrap();
        b.apply_remote(&update).unwrap();
        b.apply_remote(&update).unwrap();
        assert_eq!(b_log.lock().unwrap().changes.len(), 1);
    }

    #[test]
    fn test_selection_preserved_across_remote_insert() {
        let (mut a, _) = observed(1);
        let (mut b, _) = observed(2);
        let base = a.set_text("hello world").unwrap().unwrap();
        b.apply_remote(&base).unwrap();

        let prefix = a.insert(0, ">> ").unwrap().unwrap();
        let selection = b.apply_remote_preserving_selection(&prefix, (6, 11)).unwrap();
        assert_eq!(selection, (9, 14));
        assert_eq!(&b.text()[9..14], "world");
    }

    #[test]
    fn test_selection_clamped_when_anchors_vanish() {
        let (mut a, _) = observed(1);
        let (mut b, _) = observed(2);
        let base = a.set_text("abcdef").unwrap().unwrap();
        b.apply_remote(&base).unwrap();

        let wipe = a.delete(1, 4).unwrap().unwrap();
        let selection = b.apply_remote_preserving_selection(&wipe, (3, 3)).unwrap();
        assert_eq!(b.text(), "af");
        assert_eq!(selection, (2, 2));
    }

    #[test]
    fn test_malformed_remote_update_rejected() {
        let (mut replica, log) = observed(1);
        replica.set_text("intact").unwrap();
        assert!(replica.apply_remote(b"garbage").is_err());
        assert_eq!(replica.text(), "intact");
        assert_eq!(log.lock().unwrap().changes.len(), 1);
    }

    #[test]
    fn test_replace_with_snapshot() {
        let (mut a, _) = observed(1);
        a.set_text("snapshot text").unwrap();
        let snapshot = a.engine().encode_full_state().unwrap();

        let (mut b, b_log) = observed(2);
        b.replace_with_snapshot(&snapshot).unwrap();
        assert_eq!(b.text(), "snapshot text");
        assert!(b_log.lock().unwrap().outgoing.is_empty());
    }
}
