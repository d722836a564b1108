//! Position translation.
//!
//! A plain offset goes stale as soon as a concurrent edit lands before it.
//! An [`Anchor`] instead names the characters on either side of the caret
//! by id, and is resolved back to an offset against whatever the text looks
//! like later.
//!
//! ```text
//!   "ab|cd"   →  Anchor { left: id('b'), right: id('c') }
//!   "XYab|cd" →  offset of id('c') = 4
//! ```

use serde::{Deserialize, Serialize};

use crate::engine::TextEngine;
use crate::id::ItemId;

/// Caret position relative to its neighbouring characters.
///
/// `None` on a side means the caret was at that end of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub left: Option<ItemId>,
    pub right: Option<ItemId>,
}

/// Capture a stable anchor for `offset` (clamped to the text length).
pub fn to_anchor(engine: &TextEngine, offset: usize) -> Anchor {
    let offset = offset.min(engine.len());
    Anchor {
        left: offset.checked_sub(1).and_then(|o| engine.id_at(o)),
        right: engine.id_at(offset),
    }
}

/// Resolve an anchor to a current offset.
///
/// Prefers the right neighbour, falls back to just after the left one.
/// Returns `None` when both neighbours have been deleted (or are unknown
/// to this replica); the caller decides where the caret goes then.
pub fn from_anchor(engine: &TextEngine, anchor: &Anchor) -> Option<usize> {
    if let Some(offset) = anchor.right.and_then(|id| engine.offset_of(id)) {
        return Some(offset);
    }
    if let Some(offset) = anchor.left.and_then(|id| engine.offset_of(id)) {
        return Some(offset + 1);
    }
    match (anchor.left, anchor.right) {
        (_, None) => Some(engine.len()),
        (None, _) => Some(0),
        _ => None,
    }
}

/// A selection expressed as two anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionAnchors {
    pub start: Anchor,
    pub end: Anchor,
}

impl SelectionAnchors {
    pub fn capture(engine: &TextEngine, start: usize, end: usize) -> Self {
        Self {
            start: to_anchor(engine, start),
            end: to_anchor(engine, end),
        }
    }

    /// Resolve both ends. The result is ordered (`start <= end`).
    pub fn resolve(&self, engine: &TextEngine) -> Option<(usize, usize)> {
        let start = from_anchor(engine, &self.start)?;
        let end = from_anchor(engine, &self.end)?;
        Some((start.min(end), start.max(end)))
    }
}
