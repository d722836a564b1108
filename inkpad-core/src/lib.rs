//! # inkpad-core
//!
//! Replicated text engine for collaborative editing.
//!
//! ```text
//! ┌──────────────────┐   set_text()   ┌──────────────┐  encode()  ┌────────┐
//! │   Editor text    │ ─────────────► │  TextEngine  │ ─────────► │ Update │ ──► relay
//! │ (EditorReplica)  │ ◄───────────── │  (RGA items) │ ◄───────── │ bytes  │ ◄── relay
//! └──────────────────┘  text_changed  └──────────────┘  apply()   └────────┘
//!          │                                 ▲
//!          └── Anchor / SelectionAnchors ────┘  (offsets that survive remote edits)
//! ```
//!
//! - [`TextEngine`]: the sequence CRDT. Commutative, idempotent merges.
//! - [`Update`]: binary batch of operations; also the snapshot format.
//! - [`diff`]: single-span differencer for whole-text editor changes.
//! - [`Anchor`]: position translation across concurrent edits.
//! - [`EditorReplica`]: engine plus change observers with origin tagging.

pub mod anchor;
pub mod diff;
pub mod engine;
pub mod id;
pub mod replica;
mod sequence;
pub mod update;

pub use anchor::{from_anchor, to_anchor, Anchor, SelectionAnchors};
pub use diff::{diff, TextEdit};
pub use engine::{IntegrationReport, TextEngine};
pub use id::{ItemId, ReplicaId, MAX_COUNTER};
pub use replica::{EditorReplica, MutationOrigin, ReplicaObserver};
pub use update::{EngineError, Op, Update};
