//! Binary update format.
//!
//! Wire format:
//! ```text
//! ┌────────┬─────────┬──────────────────────────────┐
//! │ magic  │ version │ bincode(Vec<Op>)             │
//! │ 2 bytes│ 1 byte  │ variable                     │
//! └────────┴─────────┴──────────────────────────────┘
//! ```
//!
//! The same format carries incremental updates and full snapshots: a
//! snapshot is simply an update that inserts (and tombstones) every item a
//! replica knows about.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ItemId, MAX_COUNTER};

const UPDATE_MAGIC: [u8; 2] = *b"IK";
const UPDATE_VERSION: u8 = 1;
const HEADER_LEN: usize = 3;

/// Upper bound on a single decoded update, guards against hostile length prefixes.
const MAX_UPDATE_BYTES: usize = 64 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_UPDATE_BYTES>()
}

/// A single replicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Insert a run of characters. Character `k` of `text` gets id
    /// `id.offset(k)`; its origin is the previous character of the run, and
    /// the first character's origin is `origin` (`None` = document start).
    Insert {
        id: ItemId,
        origin: Option<ItemId>,
        text: String,
    },
    /// Tombstone `len` items with consecutive ids starting at `target`.
    Delete { target: ItemId, len: u64 },
}

impl Op {
    /// Structural validation, run before any op touches an engine.
    fn validate(&self) -> Result<(), EngineError> {
        match self {
            Op::Insert { id, origin, text } => {
                let len = text.chars().count() as u64;
                if len == 0 {
                    return Err(EngineError::MalformedUpdate("empty insert".into()));
                }
                if !counters_in_range(id.counter, len) {
                    return Err(EngineError::MalformedUpdate(format!(
                        "insert id {id} out of range"
                    )));
                }
                if let Some(origin) = origin {
                    // An origin is always observed before the insert that names it.
                    if origin.counter == 0 || origin.counter >= id.counter {
                        return Err(EngineError::MalformedUpdate(format!(
                            "insert {id} has non-causal origin {origin}"
                        )));
                    }
                }
                Ok(())
            }
            Op::Delete { target, len } => {
                if *len == 0 {
                    return Err(EngineError::MalformedUpdate("empty delete".into()));
                }
                if !counters_in_range(target.counter, *len) {
                    return Err(EngineError::MalformedUpdate(format!(
                        "delete target {target} out of range"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Whether a run of `len` ids starting at `first` stays within `1..=MAX_COUNTER`.
fn counters_in_range(first: u64, len: u64) -> bool {
    first != 0
        && first
            .checked_add(len - 1)
            .is_some_and(|last| last <= MAX_COUNTER)
}

/// An immutable batch of operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Update {
    ops: Vec<Op>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_ops(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub(crate) fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub(crate) fn extend(&mut self, other: Update) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let body = bincode::serde::encode_to_vec(&self.ops, wire_config())
            .map_err(|e| EngineError::Encoding(e.to_string()))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&UPDATE_MAGIC);
        bytes.push(UPDATE_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Parse and validate an update.
    ///
    /// Either every op is well-formed and the whole update is returned, or
    /// an error is returned and nothing has been applied anywhere.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() < HEADER_LEN || bytes[..2] != UPDATE_MAGIC {
            return Err(EngineError::MalformedUpdate("missing update header".into()));
        }
        if bytes[2] != UPDATE_VERSION {
            return Err(EngineError::UnsupportedVersion(bytes[2]));
        }
        let (ops, read): (Vec<Op>, usize) =
            bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], wire_config())
                .map_err(|e| EngineError::MalformedUpdate(e.to_string()))?;
        if read != bytes.len() - HEADER_LEN {
            return Err(EngineError::MalformedUpdate(format!(
                "{} trailing bytes",
                bytes.len() - HEADER_LEN - read
            )));
        }
        for op in &ops {
            op.validate()?;
        }
        Ok(Self { ops })
    }
}

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Payload is not a well-formed update
    MalformedUpdate(String),
    /// Header names a format version this build cannot read
    UnsupportedVersion(u8),
    /// Serialization failed
    Encoding(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
            Self::UnsupportedVersion(v) => write!(f, "Unsupported update version: {v}"),
            Self::Encoding(e) => write!(f, "Update encoding error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
