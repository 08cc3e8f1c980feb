//! Operation model shared by every replica of a document.
//!
//! Positions and lengths are measured in chars (Unicode scalar values) so
//! that a position computed on one replica addresses the same character on
//! every other replica regardless of encoding.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the user who authored an operation.
pub type UserId = Uuid;

/// A single edit against a linear document.
///
/// Operations are immutable values: transformation always produces a new
/// operation and never rewrites an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert `content` so that its first char lands at `position`.
    Insert {
        position: usize,
        content: String,
        author: UserId,
        /// Client clock, used only to order inserts at the same position.
        timestamp: u64,
    },

    /// Remove `length` chars starting at `position`.
    Delete {
        position: usize,
        length: usize,
        author: UserId,
        timestamp: u64,
    },

    /// Structural no-op; the identity element of the algebra.
    Retain { length: usize },

    /// Components applied one after another, each against the result of
    /// the previous one. Produced when a delete has to be split around a
    /// concurrent insert.
    Sequence(Vec<Operation>),
}

impl Operation {
    pub fn insert(position: usize, content: impl Into<String>, author: UserId, timestamp: u64) -> Self {
        Operation::Insert {
            position,
            content: content.into(),
            author,
            timestamp,
        }
    }

    pub fn delete(position: usize, length: usize, author: UserId, timestamp: u64) -> Self {
        Operation::Delete {
            position,
            length,
            author,
            timestamp,
        }
    }

    pub fn retain(length: usize) -> Self {
        Operation::Retain { length }
    }

    /// Build a sequence, flattening nested sequences and dropping no-ops.
    ///
    /// Collapses to the single remaining component, or to `Retain(0)` when
    /// nothing is left.
    pub fn sequence(parts: Vec<Operation>) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            flatten_into(&mut flat, part);
        }
        match flat.len() {
            0 => Operation::retain(0),
            1 => flat.remove(0),
            _ => Operation::Sequence(flat),
        }
    }

    /// Whether applying this operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Insert { content, .. } => content.is_empty(),
            Operation::Delete { length, .. } => *length == 0,
            Operation::Retain { .. } => true,
            Operation::Sequence(parts) => parts.iter().all(Operation::is_noop),
        }
    }

    /// Author of the edit. `None` for `Retain`, and for sequences the
    /// author of the first component.
    pub fn author(&self) -> Option<UserId> {
        match self {
            Operation::Insert { author, .. } | Operation::Delete { author, .. } => Some(*author),
            Operation::Retain { .. } => None,
            Operation::Sequence(parts) => parts.iter().find_map(Operation::author),
        }
    }

    /// Check the operation against a document of `doc_len` chars.
    ///
    /// Returns the length the document will have after the operation.
    pub fn validate(&self, doc_len: usize) -> Result<usize, OtError> {
        match self {
            Operation::Insert { position, content, .. } => {
                if *position > doc_len {
                    return Err(OtError::invalid(format!(
                        "insert at {position} beyond document length {doc_len}"
                    )));
                }
                Ok(doc_len + char_len(content))
            }
            Operation::Delete { position, length, .. } => {
                match position.checked_add(*length) {
                    Some(end) if end <= doc_len => Ok(doc_len - length),
                    _ => Err(OtError::invalid(format!(
                        "delete of {length} at {position} beyond document length {doc_len}"
                    ))),
                }
            }
            Operation::Retain { .. } => Ok(doc_len),
            Operation::Sequence(parts) => parts
                .iter()
                .try_fold(doc_len, |len, part| part.validate(len)),
        }
    }
}

fn flatten_into(out: &mut Vec<Operation>, op: Operation) {
    match op {
        Operation::Sequence(parts) => {
            for part in parts {
                flatten_into(out, part);
            }
        }
        op if op.is_noop() => {}
        op => out.push(op),
    }
}

/// Number of chars in `s`.
#[inline]
pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the char at `char_idx`, or `s.len()` past the end.
#[inline]
pub(crate) fn byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Errors raised by the operation algebra and the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// Position or length is inconsistent with the document it targets.
    InvalidOperation { reason: String },
    /// A client claimed to have seen a version the sequencer never issued.
    VersionAhead { client: u64, server: u64 },
}

impl OtError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        OtError::InvalidOperation {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::InvalidOperation { reason } => write!(f, "Invalid operation: {reason}"),
            OtError::VersionAhead { client, server } => {
                write!(f, "Client version {client} is ahead of server version {server}")
            }
        }
    }
}

impl std::error::Error for OtError {}
