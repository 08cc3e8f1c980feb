//! Durable storage for notes, comment threads and version snapshots.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  room open / close   ┌───────────────────┐
//! │ SyncServer  │ ───────────────────► │ PersistenceStore  │
//! │ (sequencer) │   note content       │  (trait)          │
//! └─────────────┘                      └─────────┬─────────┘
//!                                                │
//!                           ┌────────────────────┴───────────────┐
//!                           ▼                                    ▼
//!                    ┌─────────────┐              ┌──────────────────────────────┐
//!                    │ MemoryStore │              │ RocksStore                   │
//!                    │ (process)   │              │ CF "notes"    - live fields  │
//!                    └─────────────┘              │ CF "comments" - per note     │
//!                                                 │ CF "versions" - LZ4 snapshots│
//!                                                 └──────────────────────────────┘
//! ```
//!
//! The collaboration core only reads and writes through [`PersistenceStore`].
//! A failed call returns a [`StoreError`] and never touches in-memory
//! collaborative state.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::ot::UserId;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

pub type NoteId = Uuid;
pub type CommentId = Uuid;

/// The live, user-visible fields of a note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSnapshot {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComment {
    pub author: UserId,
    pub content: String,
    /// Set for replies.
    pub parent_id: Option<CommentId>,
    pub mentions: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub note_id: NoteId,
    pub author: UserId,
    pub content: String,
    pub parent_id: Option<CommentId>,
    pub mentions: Vec<UserId>,
    /// Unix microseconds, strictly increasing per process.
    pub created_at: u64,
    pub resolved: bool,
}

/// A comment with its replies, each level ordered by creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentThread {
    pub comment: Comment,
    pub replies: Vec<CommentThread>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteVersion {
    pub note_id: NoteId,
    /// 1 for the first snapshot of a note, then +1 each time.
    pub version_number: u64,
    pub snapshot: NoteSnapshot,
    pub created_at: u64,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Reply to a comment that does not exist on the note.
    InvalidParent(CommentId),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(what) => write!(f, "Not found: {what}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::InvalidParent(id) => write!(f, "Parent comment {id} not found"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Narrow read/write contract the collaboration core needs from storage.
pub trait PersistenceStore: Send + Sync {
    fn put_note(&self, note_id: NoteId, snapshot: &NoteSnapshot) -> Result<(), StoreError>;

    fn note(&self, note_id: NoteId) -> Result<NoteSnapshot, StoreError>;

    /// Store a comment, assigning its id and timestamp.
    fn append_comment(&self, note_id: NoteId, comment: NewComment) -> Result<Comment, StoreError>;

    /// All comments of a note, oldest first, replies nested under parents.
    fn comments(&self, note_id: NoteId) -> Result<Vec<CommentThread>, StoreError>;

    fn resolve_comment(&self, note_id: NoteId, comment_id: CommentId) -> Result<Comment, StoreError>;

    /// Snapshot the given fields under the next version number.
    fn append_version(&self, note_id: NoteId, snapshot: &NoteSnapshot) -> Result<NoteVersion, StoreError>;

    /// Version list, newest first.
    fn versions(&self, note_id: NoteId) -> Result<Vec<NoteVersion>, StoreError>;

    fn version(&self, note_id: NoteId, version_number: u64) -> Result<NoteVersion, StoreError>;

    /// Overwrite the live note with a stored version's fields.
    fn restore_version(&self, note_id: NoteId, version_number: u64) -> Result<NoteSnapshot, StoreError> {
        let version = self.version(note_id, version_number)?;
        self.put_note(note_id, &version.snapshot)?;
        Ok(version.snapshot)
    }

    /// Replace only the content of a note, keeping title and tags.
    fn save_content(&self, note_id: NoteId, content: &str) -> Result<(), StoreError> {
        let mut note = match self.note(note_id) {
            Ok(note) => note,
            Err(StoreError::NotFound(_)) => NoteSnapshot::default(),
            Err(e) => return Err(e),
        };
        note.content = content.to_owned();
        self.put_note(note_id, &note)
    }
}

/// Nest comments by `parent_id`.
///
/// Comments whose parent is missing are promoted to roots rather than
/// dropped.
pub fn build_threads(mut comments: Vec<Comment>) -> Vec<CommentThread> {
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let known: std::collections::HashSet<CommentId> = comments.iter().map(|c| c.id).collect();
    let mut children: HashMap<Option<CommentId>, Vec<Comment>> = HashMap::new();
    for comment in comments {
        let parent = comment.parent_id.filter(|p| known.contains(p));
        children.entry(parent).or_default().push(comment);
    }

    fn attach(
        parent: Option<CommentId>,
        children: &mut HashMap<Option<CommentId>, Vec<Comment>>,
    ) -> Vec<CommentThread> {
        children
            .remove(&parent)
            .unwrap_or_default()
            .into_iter()
            .map(|comment| {
                let replies = attach(Some(comment.id), children);
                CommentThread { comment, replies }
            })
            .collect()
    }

    attach(None, &mut children)
}

/// Strictly increasing unix-microsecond timestamps.
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub(crate) fn now(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
