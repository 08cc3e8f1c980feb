//! Process-local store. Used when no storage path is configured, and in
//! tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    build_threads, Comment, CommentId, CommentThread, MonotonicClock, NewComment, NoteId,
    NoteSnapshot, NoteVersion, PersistenceStore, StoreError,
};

#[derive(Default)]
struct NoteRecord {
    live: Option<NoteSnapshot>,
    comments: Vec<Comment>,
    versions: Vec<NoteVersion>,
}

#[derive(Default)]
pub struct MemoryStore {
    notes: Mutex<HashMap<NoteId, NoteRecord>>,
    clock: MonotonicClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notes(&self) -> Result<MutexGuard<'_, HashMap<NoteId, NoteRecord>>, StoreError> {
        self.notes
            .lock()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))
    }
}

impl PersistenceStore for MemoryStore {
    fn put_note(&self, note_id: NoteId, snapshot: &NoteSnapshot) -> Result<(), StoreError> {
        self.notes()?.entry(note_id).or_default().live = Some(snapshot.clone());
        Ok(())
    }

    fn note(&self, note_id: NoteId) -> Result<NoteSnapshot, StoreError> {
        self.notes()?
            .get(&note_id)
            .and_then(|r| r.live.clone())
            .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))
    }

    fn append_comment(&self, note_id: NoteId, comment: NewComment) -> Result<Comment, StoreError> {
        let mut notes = self.notes()?;
        let record = notes.entry(note_id).or_default();
        if let Some(parent) = comment.parent_id {
            if !record.comments.iter().any(|c| c.id == parent) {
                return Err(StoreError::InvalidParent(parent));
            }
        }
        let stored = Comment {
            id: Uuid::new_v4(),
            note_id,
            author: comment.author,
            content: comment.content,
            parent_id: comment.parent_id,
            mentions: comment.mentions,
            created_at: self.clock.now(),
            resolved: false,
        };
        record.comments.push(stored.clone());
        Ok(stored)
    }

    fn comments(&self, note_id: NoteId) -> Result<Vec<CommentThread>, StoreError> {
        let comments = self
            .notes()?
            .get(&note_id)
            .map(|r| r.comments.clone())
            .unwrap_or_default();
        Ok(build_threads(comments))
    }

    fn resolve_comment(&self, note_id: NoteId, comment_id: CommentId) -> Result<Comment, StoreError> {
        let mut notes = self.notes()?;
        let comment = notes
            .get_mut(&note_id)
            .and_then(|r| r.comments.iter_mut().find(|c| c.id == comment_id))
            .ok_or_else(|| StoreError::NotFound(format!("comment {comment_id}")))?;
        comment.resolved = true;
        Ok(comment.clone())
    }

    fn append_version(&self, note_id: NoteId, snapshot: &NoteSnapshot) -> Result<NoteVersion, StoreError> {
        let mut notes = self.notes()?;
        let record = notes.entry(note_id).or_default();
        let version = NoteVersion {
            note_id,
            version_number: record.versions.len() as u64 + 1,
            snapshot: snapshot.clone(),
            created_at: self.clock.now(),
        };
        record.versions.push(version.clone());
        Ok(version)
    }

    fn versions(&self, note_id: NoteId) -> Result<Vec<NoteVersion>, StoreError> {
        let mut versions = self
            .notes()?
            .get(&note_id)
            .map(|r| r.versions.clone())
            .unwrap_or_default();
        versions.reverse();
        Ok(versions)
    }

    fn version(&self, note_id: NoteId, version_number: u64) -> Result<NoteVersion, StoreError> {
        self.notes()?
            .get(&note_id)
            .and_then(|r| {
                r.versions
                    .iter()
                    .find(|v| v.version_number == version_number)
                    .cloned()
            })
            .ok_or_else(|| StoreError::NotFound(format!("version {version_number} of note {note_id}")))
    }
}
