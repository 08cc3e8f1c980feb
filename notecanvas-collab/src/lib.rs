//! # notecanvas-collab: Real-time collaboration layer for NoteCanvas
//!
//! Concurrent text editing through operational transformation, with a
//! broadcast channel for presence and node locks alongside it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient       │ ◄────────────────► │ SyncServer       │
//! │ ClientReconciler │    Binary Proto    │ SequencerHandle  │
//! │ (optimistic)     │                    │ (authority)      │
//! └────────┬─────────┘                    └────────┬─────────┘
//!          │                                       │
//!          ▼                                       ▼
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ PresenceRoom     │ ◄── ChannelMessage │ BroadcastGroup   │
//! │ NodeLockTable    │     (JSON)         │ (fan-out)        │
//! └──────────────────┘                    └────────┬─────────┘
//!                                                  │
//!                                         ┌────────┴─────────┐
//!                                         │ PersistenceStore │
//!                                         └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`]: Operation model: `apply`, `transform`, `compose`, `invert`
//! - [`sequencer`]: Server-side total order and operation log
//! - [`reconciler`]: Client-side pending queue and rebasing
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`channel`]: Typed presence / lock / node-update messages
//! - [`broadcast`]: Per-document fan-out and the room registry
//! - [`presence`]: Presence tracking and rendering order
//! - [`locks`]: Advisory node locks
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`storage`]: Notes, comment threads and version history

pub mod ot;
pub mod sequencer;
pub mod reconciler;
pub mod protocol;
pub mod channel;
pub mod broadcast;
pub mod presence;
pub mod locks;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use ot::{apply, compose, invert, transform, Document, OtError, Operation, UserId};
pub use sequencer::{CatchUp, LogPosition, Sequenced, Sequencer, SequencerError, SequencerHandle, Submission};
pub use reconciler::{ClientReconciler, Integrated, PendingOperation, ReconcileError};
pub use protocol::{JoinReply, JoinRequest, MessageType, PeerInfo, ProtocolError, Rejection, SyncMessage};
pub use channel::{ChannelMessage, NodeAction, NodeId, NodeLock, NodeUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, ChannelRegistry};
pub use presence::{
    CursorPosition, PresencePayload, PresenceRoom, PresenceStatus, PresenceTracker, SelectionRange,
};
pub use locks::{LockContention, NodeLockTable};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use storage::{
    Comment, CommentId, CommentThread, MemoryStore, NewComment, NoteId, NoteSnapshot, NoteVersion,
    PersistenceStore, RocksStore, StoreConfig, StoreError,
};
