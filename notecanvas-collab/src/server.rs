//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── SequencerHandle (one task per note)
//!            ├── DocumentRoom ────┤        │ on_sequenced
//! Client B ──┘   (doc_id)         │        ▼
//!                                 ├── BroadcastGroup ──┬──► Client A  (Ack)
//!                                 │                    └──► Client B  (RemoteOp)
//!                                 ├── NodeLockTable (observer)
//!                                 └── PersistenceStore (load on open, save on close)
//! ```
//!
//! Every accepted operation is published once on the room broadcast as a
//! `RemoteOp`. Each connection's forwarder turns the entries its own peer
//! authored into `Ack`s, so acknowledgements and remote operations reach a
//! client in log order on a single stream.
//!
//! Channel traffic (presence, locks, node updates) is validated and relayed
//! without interpretation beyond lock bookkeeping. When a peer disconnects
//! the server releases its locks, broadcasts `presence_leave`, and closes
//! the room once it is empty, saving the note content.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ChannelRegistry};
use crate::channel::ChannelMessage;
use crate::locks::{lock_message, NodeLockTable};
use crate::ot::Document;
use crate::protocol::{JoinReply, MessageType, PeerInfo, Rejection, SyncMessage};
use crate::sequencer::{LogPosition, Sequencer, SequencerError, SequencerHandle};
use crate::storage::{NoteSnapshot, PersistenceStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room (also the sequencer queue depth)
    pub broadcast_capacity: usize,
    /// Interval between WebSocket pings and lock expiry sweeps
    pub heartbeat_interval_secs: u64,
    /// A connection silent for this long is dropped
    pub presence_timeout_secs: u64,
    /// Node locks older than this are released
    pub lock_ttl_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            presence_timeout_secs: 60,
            lock_ttl_secs: 120,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub operations_sequenced: u64,
    pub operations_rejected: u64,
    pub persisted_notes: u64,
}

/// One open note: its sequencer, fan-out group and lock view.
struct DocumentRoom {
    sequencer: SequencerHandle,
    channel: Arc<BroadcastGroup>,
    locks: Mutex<NodeLockTable>,
    peers: AtomicUsize,
}

impl DocumentRoom {
    fn open(doc_id: Uuid, document: Document, capacity: usize) -> Self {
        let channel = Arc::new(BroadcastGroup::new(capacity));
        let publisher = channel.clone();
        let sequencer = SequencerHandle::spawn(
            Sequencer::with_document(document),
            capacity,
            move |entry| match SyncMessage::remote_op(doc_id, entry).and_then(|m| m.encode()) {
                Ok(bytes) => {
                    publisher.broadcast_raw(Arc::new(bytes));
                }
                Err(e) => log::error!("Failed to publish version {} of {doc_id}: {e}", entry.version),
            },
        );
        Self {
            sequencer,
            channel,
            locks: Mutex::new(NodeLockTable::observer()),
            peers: AtomicUsize::new(0),
        }
    }

    /// Broadcast a channel message on the server's behalf.
    ///
    /// The envelope carries a nil sender so every peer receives it,
    /// including the user the message is about.
    fn announce(&self, doc_id: Uuid, msg: &ChannelMessage) {
        match SyncMessage::channel(doc_id, msg) {
            Ok(mut envelope) => {
                envelope.peer_id = Uuid::nil();
                if let Err(e) = self.channel.broadcast(&envelope) {
                    log::error!("Failed to broadcast to {doc_id}: {e}");
                }
            }
            Err(e) => log::error!("Failed to encode channel message for {doc_id}: {e}"),
        }
    }

    /// Drop expired locks and tell the room.
    fn expire_locks(&self, doc_id: Uuid, ttl: Duration) {
        let expired = match self.locks.lock() {
            Ok(mut locks) => locks.expire(ttl),
            Err(_) => return,
        };
        for (node_id, holder) in expired {
            log::info!("Lock on {node_id} held by {holder} expired");
            self.announce(doc_id, &lock_message(holder, node_id, false));
        }
    }
}

/// A joined connection.
struct Session {
    peer: PeerInfo,
    doc_id: Uuid,
    room: Arc<DocumentRoom>,
    /// Highest log version delivered to this peer.
    forwarded_version: u64,
}

#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    rooms: Arc<ChannelRegistry<DocumentRoom>>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<dyn PersistenceStore>>,
    /// Serializes room open and close so a rejoin never loads content a
    /// closing room has not saved yet.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

/// The sync server.
pub struct SyncServer {
    shared: Shared,
}

impl SyncServer {
    /// Create a server; opens RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Option<Arc<dyn PersistenceStore>> = match &config.storage_path {
            Some(path) => Some(Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::build(ServerConfig::default(), None)
    }

    /// Create with an explicit persistence collaborator.
    pub fn with_store(config: ServerConfig, store: Arc<dyn PersistenceStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn PersistenceStore>>) -> Self {
        Self {
            shared: Shared {
                config,
                rooms: Arc::new(ChannelRegistry::new()),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store,
                lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            },
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.shared.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let result = Self::serve(&shared, addr, &mut ws_sender, &mut ws_receiver, &mut session).await;

        if let Some(session) = session {
            Self::leave(&shared, session).await;
        }
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn serve(
        shared: &Shared,
        addr: SocketAddr,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        session: &mut Option<Session>,
    ) -> Result<(), BoxError> {
        let config = &shared.config;
        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let idle_limit = Duration::from_secs(config.presence_timeout_secs.max(1));
        let lock_ttl = Duration::from_secs(config.lock_ttl_secs);

        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    // A repeated join asks for a fresh catch-up.
                                    if let Some(s) = session.as_mut() {
                                        let known = sync_msg.join_request().ok().and_then(|r| r.known);
                                        log::info!("Peer {} requested resync from {known:?}", s.peer.peer_id);
                                        Self::send_catch_up(ws_sender, s, known).await?;
                                        continue;
                                    }
                                    match Self::join(shared, ws_sender, &sync_msg).await? {
                                        Some((joined, rx)) => {
                                            *session = Some(joined);
                                            broadcast_rx = Some(rx);
                                        }
                                        None => break,
                                    }
                                }
                                MessageType::Submit => {
                                    if let Some(s) = session.as_ref() {
                                        Self::submit(shared, ws_sender, s, &sync_msg).await?;
                                    } else {
                                        log::warn!("Submit from {addr} before join");
                                    }
                                }
                                MessageType::Channel => {
                                    if let Some(s) = session.as_ref() {
                                        Self::relay(s, &sync_msg)?;
                                    } else {
                                        log::warn!("Channel message from {addr} before join");
                                    }
                                }
                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.peer_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }
                                other => {
                                    log::debug!("Unhandled message type from {addr}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room traffic
                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(s) = session.as_mut() else { continue };
                    match msg {
                        Ok(data) => Self::forward(ws_sender, s, data).await?,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {} lagged by {n} messages", s.peer.peer_id);
                            s.room.channel.record_dropped(n);
                            let known = Some(LogPosition {
                                epoch: s.room.sequencer.epoch(),
                                version: s.forwarded_version,
                            });
                            Self::send_catch_up(ws_sender, s, known).await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > idle_limit {
                        log::info!("Dropping idle connection from {addr}");
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    if let Some(s) = session.as_ref() {
                        s.room.expire_locks(s.doc_id, lock_ttl);
                    }
                }
            }
        }

        Ok(())
    }

    /// Admit a peer to a room and send it the state it needs.
    ///
    /// Returns `None` when the join was refused.
    async fn join(
        shared: &Shared,
        ws_sender: &mut WsSink,
        msg: &SyncMessage,
    ) -> Result<Option<(Session, broadcast::Receiver<Arc<Vec<u8>>>)>, BoxError> {
        let request = match msg.join_request() {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Malformed join for {}: {e}", msg.doc_id);
                return Ok(None);
            }
        };
        let doc_id = msg.doc_id;
        let info = request.info;

        let room = match Self::enter_room(shared, doc_id).await {
            Ok(room) => room,
            Err(reason) => {
                log::warn!("Refused {} on {doc_id}: {reason}", info.peer_id);
                let rejection = Rejection {
                    submission_id: Uuid::nil(),
                    reason,
                };
                let reply = SyncMessage::reject(info.peer_id, doc_id, &rejection)?;
                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                return Ok(None);
            }
        };

        // Subscribe before reading the log so nothing falls in between.
        let rx = room.channel.add_peer(info.clone()).await;
        let mut session = Session {
            peer: info.clone(),
            doc_id,
            room,
            forwarded_version: 0,
        };

        let catch_up = match session.room.sequencer.catch_up(request.known).await {
            Ok(c) => c,
            Err(e) => {
                Self::leave(shared, session).await;
                return Err(e.into());
            }
        };
        session.forwarded_version = catch_up.version;
        let peers = session
            .room
            .channel
            .peers()
            .await
            .into_iter()
            .filter(|p| p.peer_id != info.peer_id)
            .collect();

        let reply = SyncMessage::snapshot(doc_id, &JoinReply { catch_up, peers })?;
        if let Err(e) = ws_sender.send(Message::Binary(reply.encode()?.into())).await {
            Self::leave(shared, session).await;
            return Err(e.into());
        }
        session
            .room
            .channel
            .broadcast(&SyncMessage::peer_joined(doc_id, &info)?)?;

        log::info!(
            "Peer {} ({}) joined note {doc_id} at version {}",
            info.name,
            info.peer_id,
            session.forwarded_version
        );
        Ok(Some((session, rx)))
    }

    async fn enter_room(shared: &Shared, doc_id: Uuid) -> Result<Arc<DocumentRoom>, String> {
        let _lifecycle = shared.lifecycle.lock().await;
        let room = match shared.rooms.get(&doc_id).await {
            Some(room) => room,
            None => {
                let document =
                    load_document(shared.store.as_deref(), doc_id).map_err(|e| e.to_string())?;
                let capacity = shared.config.broadcast_capacity;
                let (room, _) = shared
                    .rooms
                    .open(doc_id, || DocumentRoom::open(doc_id, document, capacity))
                    .await;
                log::info!("Opened room for note {doc_id}");
                shared.stats.write().await.active_rooms = shared.rooms.len().await;
                room
            }
        };

        let max = shared.config.max_peers_per_room;
        if room.peers.load(Ordering::SeqCst) >= max {
            return Err(format!("room is full ({max} peers)"));
        }
        room.peers.fetch_add(1, Ordering::SeqCst);
        Ok(room)
    }

    async fn submit(
        shared: &Shared,
        ws_sender: &mut WsSink,
        session: &Session,
        msg: &SyncMessage,
    ) -> Result<(), BoxError> {
        let submission = match msg.submission() {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Malformed submission from {}: {e}", session.peer.peer_id);
                return Ok(());
            }
        };
        if submission.client_id != session.peer.peer_id {
            log::warn!(
                "Peer {} submitted on behalf of {}",
                session.peer.peer_id,
                submission.client_id
            );
            return Ok(());
        }

        let submission_id = submission.id;
        match session.room.sequencer.submit(submission).await {
            Ok(entry) => {
                log::debug!(
                    "Sequenced {submission_id} from {} as version {}",
                    session.peer.peer_id,
                    entry.version
                );
                shared.stats.write().await.operations_sequenced += 1;
                Ok(())
            }
            Err(e) => {
                if let SequencerError::Stopped = e {
                    log::error!("Sequencer for {} is gone", session.doc_id);
                }
                shared.stats.write().await.operations_rejected += 1;
                let rejection = Rejection {
                    submission_id,
                    reason: e.to_string(),
                };
                let reply = SyncMessage::reject(session.peer.peer_id, session.doc_id, &rejection)?;
                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                Ok(())
            }
        }
    }

    /// Validate a channel message and fan it out.
    fn relay(session: &Session, msg: &SyncMessage) -> Result<(), BoxError> {
        let channel_msg = match msg.channel_message() {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Invalid channel message from {}: {e}", session.peer.peer_id);
                return Ok(());
            }
        };
        if channel_msg.user_id() != session.peer.peer_id {
            log::warn!(
                "Peer {} sent a channel message as {}",
                session.peer.peer_id,
                channel_msg.user_id()
            );
            return Ok(());
        }

        match &channel_msg {
            ChannelMessage::PresenceSync(_) => {
                log::trace!("Presence from {} in {}", session.peer.peer_id, session.doc_id)
            }
            ChannelMessage::NodeLock(lock) => log::debug!(
                "{} {} node {} in {}",
                lock.user_id,
                if lock.locked { "locked" } else { "unlocked" },
                lock.node_id,
                session.doc_id
            ),
            ChannelMessage::NodeUpdate(update) => log::debug!(
                "{} {:?} node {} in {}",
                update.user_id,
                update.action,
                update.node_id,
                session.doc_id
            ),
            ChannelMessage::PresenceLeave { user_id } => {
                log::info!("Presence: {user_id} left {}", session.doc_id)
            }
        }

        if let Ok(mut locks) = session.room.locks.lock() {
            locks.observe(&channel_msg);
        }
        session
            .room
            .channel
            .broadcast(&SyncMessage::channel(session.doc_id, &channel_msg)?)?;
        Ok(())
    }

    /// Deliver one room broadcast to this connection.
    async fn forward(
        ws_sender: &mut WsSink,
        session: &mut Session,
        data: Arc<Vec<u8>>,
    ) -> Result<(), BoxError> {
        let msg = match SyncMessage::decode(&data) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        let own = msg.peer_id == session.peer.peer_id;

        if msg.msg_type == MessageType::RemoteOp {
            // Already covered by a snapshot this peer received.
            if msg.version <= session.forwarded_version {
                return Ok(());
            }
            session.forwarded_version = msg.version;
            if own {
                let ack = msg.into_ack().encode()?;
                ws_sender.send(Message::Binary(ack.into())).await?;
                return Ok(());
            }
        } else if own {
            // Don't echo back to sender
            return Ok(());
        }
        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
        Ok(())
    }

    /// Send a `Snapshot` covering everything after `known`, or the whole
    /// document when there is none or it belongs to another log.
    async fn send_catch_up(
        ws_sender: &mut WsSink,
        session: &mut Session,
        known: Option<LogPosition>,
    ) -> Result<(), BoxError> {
        let catch_up = session.room.sequencer.catch_up(known).await?;
        session.forwarded_version = catch_up.version;
        let peers = session
            .room
            .channel
            .peers()
            .await
            .into_iter()
            .filter(|p| p.peer_id != session.peer.peer_id)
            .collect();
        let reply = SyncMessage::snapshot(session.doc_id, &JoinReply { catch_up, peers })?;
        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
        Ok(())
    }

    /// Tear down a departing peer's room state.
    async fn leave(shared: &Shared, session: Session) {
        let Session {
            peer, doc_id, room, ..
        } = session;

        room.channel.remove_peer(&peer.peer_id).await;
        let freed = match room.locks.lock() {
            Ok(mut locks) => locks.release_user(peer.peer_id),
            Err(_) => Vec::new(),
        };
        for node_id in freed {
            log::debug!("Releasing {node_id} held by departed {}", peer.peer_id);
            room.announce(doc_id, &lock_message(peer.peer_id, node_id, false));
        }
        room.announce(doc_id, &ChannelMessage::PresenceLeave { user_id: peer.peer_id });
        if let Err(e) = room.channel.broadcast(&SyncMessage::peer_left(peer.peer_id, doc_id)) {
            log::error!("Failed to announce departure from {doc_id}: {e}");
        }

        room.peers.fetch_sub(1, Ordering::SeqCst);
        log::info!("Peer {} ({}) left note {doc_id}", peer.name, peer.peer_id);
        Self::release_room(shared, doc_id).await;
    }

    /// Close the room if nobody is left in it, saving the note content.
    async fn release_room(shared: &Shared, doc_id: Uuid) {
        let _lifecycle = shared.lifecycle.lock().await;
        let Some(room) = shared
            .rooms
            .close_if(&doc_id, |r| r.peers.load(Ordering::SeqCst) == 0)
            .await
        else {
            return;
        };

        match room.sequencer.shutdown().await {
            Ok((document, version)) => {
                log::info!("Room {doc_id} removed (empty) at version {version}");
                if let (Some(store), true) = (&shared.store, version > 0) {
                    match store.save_content(doc_id, document.as_str()) {
                        Ok(()) => {
                            shared.stats.write().await.persisted_notes += 1;
                            log::info!("Persisted note {doc_id} (room closing)");
                        }
                        Err(e) => log::error!("Failed to persist note {doc_id}: {e}"),
                    }
                }
            }
            Err(e) => log::error!("Failed to stop sequencer for {doc_id}: {e}"),
        }
        shared.stats.write().await.active_rooms = shared.rooms.len().await;
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<dyn PersistenceStore>> {
        self.shared.store.as_ref()
    }

    /// Ids of notes with an open room.
    pub async fn open_documents(&self) -> Vec<Uuid> {
        self.shared.rooms.documents().await
    }

    /// Roll a note back to a stored version.
    ///
    /// When the note has an open room the restored text goes through its
    /// sequencer as one server entry, so connected peers receive it and the
    /// content saved on close matches it.
    pub async fn restore_version(&self, note_id: Uuid, version_number: u64) -> Result<NoteSnapshot, StoreError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        let store = shared
            .store
            .as_ref()
            .ok_or_else(|| StoreError::DatabaseError("no persistence store configured".into()))?;
        let snapshot = store.restore_version(note_id, version_number)?;

        if let Some(room) = shared.rooms.get(&note_id).await {
            let entry = room
                .sequencer
                .replace_content(snapshot.content.clone())
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            shared.stats.write().await.operations_sequenced += 1;
            log::info!(
                "Restored note {note_id} to version {version_number} in open room at log version {}",
                entry.version
            );
        } else {
            log::info!("Restored note {note_id} to version {version_number}");
        }
        Ok(snapshot)
    }
}

/// Initial content for a room: the stored note, or empty if there is none.
fn load_document(
    store: Option<&dyn PersistenceStore>,
    doc_id: Uuid,
) -> Result<Document, StoreError> {
    let Some(store) = store else {
        return Ok(Document::default());
    };
    match store.note(doc_id) {
        Ok(note) => {
            log::info!("Loaded persisted content for note {doc_id}");
            Ok(Document::new(note.content))
        }
        Err(StoreError::NotFound(_)) => Ok(Document::default()),
        Err(e) => {
            log::error!("Failed to load note {doc_id}: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Operation;
    use crate::sequencer::Submission;
    use crate::storage::MemoryStore;

    fn shared_with(store: Option<Arc<dyn PersistenceStore>>, max_peers: usize) -> Shared {
        let config = ServerConfig {
            max_peers_per_room: max_peers,
            broadcast_capacity: 16,
            ..ServerConfig::default()
        };
        SyncServer::build(config, store).shared
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.presence_timeout_secs, 60);
        assert_eq!(config.lock_ttl_secs, 120);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
    }

    #[test]
    fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        })
        .unwrap();
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.operations_sequenced, 0);
        assert_eq!(stats.persisted_notes, 0);
        assert!(server.open_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_room_publishes_sequenced_operations() {
        let doc_id = Uuid::new_v4();
        let room = DocumentRoom::open(doc_id, Document::new("ab"), 16);
        let mut rx = room.channel.subscribe();

        let author = Uuid::new_v4();
        let entry = room
            .sequencer
            .submit(Submission {
                id: Uuid::new_v4(),
                client_id: author,
                operation: Operation::insert(2, "c", author, 1),
                base_version: 0,
            })
            .await
            .unwrap();

        let published = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(published.msg_type, MessageType::RemoteOp);
        assert_eq!(published.peer_id, author);
        assert_eq!(published.doc_id, doc_id);
        assert_eq!(published.sequenced().unwrap(), entry);
    }

    #[tokio::test]
    async fn test_announce_uses_server_sender() {
        let doc_id = Uuid::new_v4();
        let room = DocumentRoom::open(doc_id, Document::default(), 16);
        let mut rx = room.channel.subscribe();

        let user = Uuid::new_v4();
        room.announce(doc_id, &ChannelMessage::PresenceLeave { user_id: user });
        let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.peer_id, Uuid::nil());
        assert_eq!(
            msg.channel_message().unwrap(),
            ChannelMessage::PresenceLeave { user_id: user }
        );
    }

    #[tokio::test]
    async fn test_expire_locks_broadcasts_unlock() {
        let doc_id = Uuid::new_v4();
        let room = DocumentRoom::open(doc_id, Document::default(), 16);
        let holder = Uuid::new_v4();
        room.locks
            .lock()
            .unwrap()
            .observe(&lock_message(holder, "n1".into(), true));
        let mut rx = room.channel.subscribe();

        std::thread::sleep(Duration::from_millis(5));
        room.expire_locks(doc_id, Duration::ZERO);
        let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg.channel_message().unwrap(), lock_message(holder, "n1".into(), false));
        assert!(room.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enter_room_loads_stored_content_and_enforces_limit() {
        let store = Arc::new(MemoryStore::new());
        let doc_id = Uuid::new_v4();
        store
            .put_note(
                doc_id,
                &NoteSnapshot {
                    title: "T".into(),
                    content: "stored".into(),
                    tags: Vec::new(),
                },
            )
            .unwrap();
        let shared = shared_with(Some(store as Arc<dyn PersistenceStore>), 1);

        let room = SyncServer::enter_room(&shared, doc_id).await.unwrap();
        let catch_up = room.sequencer.catch_up(None).await.unwrap();
        assert_eq!(catch_up.document.unwrap().as_str(), "stored");

        assert!(SyncServer::enter_room(&shared, doc_id).await.is_err());
        assert_eq!(room.peers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_room_persists_edited_content() {
        let store = Arc::new(MemoryStore::new());
        let doc_id = Uuid::new_v4();
        let shared = shared_with(Some(store.clone() as Arc<dyn PersistenceStore>), 10);

        let room = SyncServer::enter_room(&shared, doc_id).await.unwrap();
        let author = Uuid::new_v4();
        room.sequencer
            .submit(Submission {
                id: Uuid::new_v4(),
                client_id: author,
                operation: Operation::insert(0, "hello", author, 1),
                base_version: 0,
            })
            .await
            .unwrap();

        // Still occupied: nothing happens.
        SyncServer::release_room(&shared, doc_id).await;
        assert_eq!(shared.rooms.len().await, 1);

        room.peers.fetch_sub(1, Ordering::SeqCst);
        SyncServer::release_room(&shared, doc_id).await;
        assert!(shared.rooms.is_empty().await);
        assert_eq!(store.note(doc_id).unwrap().content, "hello");
        assert_eq!(shared.stats.read().await.persisted_notes, 1);
    }

    #[tokio::test]
    async fn test_release_untouched_room_does_not_overwrite() {
        let store = Arc::new(MemoryStore::new());
        let doc_id = Uuid::new_v4();
        let shared = shared_with(Some(store.clone() as Arc<dyn PersistenceStore>), 10);

        let room = SyncServer::enter_room(&shared, doc_id).await.unwrap();
        room.peers.fetch_sub(1, Ordering::SeqCst);
        SyncServer::release_room(&shared, doc_id).await;
        assert!(matches!(store.note(doc_id), Err(StoreError::NotFound(_))));
    }

    fn note(content: &str) -> NoteSnapshot {
        NoteSnapshot {
            title: "T".into(),
            content: content.into(),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_restore_version_goes_through_open_room() {
        let store = Arc::new(MemoryStore::new());
        let doc_id = Uuid::new_v4();
        store.put_note(doc_id, &note("draft")).unwrap();
        store.append_version(doc_id, &note("draft")).unwrap();
        let shared = shared_with(Some(store.clone() as Arc<dyn PersistenceStore>), 10);
        let server = SyncServer { shared: shared.clone() };

        let room = SyncServer::enter_room(&shared, doc_id).await.unwrap();
        let mut rx = room.channel.subscribe();
        let author = Uuid::new_v4();
        room.sequencer
            .submit(Submission {
                id: Uuid::new_v4(),
                client_id: author,
                operation: Operation::insert(5, " two", author, 1),
                base_version: 0,
            })
            .await
            .unwrap();
        rx.recv().await.unwrap();

        let restored = server.restore_version(doc_id, 1).await.unwrap();
        assert_eq!(restored.content, "draft");

        let published = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
        let entry = published.sequenced().unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.client_id, None);
        assert_eq!(published.peer_id, Uuid::nil());

        // Closing the room saves the restored text, not the stale edit.
        room.peers.fetch_sub(1, Ordering::SeqCst);
        SyncServer::release_room(&shared, doc_id).await;
        assert_eq!(store.note(doc_id).unwrap().content, "draft");
        assert_eq!(shared.stats.read().await.operations_sequenced, 1);
    }

    #[tokio::test]
    async fn test_restore_version_without_room_writes_store() {
        let store = Arc::new(MemoryStore::new());
        let doc_id = Uuid::new_v4();
        store.append_version(doc_id, &note("first")).unwrap();
        store.put_note(doc_id, &note("later")).unwrap();
        let server = SyncServer::with_store(ServerConfig::default(), store.clone());

        server.restore_version(doc_id, 1).await.unwrap();
        assert_eq!(store.note(doc_id).unwrap().content, "first");
        assert!(server.open_documents().await.is_empty());

        assert!(matches!(
            server.restore_version(doc_id, 9).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            SyncServer::with_defaults().restore_version(doc_id, 1).await,
            Err(StoreError::DatabaseError(_))
        ));
    }

    #[test]
    fn test_load_document_without_store() {
        assert!(load_document(None, Uuid::new_v4()).unwrap().is_empty());
    }
}
