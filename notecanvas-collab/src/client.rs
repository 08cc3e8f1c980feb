//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Speculative local edits through a [`ClientReconciler`]
//! - Presence, lock and node-update channel traffic
//!
//! Edits made while disconnected stay in the reconciler's pending queue.
//! On reconnect the client rejoins at the last log position it integrated,
//! folds in whatever it missed and resends its in-flight submission; the
//! server ignores the resend if the original was already accepted. If the
//! room was closed and reopened in the meantime the position belongs to an
//! old log, and the server answers with the full document instead.
//!
//! When the server rejects the in-flight operation, or traffic arrives out
//! of order, the client asks for the full document and adopts it,
//! discarding its unacknowledged edits.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::ChannelMessage;
use crate::ot::{Document, Operation};
use crate::protocol::{JoinRequest, MessageType, PeerInfo, ProtocolError, Rejection, SyncMessage};
use crate::reconciler::{ClientReconciler, Integrated, ReconcileError};
use crate::sequencer::{LogPosition, Sequenced, Submission};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Caught up with the server at `version`
    Synced { version: u64 },
    /// A remote operation, in the form applied to the local document
    RemoteOperation { operation: Operation, version: u64 },
    /// Our in-flight operation was accepted at `version`
    Acknowledged { version: u64 },
    /// The server refused a submission or the join
    Rejected(Rejection),
    /// Local state was replaced by the server's; `discarded` local
    /// operations were dropped
    Resynced { discarded: usize },
    /// Local and server state diverged; a full resync was requested
    Desynced(ReconcileError),
    /// Presence, lock or node update from a peer
    Channel(ChannelMessage),
    /// A peer joined the document
    PeerJoined(PeerInfo),
    /// A peer left the document
    PeerLeft(Uuid),
}

/// Reconciler plus the log it is synced to, if any.
struct ClientState {
    reconciler: ClientReconciler,
    synced: bool,
    epoch: Option<Uuid>,
}

impl ClientState {
    fn new(client_id: Uuid) -> Self {
        Self {
            reconciler: ClientReconciler::new(client_id, Document::default(), 0),
            synced: false,
            epoch: None,
        }
    }

    /// Where to resume from on rejoin.
    fn known_position(&self) -> Option<LogPosition> {
        if !self.synced {
            return None;
        }
        self.epoch.map(|epoch| LogPosition {
            epoch,
            version: self.reconciler.server_version(),
        })
    }
}

/// Result of handling one server message.
#[derive(Default)]
struct Handled {
    events: Vec<SyncEvent>,
    outgoing: Vec<SyncMessage>,
}

/// The sync client.
pub struct SyncClient {
    /// Our peer identity
    peer_info: PeerInfo,

    /// Document we're editing
    doc_id: Uuid,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local document and pending operations
    inner: Arc<Mutex<ClientState>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    tasks: Vec<JoinHandle<()>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(peer_info: PeerInfo, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let inner = ClientState::new(peer_info.peer_id);
        Self {
            peer_info,
            doc_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            inner: Arc::new(Mutex::new(inner)),
            outgoing_tx: None,
            tasks: Vec::new(),
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the document.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.doc_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let known = self.inner.lock().await.known_position();
        let join = SyncMessage::join(
            self.doc_id,
            &JoinRequest {
                info: self.peer_info.clone(),
                known,
            },
        )?;
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Connected before the reader exists, so a close it sees is final.
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let inner = self.inner.clone();
        let peer_info = self.peer_info.clone();
        let doc_id = self.doc_id;
        let replies = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Undecodable message from server: {e}");
                                continue;
                            }
                        };
                        let handled = {
                            let mut inner = inner.lock().await;
                            handle_message(&mut inner, &peer_info, doc_id, sync_msg)
                        };
                        for out in handled.outgoing {
                            match out.encode() {
                                Ok(encoded) => {
                                    let _ = replies.send(encoded).await;
                                }
                                Err(e) => log::error!("Failed to encode outgoing message: {e}"),
                            }
                        }
                        for event in handled.events {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.outgoing_tx = Some(out_tx);
        self.tasks = vec![writer, reader];
        log::info!("Connected to {url} as {}", self.peer_info.peer_id);
        Ok(())
    }

    /// Drop the connection. Local state is kept.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Disconnect and connect again, resuming from the last integrated
    /// version.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Apply a local edit and submit it when nothing else is in flight.
    pub async fn edit(&self, op: Operation) -> Result<(), ProtocolError> {
        let submission = {
            let mut inner = self.inner.lock().await;
            if !inner.synced {
                return Err(ProtocolError::InvalidPayload(
                    "document not synced yet".into(),
                ));
            }
            inner
                .reconciler
                .apply_local_operation(op)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?
        };

        if let Some(submission) = submission {
            if self.connection_state().await == ConnectionState::Connected {
                self.send(SyncMessage::submit(self.doc_id, &submission)?).await?;
            }
        }
        Ok(())
    }

    /// Send a presence, lock or node-update message.
    ///
    /// Dropped silently when offline.
    pub async fn send_channel(&self, msg: &ChannelMessage) -> Result<(), ProtocolError> {
        msg.validate()?;
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(SyncMessage::channel(self.doc_id, msg)?).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The optimistic local text.
    pub async fn document(&self) -> String {
        self.inner.lock().await.reconciler.document().as_str().to_owned()
    }

    /// Last server version integrated.
    pub async fn server_version(&self) -> u64 {
        self.inner.lock().await.reconciler.server_version()
    }

    /// Local operations not yet acknowledged.
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.reconciler.pending_len()
    }

    pub async fn is_synced(&self) -> bool {
        self.inner.lock().await.synced
    }

    /// Get our peer info.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    /// Get the document ID.
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn handle_message(
    inner: &mut ClientState,
    peer: &PeerInfo,
    doc_id: Uuid,
    msg: SyncMessage,
) -> Handled {
    let mut handled = Handled::default();
    match msg.msg_type {
        MessageType::Snapshot => match msg.join_reply() {
            Ok(reply) => {
                for info in reply.peers {
                    handled.events.push(SyncEvent::PeerJoined(info));
                }
                let catch_up = reply.catch_up;
                inner.epoch = Some(catch_up.epoch);
                match catch_up.document {
                    Some(document) => {
                        let discarded = inner.reconciler.resync(document, catch_up.version);
                        if inner.synced || !discarded.is_empty() {
                            handled.events.push(SyncEvent::Resynced {
                                discarded: discarded.len(),
                            });
                        }
                    }
                    None => {
                        for entry in &catch_up.entries {
                            if !integrate_entry(inner, peer, doc_id, entry, &mut handled) {
                                return handled;
                            }
                        }
                    }
                }
                inner.synced = true;
                handled.events.push(SyncEvent::Synced {
                    version: inner.reconciler.server_version(),
                });
                if let Some(head) = inner.reconciler.resend_head() {
                    push_submit(doc_id, &head, &mut handled);
                }
            }
            Err(e) => log::warn!("Malformed snapshot: {e}"),
        },

        MessageType::Ack | MessageType::RemoteOp => match msg.sequenced() {
            Ok(entry) => {
                integrate_entry(inner, peer, doc_id, &entry, &mut handled);
            }
            Err(e) => log::warn!("Malformed log entry: {e}"),
        },

        MessageType::Reject => match msg.rejection() {
            Ok(rejection) => {
                let in_flight = inner
                    .reconciler
                    .in_flight()
                    .is_some_and(|s| s.id == rejection.submission_id);
                log::warn!("Server rejected {}: {}", rejection.submission_id, rejection.reason);
                if in_flight {
                    request_full_sync(peer, doc_id, &mut handled);
                }
                handled.events.push(SyncEvent::Rejected(rejection));
            }
            Err(e) => log::warn!("Malformed rejection: {e}"),
        },

        MessageType::Channel => match msg.channel_message() {
            Ok(channel_msg) => handled.events.push(SyncEvent::Channel(channel_msg)),
            Err(e) => log::warn!("Invalid channel message: {e}"),
        },

        MessageType::PeerJoined => {
            if let Ok(info) = msg.peer_info() {
                handled.events.push(SyncEvent::PeerJoined(info));
            }
        }

        MessageType::PeerLeft => handled.events.push(SyncEvent::PeerLeft(msg.peer_id)),

        MessageType::Pong => log::trace!("Pong from server"),

        other => log::debug!("Unexpected message type from server: {other:?}"),
    }
    handled
}

/// Fold one log entry into local state. Returns false after a desync.
fn integrate_entry(
    inner: &mut ClientState,
    peer: &PeerInfo,
    doc_id: Uuid,
    entry: &Sequenced,
    handled: &mut Handled,
) -> bool {
    match inner.reconciler.integrate(entry) {
        Ok(Integrated::Duplicate) => true,
        Ok(Integrated::Acknowledged(next)) => {
            handled.events.push(SyncEvent::Acknowledged {
                version: entry.version,
            });
            if let Some(next) = next {
                push_submit(doc_id, &next, handled);
            }
            true
        }
        Ok(Integrated::Applied(operation)) => {
            handled.events.push(SyncEvent::RemoteOperation {
                operation,
                version: entry.version,
            });
            true
        }
        Err(e) => {
            log::warn!("Client {} out of sync: {e}", peer.peer_id);
            request_full_sync(peer, doc_id, handled);
            handled.events.push(SyncEvent::Desynced(e));
            false
        }
    }
}

fn push_submit(doc_id: Uuid, submission: &Submission, handled: &mut Handled) {
    match SyncMessage::submit(doc_id, submission) {
        Ok(msg) => handled.outgoing.push(msg),
        Err(e) => log::error!("Failed to encode submission {}: {e}", submission.id),
    }
}

/// Ask the server for the whole document.
fn request_full_sync(peer: &PeerInfo, doc_id: Uuid, handled: &mut Handled) {
    let request = JoinRequest {
        info: peer.clone(),
        known: None,
    };
    match SyncMessage::join(doc_id, &request) {
        Ok(msg) => handled.outgoing.push(msg),
        Err(e) => log::error!("Failed to encode resync request: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JoinReply;
    use crate::sequencer::CatchUp;

    fn state(peer: &PeerInfo) -> ClientState {
        ClientState::new(peer.peer_id)
    }

    fn epoch() -> Uuid {
        Uuid::from_u128(0xe0)
    }

    fn snapshot(doc_id: Uuid, text: &str, version: u64) -> SyncMessage {
        SyncMessage::snapshot(
            doc_id,
            &JoinReply {
                catch_up: CatchUp {
                    document: Some(Document::new(text)),
                    epoch: epoch(),
                    version,
                    entries: Vec::new(),
                },
                peers: vec![PeerInfo::new("Bob")],
            },
        )
        .unwrap()
    }

    fn remote(doc_id: Uuid, op: Operation, version: u64, client: Option<Uuid>) -> SyncMessage {
        SyncMessage::remote_op(
            doc_id,
            &Sequenced {
                operation: op,
                version,
                client_id: client,
                submission_id: client.map(|_| Uuid::new_v4()),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_client_creation() {
        let info = PeerInfo::new("TestUser");
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(info.clone(), doc_id, "ws://localhost:9090");

        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.server_version().await, 0);
        assert_eq!(client.pending_len().await, 0);
        assert!(!client.is_synced().await);
    }

    #[tokio::test]
    async fn test_edit_before_sync_refused() {
        let info = PeerInfo::new("TestUser");
        let client = SyncClient::new(info.clone(), Uuid::new_v4(), "ws://localhost:9090");
        let op = Operation::insert(0, "x", info.peer_id, 1);
        assert!(matches!(client.edit(op).await, Err(ProtocolError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_send_channel_offline_noop() {
        let info = PeerInfo::new("TestUser");
        let client = SyncClient::new(info.clone(), Uuid::new_v4(), "ws://localhost:9090");
        let msg = ChannelMessage::PresenceLeave { user_id: info.peer_id };
        client.send_channel(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), "ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_server_close_leaves_client_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        });

        let mut client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), format!("ws://{addr}"));
        let mut events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();

        let wait = async {
            let mut seen = Vec::new();
            while let Some(event) = events.recv().await {
                let done = matches!(event, SyncEvent::Disconnected);
                seen.push(event);
                if done {
                    break;
                }
            }
            seen
        };
        let seen = tokio::time::timeout(std::time::Duration::from_secs(5), wait).await.unwrap();
        assert!(matches!(seen.first(), Some(SyncEvent::Connected)));
        assert!(matches!(seen.last(), Some(SyncEvent::Disconnected)));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_rejoin_position_follows_snapshot_log() {
        let peer = PeerInfo::new("Alice");
        let doc_id = Uuid::new_v4();
        let mut inner = state(&peer);
        assert_eq!(inner.known_position(), None);

        handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "hello", 3));
        assert_eq!(
            inner.known_position(),
            Some(LogPosition {
                epoch: epoch(),
                version: 3
            })
        );

        // A reopened room starts a new log; the next rejoin names it.
        let reopened = Uuid::from_u128(0xe1);
        let reply = SyncMessage::snapshot(
            doc_id,
            &JoinReply {
                catch_up: CatchUp {
                    document: Some(Document::new("hello")),
                    epoch: reopened,
                    version: 0,
                    entries: Vec::new(),
                },
                peers: Vec::new(),
            },
        )
        .unwrap();
        handle_message(&mut inner, &peer, doc_id, reply);
        assert_eq!(
            inner.known_position(),
            Some(LogPosition {
                epoch: reopened,
                version: 0
            })
        );
    }

    #[test]
    fn test_initial_snapshot_syncs() {
        let peer = PeerInfo::new("Alice");
        let doc_id = Uuid::new_v4();
        let mut inner = state(&peer);

        let handled = handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "hello", 3));
        assert!(inner.synced);
        assert_eq!(inner.reconciler.document().as_str(), "hello");
        assert_eq!(inner.reconciler.server_version(), 3);
        assert!(handled.outgoing.is_empty());
        assert!(matches!(handled.events[0], SyncEvent::PeerJoined(_)));
        assert!(matches!(handled.events.last(), Some(SyncEvent::Synced { version: 3 })));
    }

    #[test]
    fn test_remote_op_applied_and_duplicate_ignored() {
        let peer = PeerInfo::new("Alice");
        let doc_id = Uuid::new_v4();
        let mut inner = state(&peer);
        handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "ab", 0));

        let other = Uuid::new_v4();
        let msg = remote(doc_id, Operation::insert(1, "X", other, 1), 1, Some(other));
        let handled = handle_message(&mut inner, &peer, doc_id, msg.clone());
        assert_eq!(inner.reconciler.document().as_str(), "aXb");
        assert!(matches!(
            handled.events[0],
            SyncEvent::RemoteOperation { version: 1, .. }
        ));

        let again = handle_message(&mut inner, &peer, doc_id, msg);
        assert!(again.events.is_empty());
        assert_eq!(inner.reconciler.document().as_str(), "aXb");
    }

    #[test]
    fn test_ack_releases_next_submission() {
        let peer = PeerInfo::new("Alice");
        let doc_id = Uuid::new_v4();
        let mut inner = state(&peer);
        handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "", 0));

        let first = inner
            .reconciler
            .apply_local_operation(Operation::insert(0, "a", peer.peer_id, 1))
            .unwrap()
            .unwrap();
        // Queued behind the in-flight head.
        let queued = inner
            .reconciler
            .apply_local_operation(Operation::insert(1, "b", peer.peer_id, 2))
            .unwrap();
        assert!(queued.is_none());

        let ack = SyncMessage::remote_op(
            doc_id,
            &Sequenced {
                operation: first.operation.clone(),
                version: 1,
                client_id: Some(peer.peer_id),
                submission_id: Some(first.id),
            },
        )
        .unwrap()
        .into_ack();
        let handled = handle_message(&mut inner, &peer, doc_id, ack);

        assert!(matches!(handled.events[0], SyncEvent::Acknowledged { version: 1 }));
        assert_eq!(handled.outgoing.len(), 1);
        let next = handled.outgoing[0].submission().unwrap();
        assert_eq!(next.base_version, 1);
        assert_eq!(next.client_id, peer.peer_id);
    }

    #[test]
    fn test_gap_requests_full_sync() {
        let peer = PeerInfo::new("Alice");
        let doc_id = Uuid::new_v4();
        let mut inner = state(&peer);
        handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "abc", 2));

        let other = Uuid::new_v4();
        let handled = handle_message(
            &mut inner,
            &peer,
            doc_id,
            remote(doc_id, Operation::insert(0, "Z", other, 1), 5, Some(other)),
        );
        assert!(matches!(
            handled.events[0],
            SyncEvent::Desynced(ReconcileError::ReconciliationDesync { expected: 3, got: 5 })
        ));
        let request = handled.outgoing[0].join_request().unwrap();
        assert_eq!(request.known, None);
        assert_eq!(inner.reconciler.document().as_str(), "abc");
    }

    #[test]
    fn test_rejected_in_flight_requests_full_sync() {
        let peer = PeerInfo::new("Alice");
        let doc_id = Uuid::new_v4();
        let mut inner = state(&peer);
        handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "abc", 0));
        let sub = inner
            .reconciler
            .apply_local_operation(Operation::insert(3, "d", peer.peer_id, 1))
            .unwrap()
            .unwrap();

        let reject = SyncMessage::reject(
            peer.peer_id,
            doc_id,
            &Rejection {
                submission_id: sub.id,
                reason: "bad".into(),
            },
        )
        .unwrap();
        let handled = handle_message(&mut inner, &peer, doc_id, reject);
        assert_eq!(handled.outgoing[0].msg_type, MessageType::Join);
        assert!(matches!(handled.events[0], SyncEvent::Rejected(_)));

        // The full snapshot that follows drops the refused edit.
        let handled = handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "abc", 0));
        assert!(matches!(handled.events[1], SyncEvent::Resynced { discarded: 1 }));
        assert_eq!(inner.reconciler.document().as_str(), "abc");
        assert_eq!(inner.reconciler.pending_len(), 0);
    }

    #[test]
    fn test_catch_up_entries_resend_head() {
        let peer = PeerInfo::new("Alice");
        let doc_id = Uuid::new_v4();
        let mut inner = state(&peer);
        handle_message(&mut inner, &peer, doc_id, snapshot(doc_id, "ab", 0));
        let sub = inner
            .reconciler
            .apply_local_operation(Operation::insert(2, "!", peer.peer_id, 1))
            .unwrap()
            .unwrap();

        // Reconnect: the server reports one remote entry we missed.
        let other = Uuid::new_v4();
        let reply = SyncMessage::snapshot(
            doc_id,
            &JoinReply {
                catch_up: CatchUp {
                    document: None,
                    epoch: epoch(),
                    version: 1,
                    entries: vec![Sequenced {
                        operation: Operation::insert(0, ">", other, 1),
                        version: 1,
                        client_id: Some(other),
                        submission_id: Some(Uuid::new_v4()),
                    }],
                },
                peers: Vec::new(),
            },
        )
        .unwrap();
        let handled = handle_message(&mut inner, &peer, doc_id, reply);

        assert_eq!(inner.reconciler.document().as_str(), ">ab!");
        let resent = handled.outgoing[0].submission().unwrap();
        assert_eq!(resent.id, sub.id);
        assert_eq!(resent, sub);
    }
}
