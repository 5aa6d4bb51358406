//! WebSocket sync client for editing a shared document.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - A local replica that stays responsive while edits are in flight
//! - Cursor and ping messages
//!
//! The replica follows the usual OT client discipline: at most one operation
//! is awaiting acknowledgement, later local edits wait in a buffer (merged
//! where possible), and remote operations are transformed past both before
//! they are applied locally. Remote operations win ties, matching the
//! server's rebasing, so every replica lands on the server's text.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use jobdoc_ot::{apply, compose, transform, Composed, Operation, OtError, TieBreak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{CollabError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::ConnectRequest;

/// Local replica of a session's document.
#[derive(Debug, Clone, Default)]
pub struct ClientDocument {
    text: String,
    /// Last server sequence reflected in `text`
    revision: u64,
    in_flight: Option<Operation>,
    buffer: VecDeque<Operation>,
    diverged: bool,
}

impl ClientDocument {
    pub fn new(text: impl Into<String>, revision: u64) -> Self {
        Self {
            text: text.into(),
            revision,
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn in_flight(&self) -> Option<&Operation> {
        self.in_flight.as_ref()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether local edits are still waiting for the server.
    pub fn has_pending(&self) -> bool {
        self.in_flight.is_some() || !self.buffer.is_empty()
    }

    /// Whether a rejected edit left this replica out of step with the server.
    pub fn is_diverged(&self) -> bool {
        self.diverged
    }

    /// Apply a local edit. Returns the message to send, if one is due now.
    pub fn edit(&mut self, op: Operation) -> std::result::Result<Option<ClientMessage>, OtError> {
        self.text = apply(&self.text, &op)?;
        if op.is_noop() {
            return Ok(None);
        }

        if self.in_flight.is_none() {
            self.in_flight = Some(op.clone());
            return Ok(Some(ClientMessage::operation(op, self.revision)));
        }

        match self.buffer.back().and_then(|last| compose(last, &op)) {
            Some(Composed::Op(merged)) => {
                if let Some(last) = self.buffer.back_mut() {
                    *last = merged;
                }
            }
            Some(Composed::Noop) => {
                self.buffer.pop_back();
            }
            None => self.buffer.push_back(op),
        }
        Ok(None)
    }

    /// Integrate another participant's operation.
    ///
    /// Returns the operation as applied to the local text. Nothing changes
    /// on error.
    pub fn receive_remote(
        &mut self,
        op: &Operation,
        sequence_number: u64,
    ) -> std::result::Result<Operation, OtError> {
        let mut remote = op.clone();

        let in_flight = match &self.in_flight {
            Some(pending) => {
                let (pending, rebased) = transform(pending, &remote, TieBreak::Right);
                remote = rebased;
                Some(pending)
            }
            None => None,
        };

        let mut buffer = VecDeque::with_capacity(self.buffer.len());
        for pending in &self.buffer {
            let (pending, rebased) = transform(pending, &remote, TieBreak::Right);
            remote = rebased;
            buffer.push_back(pending);
        }

        self.text = apply(&self.text, &remote)?;
        self.in_flight = in_flight;
        self.buffer = buffer;
        self.revision = sequence_number;
        Ok(remote)
    }

    /// The in-flight operation was accepted as `sequence_number`.
    ///
    /// Returns the next buffered edit to send, if any.
    pub fn acknowledge(&mut self, sequence_number: u64) -> Option<ClientMessage> {
        self.in_flight = None;
        self.revision = sequence_number;
        self.flush()
    }

    /// The in-flight operation was refused by the server.
    ///
    /// Its effect stays in the local text, so the replica is marked as
    /// diverged until the next [`resync`](Self::resync).
    pub fn reject(&mut self) -> Option<ClientMessage> {
        if self.in_flight.take().is_some() {
            self.diverged = true;
        }
        self.flush()
    }

    /// Replace local state with the server's.
    pub fn resync(&mut self, text: impl Into<String>, revision: u64) {
        *self = Self::new(text, revision);
    }

    fn flush(&mut self) -> Option<ClientMessage> {
        let next = self.buffer.pop_front()?;
        self.in_flight = Some(next.clone());
        Some(ClientMessage::operation(next, self.revision))
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Initial document state received on join
    SessionState {
        document: String,
        participants: Vec<String>,
        sequence: u64,
    },
    /// Another participant's edit, as applied locally
    RemoteOperation {
        user_id: String,
        operation: Operation,
        sequence_number: u64,
    },
    /// Our in-flight edit was accepted
    Acknowledged { sequence_number: u64 },
    /// Our in-flight edit was refused
    Rejected { error: String },
    UserJoined(String),
    UserLeft(String),
    RemoteCursor {
        user_id: String,
        position: Option<usize>,
    },
    Pong,
    /// A remote operation could not be applied locally
    Desynchronized(String),
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server and keeps the
/// local replica in step with it.
pub struct SyncClient {
    request: ConnectRequest,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    document: Arc<Mutex<ClientDocument>>,
    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client for `server_url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(request: ConnectRequest, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            request,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            document: Arc::new(Mutex::new(ClientDocument::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<()> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.request.to_url(&self.server_url)?;
        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(CollabError::TransportFailure(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        // The reader only holds a weak handle so that disconnect() closes the writer
        let reply_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!(
            "Connected to session {} as {}",
            self.request.session_id,
            self.request.user_id
        );

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let document = self.document.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(message) => {
                            let event = Self::integrate(message, &document, &reply_tx).await;
                            if let Some(evt) = event {
                                let _ = event_tx.send(evt).await;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Fold one server message into the replica.
    async fn integrate(
        message: ServerMessage,
        document: &Mutex<ClientDocument>,
        out_tx: &mpsc::WeakSender<String>,
    ) -> Option<SyncEvent> {
        let mut doc = document.lock().await;
        let (event, next) = match message {
            ServerMessage::SessionState {
                document_state,
                participants,
                operation_count,
                ..
            } => {
                doc.resync(document_state.clone(), operation_count);
                let event = SyncEvent::SessionState {
                    document: document_state,
                    participants,
                    sequence: operation_count,
                };
                (event, None)
            }
            ServerMessage::Operation(envelope) => {
                match doc.receive_remote(&envelope.operation, envelope.sequence_number) {
                    Ok(operation) => (
                        SyncEvent::RemoteOperation {
                            user_id: envelope.user_id,
                            operation,
                            sequence_number: envelope.sequence_number,
                        },
                        None,
                    ),
                    Err(e) => {
                        log::warn!("Remote operation {} does not apply: {e}", envelope.sequence_number);
                        (SyncEvent::Desynchronized(e.to_string()), None)
                    }
                }
            }
            ServerMessage::OperationAck {
                sequence_number, ..
            } => {
                let next = doc.acknowledge(sequence_number);
                (SyncEvent::Acknowledged { sequence_number }, next)
            }
            ServerMessage::OperationError { error } => {
                log::warn!("Server rejected operation: {error}");
                let next = doc.reject();
                (SyncEvent::Rejected { error }, next)
            }
            ServerMessage::UserJoined { user_id, .. } => (SyncEvent::UserJoined(user_id), None),
            ServerMessage::UserLeft { user_id, .. } => (SyncEvent::UserLeft(user_id), None),
            ServerMessage::CursorUpdate { user_id, position } => {
                (SyncEvent::RemoteCursor { user_id, position }, None)
            }
            ServerMessage::Pong { .. } => (SyncEvent::Pong, None),
        };

        if let Some(message) = next {
            // Sent while holding the replica so queue order matches edit order
            match (message.encode(), out_tx.upgrade()) {
                (Ok(text), Some(tx)) => {
                    let _ = tx.send(text).await;
                }
                (Ok(_), None) => log::debug!("Disconnected, buffered operation not sent"),
                (Err(e), _) => log::error!("Failed to encode buffered operation: {e}"),
            }
        }
        Some(event)
    }

    /// Apply a local edit and send it when no other edit is in flight.
    pub async fn edit(&self, op: Operation) -> Result<()> {
        let tx = self.sender().await?;
        let mut doc = self.document.lock().await;
        if let Some(message) = doc.edit(op)? {
            tx.send(message.encode()?)
                .await
                .map_err(|_| CollabError::TransportFailure("connection closed".into()))?;
        }
        Ok(())
    }

    /// Send a cursor position (or `None` to clear it).
    pub async fn send_cursor(&self, position: Option<usize>) -> Result<()> {
        self.send(&ClientMessage::CursorUpdate { position }).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<()> {
        self.send(&ClientMessage::Ping { timestamp: None }).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let tx = self.sender().await?;
        tx.send(message.encode()?)
            .await
            .map_err(|_| CollabError::TransportFailure("connection closed".into()))
    }

    async fn sender(&self) -> Result<&mpsc::Sender<String>> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(CollabError::TransportFailure("not connected".into()));
        }
        self.outgoing_tx
            .as_ref()
            .ok_or_else(|| CollabError::TransportFailure("not connected".into()))
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current local text.
    pub async fn text(&self) -> String {
        self.document.lock().await.text().to_string()
    }

    /// Last server sequence reflected locally.
    pub async fn revision(&self) -> u64 {
        self.document.lock().await.revision()
    }

    /// Whether local edits are still waiting for the server.
    pub async fn has_pending(&self) -> bool {
        self.document.lock().await.has_pending()
    }

    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn unpack(message: ClientMessage) -> (Operation, u64) {
        match message {
            ClientMessage::Operation {
                operation,
                base_sequence,
            } => (operation, base_sequence),
            other => panic!("expected operation, got {other:?}"),
        }
    }

    #[test]
    fn test_first_edit_is_sent_later_edits_buffer() {
        let mut doc = ClientDocument::new("hello", 3);

        let sent = doc.edit(Operation::insert(5, "!")).unwrap().unwrap();
        assert_eq!(unpack(sent), (Operation::insert(5, "!"), 3));

        assert!(doc.edit(Operation::insert(6, "?")).unwrap().is_none());
        assert!(doc.edit(Operation::insert(7, "?")).unwrap().is_none());
        assert_eq!(doc.text(), "hello!??");
        assert_eq!(doc.buffered(), 1);

        let next = doc.acknowledge(4).unwrap();
        assert_eq!(unpack(next), (Operation::insert(6, "??"), 4));
        assert_eq!(doc.buffered(), 0);
        assert!(doc.acknowledge(5).is_none());
        assert!(!doc.has_pending());
    }

    #[test]
    fn test_buffered_edits_cancel_out() {
        let mut doc = ClientDocument::new("abc", 0);
        doc.edit(Operation::insert(0, "x")).unwrap();
        doc.edit(Operation::insert(1, "y")).unwrap();
        doc.edit(Operation::delete(1, 2)).unwrap();

        assert_eq!(doc.text(), "xabc");
        assert_eq!(doc.buffered(), 0);
        assert!(doc.has_pending());
    }

    #[test]
    fn test_invalid_local_edit_is_refused() {
        let mut doc = ClientDocument::new("abc", 0);
        assert!(doc.edit(Operation::insert(4, "x")).is_err());
        assert_eq!(doc.text(), "abc");
        assert!(!doc.has_pending());
    }

    #[test]
    fn test_remote_wins_tie_with_in_flight() {
        let mut doc = ClientDocument::new("ABCDEFGHIJ", 0);
        doc.edit(Operation::insert(5, "Y")).unwrap();

        let applied = doc.receive_remote(&Operation::insert(5, "X"), 1).unwrap();
        assert_eq!(applied, Operation::insert(5, "X"));
        assert_eq!(doc.text(), "ABCDEXYFGHIJ");
        assert_eq!(doc.in_flight(), Some(&Operation::insert(6, "Y")));
        assert_eq!(doc.revision(), 1);
    }

    #[test]
    fn test_remote_rebased_past_buffer() {
        let mut doc = ClientDocument::new("0123456789", 0);
        doc.edit(Operation::insert(0, "a")).unwrap();
        doc.edit(Operation::delete(5, 7)).unwrap();
        assert_eq!(doc.text(), "a01236789");

        let applied = doc.receive_remote(&Operation::insert(9, "Z"), 1).unwrap();
        assert_eq!(applied, Operation::insert(8, "Z"));
        assert_eq!(doc.text(), "a0123678Z9");
    }

    #[test]
    fn test_reject_marks_divergence_and_flushes() {
        let mut doc = ClientDocument::new("abc", 0);
        doc.edit(Operation::insert(0, "x")).unwrap();
        doc.edit(Operation::delete(3, 4)).unwrap();

        let next = doc.reject().unwrap();
        assert_eq!(unpack(next), (Operation::delete(3, 4), 0));
        assert!(doc.is_diverged());

        doc.resync("abc", 7);
        assert!(!doc.is_diverged());
        assert!(!doc.has_pending());
        assert_eq!(doc.revision(), 7);
    }

    /// Two replicas against an authoritative session, messages delivered in
    /// the order the server queues them.
    #[test]
    fn test_replicas_converge_with_server() {
        let mut server = Session::new("s1", "job-1", "hello world");
        let mut a = ClientDocument::new("hello world", 0);
        let mut b = ClientDocument::new("hello world", 0);

        let a1 = a.edit(Operation::insert(0, "A")).unwrap().unwrap();
        let b1 = b.edit(Operation::insert(11, "B")).unwrap().unwrap();
        assert!(a.edit(Operation::insert(1, "a")).unwrap().is_none());
        assert!(b.edit(Operation::delete(0, 5)).unwrap().is_none());

        let (op, base) = unpack(a1);
        let env1 = server.submit(op, base, "a").unwrap();
        let (op, base) = unpack(b1);
        let env2 = server.submit(op, base, "b").unwrap();

        // a: ack 1, then b's op; b: a's op, then ack 2
        let a2 = a.acknowledge(env1.sequence_number).unwrap();
        a.receive_remote(&env2.operation, env2.sequence_number).unwrap();
        b.receive_remote(&env1.operation, env1.sequence_number).unwrap();
        let b2 = b.acknowledge(env2.sequence_number).unwrap();

        let (op, base) = unpack(a2);
        let env3 = server.submit(op, base, "a").unwrap();
        let (op, base) = unpack(b2);
        let env4 = server.submit(op, base, "b").unwrap();

        assert!(a.acknowledge(env3.sequence_number).is_none());
        a.receive_remote(&env4.operation, env4.sequence_number).unwrap();
        b.receive_remote(&env3.operation, env3.sequence_number).unwrap();
        assert!(b.acknowledge(env4.sequence_number).is_none());

        assert_eq!(server.document(), "Aa worldB");
        assert_eq!(a.text(), server.document());
        assert_eq!(b.text(), server.document());
        assert_eq!(a.revision(), 4);
        assert_eq!(b.revision(), 4);
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(
            ConnectRequest::new("s1", "alice", "job-1"),
            "ws://localhost:9090",
        );
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.text().await, "");
        assert!(!client.has_pending().await);
    }

    #[tokio::test]
    async fn test_edit_requires_connection() {
        let client = SyncClient::new(
            ConnectRequest::new("s1", "alice", "job-1"),
            "ws://localhost:9090",
        );
        assert!(matches!(
            client.edit(Operation::insert(0, "x")).await,
            Err(CollabError::TransportFailure(_))
        ));
        assert!(client.send_ping().await.is_err());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(
            ConnectRequest::new("s1", "alice", "job-1"),
            "ws://localhost:9090",
        );
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
