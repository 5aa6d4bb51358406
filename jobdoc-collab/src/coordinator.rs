//! Binds transport connections to sessions and routes their messages.
//!
//! ```text
//! socket task ──text──► handle_text ──► on_message ──► Room (locked)
//!      ▲                                                 │ session.submit
//!      │                                                 │ peers.broadcast (try_send)
//!      └──────────── outbound queue (Frame) ◄────────────┘
//! ```
//!
//! The coordinator never writes to a socket. It queues encoded frames while
//! holding the room lock, so every participant sees operations in sequence
//! order, and each connection's own task does the actual I/O. A connection
//! whose queue is full or closed is detached on the spot and handled exactly
//! like a disconnect.
//!
//! Lock order: registry map → room → connection table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::broadcast::Dropped;
use crate::documents::DocumentSource;
use crate::error::{CollabError, Result};
use crate::protocol::{ClientMessage, ConnectionId, Frame, ServerMessage};
use crate::registry::{Room, RoomHandle, SessionRegistry, SessionSummary};
use crate::session::{Session, SessionSnapshot, DEFAULT_HISTORY_LIMIT};

/// Default number of frames buffered per connection before it counts as lagging.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct ConnectionRecord {
    session_id: String,
    user_id: String,
}

/// A registered connection, as seen from outside.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: ConnectionId,
    pub session_id: String,
    pub user_id: String,
    pub cursor_position: Option<usize>,
}

/// Protocol-level orchestration between connections and sessions.
pub struct ConnectionCoordinator {
    registry: SessionRegistry,
    documents: Arc<dyn DocumentSource>,
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
    outbound_capacity: usize,
}

impl ConnectionCoordinator {
    pub fn new(documents: Arc<dyn DocumentSource>) -> Self {
        Self {
            registry: SessionRegistry::new(DEFAULT_HISTORY_LIMIT),
            documents,
            connections: RwLock::new(HashMap::new()),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.registry = SessionRegistry::new(limit);
        self
    }

    /// Frames buffered per connection (minimum 1).
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register a connection and join it to `session_id`.
    ///
    /// The returned receiver yields every frame addressed to the connection,
    /// starting with `session_state`. It closes when the connection is
    /// dropped by the coordinator.
    pub async fn on_connect(
        &self,
        session_id: &str,
        user_id: &str,
        document_ref: &str,
    ) -> Result<(ConnectionId, mpsc::Receiver<Frame>)> {
        if session_id.is_empty() || user_id.is_empty() || document_ref.is_empty() {
            return Err(CollabError::BadRequest(
                "session_id, user_id and document_ref are required".into(),
            ));
        }
        if !self.documents.exists(document_ref) {
            log::warn!("Refusing {user_id}: unknown document {document_ref}");
            return Err(CollabError::UnknownSession(document_ref.to_string()));
        }

        let connection = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.outbound_capacity);

        loop {
            let handle = self
                .registry
                .try_get_or_create(session_id, document_ref, || {
                    self.documents.seed_text(document_ref)
                })
                .await
                .map_err(|e| {
                    log::error!("Refusing {user_id}: cannot load document {document_ref}: {e}");
                    CollabError::DocumentUnavailable(document_ref.to_string())
                })?;
            let mut room = handle.lock().await;
            if room.is_retired() {
                // Lost a race with remove_if_empty; resolve the id again.
                continue;
            }
            if room.session.document_ref() != document_ref {
                return Err(CollabError::BadRequest(format!(
                    "session {session_id} is editing {}",
                    room.session.document_ref()
                )));
            }

            let first_connection = room.session.join(user_id);
            room.peers.add_peer(connection, user_id, tx);

            let state = match session_state(&room.session).frame() {
                Ok(frame) => frame,
                Err(e) => {
                    room.peers.remove_peer(&connection);
                    room.session.leave(user_id);
                    drop(room);
                    self.registry.remove_if_empty(session_id).await;
                    return Err(e.into());
                }
            };

            self.connections.write().await.insert(
                connection,
                ConnectionRecord {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                },
            );

            let mut dropped: Vec<Dropped> = room.peers.send_to(connection, &state).into_iter().collect();
            if first_connection {
                let joined = ServerMessage::user_joined(user_id).frame()?;
                dropped.extend(room.peers.broadcast(&joined, Some(connection)));
            }

            log::info!(
                "User {user_id} joined session {session_id} via {connection} ({} participants)",
                room.session.participant_count()
            );

            let departed = settle(&mut room, dropped);
            drop(room);
            self.forget(session_id, departed).await;

            return Ok((connection, rx));
        }
    }

    /// Decode one inbound text frame and dispatch it.
    ///
    /// Malformed input is answered with `operation_error` to the sender only.
    pub async fn handle_text(&self, connection: ConnectionId, text: &str) -> Result<()> {
        match ClientMessage::decode(text) {
            Ok(message) => self.on_message(connection, message).await,
            Err(e) => {
                log::debug!("Malformed message from {connection}: {e}");
                self.reply(connection, &ServerMessage::error(e)).await
            }
        }
    }

    pub async fn on_message(&self, connection: ConnectionId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Operation {
                operation,
                base_sequence,
            } => self.submit(connection, operation, base_sequence).await,
            ClientMessage::CursorUpdate { position } => {
                let (record, handle) = self.resolve(connection).await?;
                let mut room = handle.lock().await;
                if !room.peers.set_cursor(&connection, position) {
                    return Err(CollabError::UnknownConnection(connection));
                }
                let frame = ServerMessage::CursorUpdate {
                    user_id: record.user_id.clone(),
                    position,
                }
                .frame()?;
                let dropped = room.peers.broadcast(&frame, Some(connection));
                let departed = settle(&mut room, dropped);
                drop(room);
                self.forget(&record.session_id, departed).await;
                Ok(())
            }
            ClientMessage::Ping { .. } => self.reply(connection, &ServerMessage::pong()).await,
        }
    }

    async fn submit(
        &self,
        connection: ConnectionId,
        operation: jobdoc_ot::Operation,
        base_sequence: u64,
    ) -> Result<()> {
        let (record, handle) = self.resolve(connection).await?;
        let mut room = handle.lock().await;
        if !room.peers.has_peer(&connection) {
            return Err(CollabError::UnknownConnection(connection));
        }

        let dropped = match room.session.submit(operation, base_sequence, &record.user_id) {
            Ok(envelope) => {
                log::debug!(
                    "Session {} sequence {}: {} by {}",
                    record.session_id,
                    envelope.sequence_number,
                    envelope.operation,
                    record.user_id
                );
                let ack = ServerMessage::ack(&envelope).frame()?;
                let broadcast = ServerMessage::Operation(envelope).frame()?;
                let mut dropped = room.peers.broadcast(&broadcast, Some(connection));
                dropped.extend(room.peers.send_to(connection, &ack));
                dropped
            }
            Err(rejection) => {
                log::warn!(
                    "Rejected operation from {} in session {}: {rejection}",
                    record.user_id,
                    record.session_id
                );
                let error = ServerMessage::error(rejection).frame()?;
                room.peers.send_to(connection, &error).into_iter().collect()
            }
        };

        let departed = settle(&mut room, dropped);
        drop(room);
        self.forget(&record.session_id, departed).await;
        Ok(())
    }

    /// Send a message to one connection.
    async fn reply(&self, connection: ConnectionId, message: &ServerMessage) -> Result<()> {
        let (record, handle) = self.resolve(connection).await?;
        let frame = message.frame()?;
        let mut room = handle.lock().await;
        let dropped = room.peers.send_to(connection, &frame).into_iter().collect();
        let departed = settle(&mut room, dropped);
        drop(room);
        self.forget(&record.session_id, departed).await;
        Ok(())
    }

    /// Leave the session, notify the others and clean up. Idempotent.
    ///
    /// Returns `false` when the connection was not registered.
    pub async fn on_disconnect(&self, connection: ConnectionId) -> bool {
        let Some(record) = self.connections.write().await.remove(&connection) else {
            return false;
        };

        if let Some(handle) = self.registry.get(&record.session_id).await {
            let mut room = handle.lock().await;
            // The peer is gone already when a failed send detached it.
            if room.peers.remove_peer(&connection).is_some() {
                let mut dropped = Vec::new();
                if room.session.leave(&record.user_id) {
                    match ServerMessage::user_left(&record.user_id).frame() {
                        Ok(frame) => dropped = room.peers.broadcast(&frame, None),
                        Err(e) => log::error!("Failed to encode user_left: {e}"),
                    }
                }
                log::info!(
                    "User {} left session {} via {connection}",
                    record.user_id,
                    record.session_id
                );
                let departed = settle(&mut room, dropped);
                drop(room);
                self.forget(&record.session_id, departed).await;
            }
        }

        self.registry.remove_if_empty(&record.session_id).await;
        true
    }

    /// Send a message to every connection of a session except `exclude`.
    ///
    /// Connections whose send fails are dropped; the rest are still served.
    pub async fn broadcast(
        &self,
        session_id: &str,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<()> {
        let handle = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| CollabError::UnknownSession(session_id.to_string()))?;
        let frame = message.frame()?;

        let mut room = handle.lock().await;
        let dropped = room.peers.broadcast(&frame, exclude);
        let departed = settle(&mut room, dropped);
        drop(room);
        self.forget(session_id, departed).await;
        Ok(())
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.registry.snapshot(session_id).await
    }

    /// The `session_state` message a joining connection would receive now.
    pub async fn session_state(&self, session_id: &str) -> Option<ServerMessage> {
        let handle = self.registry.get(session_id).await?;
        let room = handle.lock().await;
        Some(session_state(&room.session))
    }

    pub async fn active_sessions(&self) -> Vec<SessionSummary> {
        self.registry.active_sessions().await
    }

    pub async fn connection(&self, connection: ConnectionId) -> Option<Connection> {
        let (record, handle) = self.resolve(connection).await.ok()?;
        let room = handle.lock().await;
        let peer = room.peers.peer(&connection)?;
        Some(Connection {
            id: connection,
            session_id: record.session_id,
            user_id: record.user_id,
            cursor_position: peer.cursor_position,
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Close every connection and drop every session.
    ///
    /// Returns the number of connections closed.
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for handle in self.registry.shutdown().await {
            closed += handle.lock().await.peers.close_all().len();
        }
        self.connections.write().await.clear();
        log::info!("Coordinator shut down, {closed} connections closed");
        closed
    }

    async fn resolve(&self, connection: ConnectionId) -> Result<(ConnectionRecord, RoomHandle)> {
        let record = self
            .connections
            .read()
            .await
            .get(&connection)
            .cloned()
            .ok_or(CollabError::UnknownConnection(connection))?;
        let handle = self
            .registry
            .get(&record.session_id)
            .await
            .ok_or(CollabError::UnknownConnection(connection))?;
        Ok((record, handle))
    }

    /// Forget connections detached by failed sends, then try to retire the session.
    async fn forget(&self, session_id: &str, departed: Vec<ConnectionId>) {
        if departed.is_empty() {
            return;
        }
        {
            let mut connections = self.connections.write().await;
            for connection in &departed {
                connections.remove(connection);
            }
        }
        self.registry.remove_if_empty(session_id).await;
    }
}

fn session_state(session: &Session) -> ServerMessage {
    ServerMessage::SessionState {
        session_id: session.id().to_string(),
        document_ref: session.document_ref().to_string(),
        document_state: session.document().to_string(),
        participants: session.participants(),
        operation_count: session.sequence(),
    }
}

/// Treat every detached peer as a disconnect.
///
/// Announcing a departure can itself detach more peers, so this runs until
/// no failures remain. Returns every connection that left.
fn settle(room: &mut Room, dropped: Vec<Dropped>) -> Vec<ConnectionId> {
    let mut pending = dropped;
    let mut departed = Vec::new();

    while let Some(Dropped {
        connection,
        peer,
        reason,
    }) = pending.pop()
    {
        log::warn!(
            "Transport failure for {} ({connection}) in session {}: {reason}",
            peer.user_id,
            room.session.id()
        );
        departed.push(connection);
        if room.session.leave(&peer.user_id) {
            match ServerMessage::user_left(&peer.user_id).frame() {
                Ok(frame) => pending.extend(room.peers.broadcast(&frame, None)),
                Err(e) => log::error!("Failed to encode user_left: {e}"),
            }
        }
    }
    departed
}
