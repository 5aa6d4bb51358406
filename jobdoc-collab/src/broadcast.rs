//! Fan-out of encoded frames to the connections of one session.
//!
//! Every connection owns a bounded outbound queue drained by its own socket
//! task. Delivery here is a non-blocking `try_send`, so a slow or dead socket
//! never holds up the session: a full or closed queue counts as a transport
//! failure and the peer is detached on the spot.
//!
//! ```text
//!               ┌─► queue ─► socket task (conn A)
//! frame (Arc) ──┼─► queue ─► socket task (conn B)
//!               └─► queue ✗  full/closed → Dropped
//! ```

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::{ConnectionId, Frame};

/// A connection attached to a session.
#[derive(Debug)]
pub struct Peer {
    pub user_id: String,
    pub cursor_position: Option<usize>,
    outbound: mpsc::Sender<Frame>,
}

/// Why a peer was detached during delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The outbound queue is full; the socket is not keeping up.
    Lagging,
    /// The socket task is gone.
    Closed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lagging => write!(f, "outbound queue full"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

/// A peer removed because a send to it failed.
#[derive(Debug)]
pub struct Dropped {
    pub connection: ConnectionId,
    pub peer: Peer,
    pub reason: DropReason,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// The set of connections attached to one session.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, Peer>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection with its outbound queue.
    pub fn add_peer(
        &mut self,
        connection: ConnectionId,
        user_id: impl Into<String>,
        outbound: mpsc::Sender<Frame>,
    ) {
        self.peers.insert(
            connection,
            Peer {
                user_id: user_id.into(),
                cursor_position: None,
                outbound,
            },
        );
    }

    /// Detach a connection. Dropping the peer closes its queue.
    pub fn remove_peer(&mut self, connection: &ConnectionId) -> Option<Peer> {
        self.peers.remove(connection)
    }

    pub fn peer(&self, connection: &ConnectionId) -> Option<&Peer> {
        self.peers.get(connection)
    }

    pub fn has_peer(&self, connection: &ConnectionId) -> bool {
        self.peers.contains_key(connection)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    /// Record a connection's cursor. Returns `false` for unknown connections.
    pub fn set_cursor(&mut self, connection: &ConnectionId, position: Option<usize>) -> bool {
        match self.peers.get_mut(connection) {
            Some(peer) => {
                peer.cursor_position = position;
                true
            }
            None => false,
        }
    }

    /// Queue a frame for one connection.
    ///
    /// On failure the peer is detached and returned.
    pub fn send_to(&mut self, connection: ConnectionId, frame: &Frame) -> Option<Dropped> {
        let result = self.peers.get(&connection)?.outbound.try_send(frame.clone());
        self.settle(connection, result)
    }

    /// Queue a frame for every connection except `exclude`.
    ///
    /// Failing peers are detached and returned; delivery to the rest continues.
    pub fn broadcast(&mut self, frame: &Frame, exclude: Option<ConnectionId>) -> Vec<Dropped> {
        let targets: Vec<ConnectionId> = self
            .peers
            .keys()
            .copied()
            .filter(|c| Some(*c) != exclude)
            .collect();

        targets
            .into_iter()
            .filter_map(|connection| {
                let result = self.peers.get(&connection)?.outbound.try_send(frame.clone());
                self.settle(connection, result)
            })
            .collect()
    }

    fn settle(
        &mut self,
        connection: ConnectionId,
        result: Result<(), TrySendError<Frame>>,
    ) -> Option<Dropped> {
        let reason = match result {
            Ok(()) => {
                self.messages_sent += 1;
                return None;
            }
            Err(TrySendError::Full(_)) => DropReason::Lagging,
            Err(TrySendError::Closed(_)) => DropReason::Closed,
        };
        self.messages_dropped += 1;
        let peer = self.peers.remove(&connection)?;
        Some(Dropped {
            connection,
            peer,
            reason,
        })
    }

    /// Detach every peer, closing all outbound queues.
    pub fn close_all(&mut self) -> Vec<(ConnectionId, Peer)> {
        self.peers.drain().collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.peers.len(),
        }
    }
}
