//! Session registry: maps session ids to live rooms.
//!
//! Each room pairs a [`Session`] with the [`BroadcastGroup`] of connections
//! editing it, behind one mutex per room. The registry map itself is only
//! locked for lookups, creation and removal, so rooms never wait on each other.
//!
//! Lock order is always registry map → room. The map lock is never held while
//! waiting for a room.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::broadcast::BroadcastGroup;
use crate::session::{Session, SessionSnapshot, DEFAULT_HISTORY_LIMIT};

/// A session plus the connections attached to it.
#[derive(Debug)]
pub struct Room {
    pub session: Session,
    pub peers: BroadcastGroup,
    retired: bool,
}

impl Room {
    fn new(session: Session) -> Self {
        Self {
            session,
            peers: BroadcastGroup::new(),
            retired: false,
        }
    }

    /// Whether the room has been removed from the registry.
    ///
    /// A retired room must not be joined; look the id up again instead.
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

/// Shared handle to a room.
pub type RoomHandle = Arc<Mutex<Room>>;

/// Summary row for the active-session listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub document_ref: String,
    pub participant_count: usize,
}

/// Owns every live session.
pub struct SessionRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    history_limit: usize,
}

impl SessionRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            history_limit,
        }
    }

    /// Get the room for `session_id`, creating it on first use.
    ///
    /// `seed` supplies the initial document text and is only called when a
    /// new session is created.
    pub async fn get_or_create<F>(&self, session_id: &str, document_ref: &str, seed: F) -> RoomHandle
    where
        F: FnOnce() -> String,
    {
        let created = self
            .try_get_or_create(session_id, document_ref, || Ok::<_, Infallible>(seed()))
            .await;
        match created {
            Ok(room) => room,
            Err(never) => match never {},
        }
    }

    /// Like [`get_or_create`](Self::get_or_create), with a seed that can fail.
    ///
    /// Nothing is registered when `seed` returns an error.
    pub async fn try_get_or_create<F, E>(
        &self,
        session_id: &str,
        document_ref: &str,
        seed: F,
    ) -> std::result::Result<RoomHandle, E>
    where
        F: FnOnce() -> std::result::Result<String, E>,
    {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(session_id) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(session_id) {
            return Ok(room.clone());
        }

        let session = Session::new(session_id, document_ref, seed()?)
            .with_history_limit(self.history_limit);
        log::info!("Session {session_id} created for document {document_ref}");
        let room = Arc::new(Mutex::new(Room::new(session)));
        rooms.insert(session_id.to_string(), room.clone());
        Ok(room)
    }

    pub async fn get(&self, session_id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(session_id).cloned()
    }

    /// Remove the session once it has no participants left.
    ///
    /// Waiting for a busy room happens outside the map lock, so lookups of
    /// other sessions proceed meanwhile.
    pub async fn remove_if_empty(&self, session_id: &str) -> bool {
        loop {
            let Some(handle) = self.get(session_id).await else {
                return false;
            };
            if handle.lock().await.session.has_participants() {
                return false;
            }

            let mut rooms = self.rooms.write().await;
            if !rooms.get(session_id).is_some_and(|r| Arc::ptr_eq(r, &handle)) {
                return false;
            }
            let Ok(mut room) = handle.try_lock() else {
                // Someone grabbed the room in between; check again.
                drop(rooms);
                tokio::task::yield_now().await;
                continue;
            };
            if room.session.has_participants() {
                return false;
            }
            room.retired = true;
            rooms.remove(session_id);
            log::info!(
                "Session {session_id} destroyed after {} operations",
                room.session.sequence()
            );
            return true;
        }
    }

    /// Read-only view of one session.
    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let handle = self.get(session_id).await?;
        let room = handle.lock().await;
        Some(room.session.snapshot())
    }

    pub async fn active_sessions(&self) -> Vec<SessionSummary> {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let room = handle.lock().await;
            if room.retired {
                continue;
            }
            summaries.push(SessionSummary {
                session_id: room.session.id().to_string(),
                document_ref: room.session.document_ref().to_string(),
                participant_count: room.session.participant_count(),
            });
        }
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    pub async fn session_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Retire and remove every session, returning their rooms.
    pub async fn shutdown(&self) -> Vec<RoomHandle> {
        let drained: Vec<RoomHandle> = self.rooms.write().await.drain().map(|(_, r)| r).collect();
        for handle in &drained {
            handle.lock().await.retired = true;
        }
        drained
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
