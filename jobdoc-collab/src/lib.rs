//! # jobdoc-collab — Real-time co-editing of job description documents
//!
//! Several people edit the same plain-text document at once. The server holds
//! the authoritative copy per session, orders every edit, rebases late edits
//! with operational transformation and fans the result out to everyone else.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer           │
//! │ (per user)  │     JSON frames    │ (socket task / conn) │
//! └──────┬──────┘                    └──────────┬───────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌─────────────┐                    ┌──────────────────────┐
//! │ Client      │                    │ ConnectionCoordinator│
//! │ Document    │                    └──────────┬───────────┘
//! └─────────────┘                               │
//!                                    ┌──────────┴───────────┐
//!                                    │ SessionRegistry      │
//!                                    │  └─ Room (locked)    │
//!                                    │      ├─ Session      │
//!                                    │      └─ Broadcast    │
//!                                    └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`session`] — authoritative document state and `submit`
//! - [`registry`] — session lifecycle, one lock per session
//! - [`broadcast`] — fan-out into per-connection queues
//! - [`coordinator`] — connect, message and disconnect handling
//! - [`documents`] — seed text lookup for new sessions
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with a local replica

pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod documents;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, DropReason};
pub use client::{ClientDocument, ConnectionState, SyncClient, SyncEvent};
pub use coordinator::{Connection, ConnectionCoordinator, DEFAULT_OUTBOUND_CAPACITY};
pub use documents::{AnyDocument, DirectoryDocuments, DocumentSource, InMemoryDocuments};
pub use error::{CollabError, Result};
pub use protocol::{
    ClientMessage, ConnectionId, Frame, OperationEnvelope, ProtocolError, ServerMessage,
};
pub use registry::{Room, SessionRegistry, SessionSummary};
pub use server::{ConnectRequest, ServerConfig, ServerStats, SyncServer};
pub use session::{Rejection, Session, SessionSnapshot, DEFAULT_HISTORY_LIMIT};
