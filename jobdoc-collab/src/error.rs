//! Error types for the collaboration layer.

use std::fmt;

use jobdoc_ot::OtError;

use crate::protocol::{ConnectionId, ProtocolError};

/// Errors surfaced by the coordinator and server.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    /// Connect request for a document the store does not know.
    UnknownSession(String),
    /// The document exists but its stored text could not be loaded.
    DocumentUnavailable(String),
    /// Message for a connection that is not registered (already dropped).
    UnknownConnection(ConnectionId),
    /// A send to one connection failed; that connection has been dropped.
    TransportFailure(String),
    /// Malformed connect request (missing or invalid parameters).
    BadRequest(String),
    /// A local edit does not fit the document.
    InvalidOperation(OtError),
    Protocol(ProtocolError),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSession(document_ref) => write!(f, "Unknown document: {document_ref}"),
            Self::DocumentUnavailable(document_ref) => {
                write!(f, "Document unavailable: {document_ref}")
            }
            Self::UnknownConnection(id) => write!(f, "Unknown connection: {id}"),
            Self::TransportFailure(e) => write!(f, "Transport failure: {e}"),
            Self::BadRequest(e) => write!(f, "Bad request: {e}"),
            Self::InvalidOperation(e) => write!(f, "Invalid operation: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<OtError> for CollabError {
    fn from(e: OtError) -> Self {
        Self::InvalidOperation(e)
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Result type for collaboration operations.
pub type Result<T> = std::result::Result<T, CollabError>;
