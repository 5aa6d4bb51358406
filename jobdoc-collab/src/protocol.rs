//! JSON message protocol between editors and the collaboration server.
//!
//! One JSON object per WebSocket text frame, tagged by `type`:
//! ```text
//! client → server   operation | cursor_update | ping
//! server → client   operation | operation_ack | operation_error | session_state
//!                   user_joined | user_left | cursor_update | pong
//! ```
//!
//! Outbound messages are encoded once and shared between every receiving
//! connection as a [`Frame`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobdoc_ot::Operation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An encoded outbound message, shared across receivers.
pub type Frame = Arc<str>;

/// Identity of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An accepted operation, as broadcast to the other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    /// The operation after rebasing onto the session's history.
    pub operation: Operation,
    pub operation_id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Position of this operation in the session's total order (1-based).
    pub sequence_number: u64,
    /// Sequence the operation applies on top of (`sequence_number - 1`).
    pub base_sequence: u64,
}

/// Messages sent by editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Operation {
        operation: Operation,
        /// Last sequence the sender had seen when it authored `operation`.
        base_sequence: u64,
    },
    CursorUpdate {
        #[serde(default)]
        position: Option<usize>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<serde_json::Value>,
    },
}

impl ClientMessage {
    pub fn operation(operation: Operation, base_sequence: u64) -> Self {
        Self::Operation {
            operation,
            base_sequence,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Another participant's accepted operation.
    Operation(OperationEnvelope),
    /// The sender's own operation was accepted.
    OperationAck {
        operation_id: Uuid,
        sequence_number: u64,
    },
    /// The sender's operation was rejected; session state is unchanged.
    OperationError { error: String },
    /// Sent once to a joining connection.
    SessionState {
        session_id: String,
        document_ref: String,
        document_state: String,
        participants: Vec<String>,
        operation_count: u64,
    },
    UserJoined {
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    UserLeft {
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    CursorUpdate {
        user_id: String,
        position: Option<usize>,
    },
    Pong { timestamp: DateTime<Utc> },
}

impl ServerMessage {
    pub fn ack(envelope: &OperationEnvelope) -> Self {
        Self::OperationAck {
            operation_id: envelope.operation_id,
            sequence_number: envelope.sequence_number,
        }
    }

    pub fn error(reason: impl std::fmt::Display) -> Self {
        Self::OperationError {
            error: reason.to_string(),
        }
    }

    pub fn user_joined(user_id: impl Into<String>) -> Self {
        Self::UserJoined {
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user_left(user_id: impl Into<String>) -> Self {
        Self::UserLeft {
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Encode into a shareable frame.
    pub fn frame(&self) -> Result<Frame, ProtocolError> {
        self.encode().map(Frame::from)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Malformed message: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
