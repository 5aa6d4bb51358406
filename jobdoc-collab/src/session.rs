//! Per-document authoritative editing state.
//!
//! A `Session` owns the document text, the sequence counter and a bounded
//! window of accepted operations. Every accepted operation gets the next
//! sequence number; `document` always equals the seed text with the accepted
//! operations applied in sequence order.
//!
//! ```text
//! submit(op, base) ──► rebase over history[base..sequence] ──► apply ──► sequence += 1
//!                                                                  │
//!                                                      history (last N ops)
//! ```
//!
//! `Session` itself is not synchronised; callers hold it behind one lock per
//! session (see [`crate::registry`]).

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use jobdoc_ot::{apply, char_len, transform_against_history, Operation, OtError};
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::OperationEnvelope;

/// Number of accepted operations retained for rebasing late submissions.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Why a submitted operation was refused. State is untouched in every case.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Position or range does not fit the document.
    InvalidOperation(OtError),
    /// The sender claims to have seen operations that were never accepted.
    UnknownBase { base_sequence: u64, sequence: u64 },
    /// The operations needed for rebasing have been evicted from history.
    HistoryUnavailable {
        base_sequence: u64,
        oldest_available: u64,
    },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOperation(e) => write!(f, "Invalid operation: {e}"),
            Self::UnknownBase {
                base_sequence,
                sequence,
            } => write!(
                f,
                "Invalid operation: base sequence {base_sequence} is ahead of session sequence {sequence}"
            ),
            Self::HistoryUnavailable {
                base_sequence,
                oldest_available,
            } => write!(
                f,
                "Base sequence {base_sequence} is older than retained history (oldest {oldest_available}); resync required"
            ),
        }
    }
}

impl std::error::Error for Rejection {}

/// Read-only view of a session for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub document_ref: String,
    pub document_state: String,
    pub participants: Vec<String>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

/// Authoritative state of one collaboratively edited document.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    document_ref: String,
    /// user_id → number of live connections for that user
    participants: BTreeMap<String, usize>,
    document: String,
    /// Cached character length of `document`
    document_len: usize,
    sequence: u64,
    history: VecDeque<Operation>,
    history_limit: usize,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Create a session seeded with the document's stored text.
    pub fn new(
        id: impl Into<String>,
        document_ref: impl Into<String>,
        seed: impl Into<String>,
    ) -> Self {
        let document = seed.into();
        Self {
            id: id.into(),
            document_ref: document_ref.into(),
            participants: BTreeMap::new(),
            document_len: char_len(&document),
            document,
            sequence: 0,
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            created_at: Utc::now(),
        }
    }

    /// Override the history bound (minimum 1).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn document_ref(&self) -> &str {
        &self.document_ref
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Document length in characters.
    pub fn len(&self) -> usize {
        self.document_len
    }

    pub fn is_empty(&self) -> bool {
        self.document_len == 0
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn history(&self) -> &VecDeque<Operation> {
        &self.history
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Distinct participating users, sorted.
    pub fn participants(&self) -> Vec<String> {
        self.participants.keys().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn has_participants(&self) -> bool {
        !self.participants.is_empty()
    }

    /// Register one more connection for `user_id`.
    ///
    /// Returns `true` when the user was not yet participating.
    pub fn join(&mut self, user_id: &str) -> bool {
        let connections = self.participants.entry(user_id.to_string()).or_insert(0);
        *connections += 1;
        *connections == 1
    }

    /// Drop one connection for `user_id`.
    ///
    /// Returns `true` when that was the user's last connection.
    pub fn leave(&mut self, user_id: &str) -> bool {
        match self.participants.get_mut(user_id) {
            Some(connections) if *connections > 1 => {
                *connections -= 1;
                false
            }
            Some(_) => {
                self.participants.remove(user_id);
                true
            }
            None => false,
        }
    }

    /// Accept an operation authored against `base_sequence`.
    ///
    /// The operation is checked against the document as the sender saw it,
    /// rebased over every operation accepted since, applied, and appended to
    /// history. Nothing changes unless every step succeeds.
    pub fn submit(
        &mut self,
        raw_op: Operation,
        base_sequence: u64,
        user_id: &str,
    ) -> Result<OperationEnvelope, Rejection> {
        if base_sequence > self.sequence {
            return Err(Rejection::UnknownBase {
                base_sequence,
                sequence: self.sequence,
            });
        }

        let missed = (self.sequence - base_sequence) as usize;
        if missed > self.history.len() {
            return Err(Rejection::HistoryUnavailable {
                base_sequence,
                oldest_available: self.sequence - self.history.len() as u64,
            });
        }

        let missed_ops = self.history.range(self.history.len() - missed..);
        let base_len = missed_ops
            .clone()
            .rev()
            .fold(self.document_len, |len, op| op.preceding_len(len));
        raw_op.check(base_len).map_err(Rejection::InvalidOperation)?;

        let op = if missed == 0 {
            raw_op
        } else {
            transform_against_history(&raw_op, missed_ops)
        };
        let next = apply(&self.document, &op).map_err(Rejection::InvalidOperation)?;

        self.document_len = op.resulting_len(self.document_len);
        self.document = next;
        self.history.push_back(op.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.sequence += 1;

        log::trace!(
            "session {} accepted {} from {} at sequence {}",
            self.id,
            op,
            user_id,
            self.sequence
        );

        Ok(OperationEnvelope {
            operation: op,
            operation_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            sequence_number: self.sequence,
            base_sequence: self.sequence - 1,
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            document_ref: self.document_ref.clone(),
            document_state: self.document.clone(),
            participants: self.participants(),
            sequence: self.sequence,
            created_at: self.created_at,
        }
    }
}
