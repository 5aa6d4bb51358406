//! The atomic edit primitive.
//!
//! Offsets are counted in characters (Unicode scalar values), never bytes,
//! so that every participant agrees on positions regardless of encoding.
//!
//! Wire shape (JSON, tagged by `type`):
//! ```text
//! {"type":"insert","position":5,"text":"X"}
//! {"type":"delete","start":0,"end":5}
//! ```

use serde::{Deserialize, Serialize};

/// A single edit against a plain character sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Insert `text` at character offset `position`.
    Insert { position: usize, text: String },
    /// Remove the half-open character range `[start, end)`.
    Delete { start: usize, end: usize },
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(start: usize, end: usize) -> Self {
        Self::Delete { start, end }
    }

    /// Check applicability against a document of `len` characters.
    pub fn check(&self, len: usize) -> Result<(), OtError> {
        match *self {
            Self::Insert { position, .. } => {
                if position > len {
                    return Err(OtError::InsertOutOfRange { position, len });
                }
            }
            Self::Delete { start, end } => {
                if start > end {
                    return Err(OtError::InvertedRange { start, end });
                }
                if end > len {
                    return Err(OtError::DeleteOutOfRange { start, end, len });
                }
            }
        }
        Ok(())
    }

    /// Number of characters this operation adds.
    pub fn inserted_len(&self) -> usize {
        match self {
            Self::Insert { text, .. } => char_len(text),
            Self::Delete { .. } => 0,
        }
    }

    /// Number of characters this operation removes.
    pub fn deleted_len(&self) -> usize {
        match *self {
            Self::Insert { .. } => 0,
            Self::Delete { start, end } => end.saturating_sub(start),
        }
    }

    /// Document length after applying this op to a document of `len` characters.
    ///
    /// Only meaningful for an applicable operation.
    pub fn resulting_len(&self, len: usize) -> usize {
        len + self.inserted_len() - self.deleted_len()
    }

    /// Document length before this op, given the length after it.
    pub fn preceding_len(&self, len: usize) -> usize {
        len + self.deleted_len() - self.inserted_len()
    }

    /// An empty insert or an empty delete.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { start, end } => start == end,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert { position, text } => write!(f, "insert({position}, {text:?})"),
            Self::Delete { start, end } => write!(f, "delete({start}..{end})"),
        }
    }
}

/// Reasons an operation cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    InsertOutOfRange { position: usize, len: usize },
    DeleteOutOfRange { start: usize, end: usize, len: usize },
    InvertedRange { start: usize, end: usize },
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsertOutOfRange { position, len } => {
                write!(f, "Insert position {position} out of range for length {len}")
            }
            Self::DeleteOutOfRange { start, end, len } => {
                write!(f, "Delete range {start}..{end} out of range for length {len}")
            }
            Self::InvertedRange { start, end } => {
                write!(f, "Delete range start {start} is after end {end}")
            }
        }
    }
}

impl std::error::Error for OtError {}

/// Length of `text` in characters.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Whether `op` is applicable to a document of `len` characters.
pub fn validate(op: &Operation, len: usize) -> bool {
    op.check(len).is_ok()
}

/// Apply `op` to `document`, returning the new text.
///
/// The operation is checked first; an inapplicable operation leaves the
/// input untouched and returns the reason.
pub fn apply(document: &str, op: &Operation) -> Result<String, OtError> {
    op.check(char_len(document))?;

    let out = match op {
        Operation::Insert { position, text } => {
            let at = byte_offset(document, *position);
            let mut out = String::with_capacity(document.len() + text.len());
            out.push_str(&document[..at]);
            out.push_str(text);
            out.push_str(&document[at..]);
            out
        }
        Operation::Delete { start, end } => {
            let from = byte_offset(document, *start);
            let to = byte_offset(document, *end);
            let mut out = String::with_capacity(document.len() - (to - from));
            out.push_str(&document[..from]);
            out.push_str(&document[to..]);
            out
        }
    };
    Ok(out)
}

/// Byte index of the `index`-th character; the end of the string when past it.
fn byte_offset(text: &str, index: usize) -> usize {
    text.char_indices()
        .nth(index)
        .map_or(text.len(), |(byte, _)| byte)
}
