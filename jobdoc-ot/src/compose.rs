//! Merging two back-to-back operations from the same author.
//!
//! `compose(first, second)` is only valid when `second` was produced against
//! the document that results from `first`, with nothing in between. It is an
//! optimisation for keeping queues short; correctness never depends on it.

use crate::operation::{char_len, Operation};

/// Result of a successful composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composed {
    /// A single operation equivalent to both.
    Op(Operation),
    /// The two operations cancel out.
    Noop,
}

/// Compose `first` followed by `second` into one operation, if possible.
///
/// Returns `None` when the pair has no single-operation equivalent.
pub fn compose(first: &Operation, second: &Operation) -> Option<Composed> {
    if first.is_noop() {
        return Some(if second.is_noop() {
            Composed::Noop
        } else {
            Composed::Op(second.clone())
        });
    }
    if second.is_noop() {
        return Some(Composed::Op(first.clone()));
    }

    match (first, second) {
        (
            Operation::Insert { position: p, text: t1 },
            Operation::Insert { position: q, text: t2 },
        ) => {
            if *q < *p || *q > p + char_len(t1) {
                return None;
            }
            let merged = splice(t1, q - p, t2);
            Some(Composed::Op(Operation::insert(*p, merged)))
        }

        (Operation::Insert { position: p, text }, Operation::Delete { start, end }) => {
            if *start < *p || *end > p + char_len(text) {
                return None;
            }
            let rest = remove_chars(text, start - p, end - p);
            if rest.is_empty() {
                Some(Composed::Noop)
            } else {
                Some(Composed::Op(Operation::insert(*p, rest)))
            }
        }

        (
            Operation::Delete { start: s1, end: e1 },
            Operation::Delete { start: s2, end: e2 },
        ) => {
            if s2 == s1 {
                // forward delete: second range starts where the first one collapsed
                Some(Composed::Op(Operation::delete(*s1, e1 + (e2 - s2))))
            } else if e2 == s1 {
                // backspace
                Some(Composed::Op(Operation::delete(*s2, *e1)))
            } else {
                None
            }
        }

        (Operation::Delete { .. }, Operation::Insert { .. }) => None,
    }
}

fn splice(text: &str, at: usize, insert: &str) -> String {
    let mut out = String::with_capacity(text.len() + insert.len());
    out.extend(text.chars().take(at));
    out.push_str(insert);
    out.extend(text.chars().skip(at));
    out
}

fn remove_chars(text: &str, from: usize, to: usize) -> String {
    text.chars()
        .enumerate()
        .filter(|(i, _)| *i < from || *i >= to)
        .map(|(_, c)| c)
        .collect()
}
