//! Pairwise conflict resolution.
//!
//! `transform(a, b)` takes two operations authored against the same document
//! and returns `(a', b')` such that
//!
//! ```text
//! apply(apply(doc, a), b') == apply(apply(doc, b), a')
//! ```
//!
//! ## Boundary policy
//!
//! | Case                           | Result                                   |
//! |--------------------------------|------------------------------------------|
//! | insert at or before `start`    | insert kept, delete shifted right        |
//! | insert at or after `end`       | insert shifted left, delete kept         |
//! | insert strictly inside range   | delete widened over the inserted text,   |
//! |                                | insert emptied and moved to `start`      |
//! | overlapping deletes            | each loses the part the other removed    |
//!
//! The delete wins when an insert lands inside a concurrently removed range:
//! a single contiguous delete cannot remove the surrounding characters while
//! keeping text in the middle, so the inserted text goes with the range.

use crate::operation::Operation;

/// Which side counts as happening first when two inserts share a position.
///
/// Must be derived from a total order every participant agrees on (the server
/// uses acceptance order), otherwise replicas diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// The first argument of `transform` goes first.
    Left,
    /// The second argument of `transform` goes first.
    Right,
}

impl TieBreak {
    pub fn invert(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// Transform two concurrent operations against each other.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` applies after `a`.
pub fn transform(a: &Operation, b: &Operation, tie: TieBreak) -> (Operation, Operation) {
    match (a, b) {
        (
            Operation::Insert { position: pa, text: ta },
            Operation::Insert { position: pb, text: tb },
        ) => {
            let a_first = pa < pb || (pa == pb && tie == TieBreak::Left);
            if a_first {
                (a.clone(), Operation::insert(pb + a.inserted_len(), tb.clone()))
            } else {
                (Operation::insert(pa + b.inserted_len(), ta.clone()), b.clone())
            }
        }

        (Operation::Insert { position, text }, Operation::Delete { start, end }) => {
            transform_insert_delete(*position, text, *start, *end)
        }

        (Operation::Delete { .. }, Operation::Insert { .. }) => {
            let (b_prime, a_prime) = transform(b, a, tie.invert());
            (a_prime, b_prime)
        }

        (
            Operation::Delete { start: sa, end: ea },
            Operation::Delete { start: sb, end: eb },
        ) => {
            let a_prime = Operation::delete(
                map_through_delete(*sa, *sb, *eb),
                map_through_delete(*ea, *sb, *eb),
            );
            let b_prime = Operation::delete(
                map_through_delete(*sb, *sa, *ea),
                map_through_delete(*eb, *sa, *ea),
            );
            (a_prime, b_prime)
        }
    }
}

fn transform_insert_delete(
    position: usize,
    text: &str,
    start: usize,
    end: usize,
) -> (Operation, Operation) {
    let inserted = crate::operation::char_len(text);

    if position <= start {
        (
            Operation::insert(position, text),
            Operation::delete(start + inserted, end + inserted),
        )
    } else if position >= end {
        (
            Operation::insert(position - (end - start), text),
            Operation::delete(start, end),
        )
    } else {
        (
            Operation::insert(start, ""),
            Operation::delete(start, end + inserted),
        )
    }
}

/// Where offset `x` lands once `[start, end)` has been removed.
fn map_through_delete(x: usize, start: usize, end: usize) -> usize {
    if x <= start {
        x
    } else if x >= end {
        x - (end - start)
    } else {
        start
    }
}

/// Rebase `op` over operations that were accepted after it was authored.
///
/// Each history entry is treated as having happened first, so ties resolve in
/// favour of what the document already contains.
pub fn transform_against_history<'a, I>(op: &Operation, history: I) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    history.into_iter().fold(op.clone(), |current, accepted| {
        let (rebased, _) = transform(&current, accepted, TieBreak::Right);
        log::trace!("rebased {current} over {accepted} -> {rebased}");
        rebased
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{apply, validate, char_len};

    fn converge(doc: &str, a: &Operation, b: &Operation, tie: TieBreak) -> String {
        let (a_prime, b_prime) = transform(a, b, tie);
        let left = apply(&apply(doc, a).unwrap(), &b_prime).unwrap();
        let right = apply(&apply(doc, b).unwrap(), &a_prime).unwrap();
        assert_eq!(left, right, "diverged for {a} / {b} on {doc:?}");
        left
    }

    #[test]
    fn test_insert_insert_different_positions() {
        let a = Operation::insert(2, "ab");
        let b = Operation::insert(5, "Z");
        let (a_prime, b_prime) = transform(&a, &b, TieBreak::Left);
        assert_eq!(a_prime, a);
        assert_eq!(b_prime, Operation::insert(7, "Z"));
        assert_eq!(converge("0123456789", &a, &b, TieBreak::Left), "01ab234Z56789");
    }

    #[test]
    fn test_insert_insert_shift_uses_other_length() {
        let short = Operation::insert(5, "Z");
        let long = Operation::insert(2, "abcd");
        let (short_prime, long_prime) = transform(&short, &long, TieBreak::Left);
        assert_eq!(short_prime, Operation::insert(9, "Z"));
        assert_eq!(long_prime, long);
        assert_eq!(converge("0123456789", &short, &long, TieBreak::Left), "01abcd234Z56789");

        let (long_prime, short_prime) = transform(&long, &short, TieBreak::Right);
        assert_eq!(long_prime, long);
        assert_eq!(short_prime, Operation::insert(9, "Z"));
    }

    #[test]
    fn test_insert_insert_tie_with_different_lengths() {
        let a = Operation::insert(3, "xyz");
        let b = Operation::insert(3, "Q");
        assert_eq!(converge("0123456789", &a, &b, TieBreak::Left), "012xyzQ3456789");
        assert_eq!(converge("0123456789", &a, &b, TieBreak::Right), "012Qxyz3456789");
    }

    #[test]
    fn test_insert_insert_same_position_tie_break() {
        let a = Operation::insert(5, "X");
        let b = Operation::insert(5, "Y");

        assert_eq!(converge("ABCDEFGHIJ", &a, &b, TieBreak::Left), "ABCDEXYFGHIJ");
        assert_eq!(converge("ABCDEFGHIJ", &a, &b, TieBreak::Right), "ABCDEYXFGHIJ");
    }

    #[test]
    fn test_insert_before_delete_shifts_delete() {
        let ins = Operation::insert(1, "xyz");
        let del = Operation::delete(3, 6);
        let (ins_prime, del_prime) = transform(&ins, &del, TieBreak::Left);
        assert_eq!(ins_prime, ins);
        assert_eq!(del_prime, Operation::delete(6, 9));
        assert_eq!(converge("0123456789", &ins, &del, TieBreak::Left), "0xyz126789");
    }

    #[test]
    fn test_insert_at_delete_start_survives() {
        let ins = Operation::insert(3, "#");
        let del = Operation::delete(3, 6);
        assert_eq!(converge("0123456789", &ins, &del, TieBreak::Left), "012#6789");
    }

    #[test]
    fn test_insert_at_delete_end_survives() {
        let ins = Operation::insert(6, "#");
        let del = Operation::delete(3, 6);
        let (ins_prime, del_prime) = transform(&ins, &del, TieBreak::Left);
        assert_eq!(ins_prime, Operation::insert(3, "#"));
        assert_eq!(del_prime, del);
        assert_eq!(converge("0123456789", &ins, &del, TieBreak::Left), "012#6789");
    }

    #[test]
    fn test_insert_inside_delete_is_swallowed() {
        let ins = Operation::insert(4, "new");
        let del = Operation::delete(2, 7);
        let (ins_prime, del_prime) = transform(&ins, &del, TieBreak::Left);
        assert_eq!(ins_prime, Operation::insert(2, ""));
        assert_eq!(del_prime, Operation::delete(2, 10));
        assert_eq!(converge("0123456789", &ins, &del, TieBreak::Left), "01789");
        assert_eq!(converge("0123456789", &ins, &del, TieBreak::Right), "01789");
    }

    #[test]
    fn test_delete_insert_is_mirror_of_insert_delete() {
        let del = Operation::delete(2, 7);
        let ins = Operation::insert(4, "new");
        let (del_prime, ins_prime) = transform(&del, &ins, TieBreak::Left);
        assert_eq!(del_prime, Operation::delete(2, 10));
        assert_eq!(ins_prime, Operation::insert(2, ""));
    }

    #[test]
    fn test_disjoint_deletes() {
        let a = Operation::delete(0, 2);
        let b = Operation::delete(5, 8);
        let (a_prime, b_prime) = transform(&a, &b, TieBreak::Left);
        assert_eq!(a_prime, a);
        assert_eq!(b_prime, Operation::delete(3, 6));
        assert_eq!(converge("0123456789", &a, &b, TieBreak::Left), "23489");
    }

    #[test]
    fn test_overlapping_deletes_remove_union_once() {
        let a = Operation::delete(0, 5);
        let b = Operation::delete(3, 8);
        let (a_prime, b_prime) = transform(&a, &b, TieBreak::Left);
        assert_eq!(a_prime, Operation::delete(0, 3));
        assert_eq!(b_prime, Operation::delete(0, 3));
        assert_eq!(converge("HELLOWORLD", &a, &b, TieBreak::Left), "LD");
    }

    #[test]
    fn test_contained_delete() {
        let outer = Operation::delete(1, 9);
        let inner = Operation::delete(3, 5);
        let (outer_prime, inner_prime) = transform(&outer, &inner, TieBreak::Left);
        assert_eq!(outer_prime, Operation::delete(1, 7));
        assert_eq!(inner_prime, Operation::delete(1, 1));
        assert_eq!(converge("0123456789", &outer, &inner, TieBreak::Left), "09");
    }

    #[test]
    fn test_identical_deletes_collapse() {
        let a = Operation::delete(2, 4);
        let (a_prime, b_prime) = transform(&a, &a, TieBreak::Left);
        assert!(a_prime.is_noop());
        assert!(b_prime.is_noop());
    }

    #[test]
    fn test_transformed_ops_stay_valid() {
        let doc = "0123456789";
        let a = Operation::insert(7, "abc");
        let b = Operation::delete(2, 9);
        let (a_prime, b_prime) = transform(&a, &b, TieBreak::Left);
        let after_a = apply(doc, &a).unwrap();
        let after_b = apply(doc, &b).unwrap();
        assert!(validate(&b_prime, char_len(&after_a)));
        assert!(validate(&a_prime, char_len(&after_b)));
    }

    #[test]
    fn test_history_fold_scenario() {
        // A's insert was accepted first; B authored against the same base.
        let history = vec![Operation::insert(5, "X")];
        let rebased = transform_against_history(&Operation::insert(5, "Y"), &history);
        assert_eq!(rebased, Operation::insert(6, "Y"));

        let doc = apply("ABCDEFGHIJ", &history[0]).unwrap();
        assert_eq!(apply(&doc, &rebased).unwrap(), "ABCDEXYFGHIJ");
    }

    #[test]
    fn test_history_fold_multiple() {
        let history = vec![
            Operation::delete(0, 3),
            Operation::insert(0, ">>"),
            Operation::delete(4, 5),
        ];
        let rebased = transform_against_history(&Operation::insert(8, "!"), &history);

        let mut doc = "0123456789".to_string();
        for op in &history {
            doc = apply(&doc, op).unwrap();
        }
        assert_eq!(doc, ">>346789");
        assert_eq!(apply(&doc, &rebased).unwrap(), ">>3467!89");
    }

    #[test]
    fn test_history_fold_empty_is_identity() {
        let op = Operation::delete(1, 4);
        assert_eq!(transform_against_history(&op, &[]), op);
    }

    #[test]
    fn test_tie_break_invert() {
        assert_eq!(TieBreak::Left.invert(), TieBreak::Right);
        assert_eq!(TieBreak::Right.invert(), TieBreak::Left);
    }
}
