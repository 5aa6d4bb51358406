//! # jobdoc-ot — Operational Transformation over plain text
//!
//! Pure, side-effect-free edit primitives used by the collaboration server.
//!
//! ```text
//!   base document
//!      │        │
//!   op_a       op_b          (authored concurrently)
//!      │        │
//!      ▼        ▼
//!   doc·a     doc·b
//!      │        │
//!   op_b'     op_a'          (transform(op_a, op_b))
//!      │        │
//!      └───┬────┘
//!          ▼
//!   identical document
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — the `Insert` / `Delete` primitive, `apply`, `validate`
//! - [`transform`] — pairwise conflict resolution and history folding
//! - [`compose`] — merging back-to-back edits from one author

pub mod compose;
pub mod operation;
pub mod transform;

pub use compose::{compose, Composed};
pub use operation::{apply, validate, char_len, Operation, OtError};
pub use transform::{transform, transform_against_history, TieBreak};
