//! Operational transformation over linear text.
//!
//! ```text
//!   Operation ──► apply(doc, op)          ──► Document
//!   (op1, op2) ─► transform(op1, op2)     ──► op1'   (op1 rebased past op2)
//!   (op1, op2) ─► compose(op1, op2)       ──► Option<op>  (merge adjacent)
//!   (op, doc)  ─► invert(op, doc)         ──► Option<op>  (undo)
//! ```
//!
//! All functions are pure. `apply` is the only one that can fail, and it
//! reports bounds violations as [`OtError::InvalidOperation`].

pub mod algebra;
pub mod document;
pub mod operation;
pub mod transform;

pub use algebra::{compose, invert};
pub use document::{apply, Document};
pub use operation::{OtError, Operation, UserId};
pub use transform::transform;
