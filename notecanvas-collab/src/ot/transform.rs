//! Inclusion transformation.
//!
//! `transform(a, b)` rewrites `a` so it can be applied after `b`, where both
//! were generated against the same document. For every such pair:
//!
//! ```text
//! apply(apply(doc, b), transform(a, b)) == apply(apply(doc, a), transform(b, a))
//! ```
//!
//! Rules:
//!
//! | a \ b  | Insert                         | Delete                                |
//! |--------|--------------------------------|---------------------------------------|
//! | Insert | shift right if after, tie by (timestamp, author, content) | unchanged before, shift left after, pulled to start inside |
//! | Delete | shift right if insert at/before start, split if inside | interval overlap arithmetic  |
//!
//! `Retain` is absorbed on either side.

use super::operation::{char_len, Operation};

/// Rewrite `op1` to apply on a document that already has `op2` applied.
pub fn transform(op1: &Operation, op2: &Operation) -> Operation {
    match (op1, op2) {
        (_, Operation::Retain { .. }) => op1.clone(),
        (Operation::Retain { .. }, _) => op1.clone(),

        (Operation::Sequence(parts), _) => transform_sequence(parts, op2),
        (_, Operation::Sequence(parts)) => parts
            .iter()
            .fold(op1.clone(), |acc, part| transform(&acc, part)),

        (
            Operation::Insert {
                position: p1,
                content: c1,
                author: a1,
                timestamp: t1,
            },
            Operation::Insert {
                position: p2,
                content: c2,
                author: a2,
                timestamp: t2,
            },
        ) => {
            let shift = match p1.cmp(p2) {
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Greater => true,
                // Earlier (timestamp, author, content) keeps the left slot.
                std::cmp::Ordering::Equal => (t1, a1, c1) >= (t2, a2, c2),
            };
            if shift {
                with_position(op1, p1 + char_len(c2))
            } else {
                op1.clone()
            }
        }

        (
            Operation::Insert { position: q, .. },
            Operation::Delete {
                position: p,
                length: l,
                ..
            },
        ) => {
            if q <= p {
                op1.clone()
            } else if *q >= p + l {
                with_position(op1, q - l)
            } else {
                // Inside the deleted range: pulled to the boundary, kept.
                with_position(op1, *p)
            }
        }

        (
            Operation::Delete {
                position: p,
                length: l,
                author,
                timestamp,
            },
            Operation::Insert {
                position: q,
                content,
                ..
            },
        ) => {
            let n = char_len(content);
            if q <= p {
                with_position(op1, p + n)
            } else if *q >= p + l {
                op1.clone()
            } else {
                // The insert lands strictly inside the range. Delete around
                // it so the inserted text survives, mirroring the insert
                // being pulled to the range start on the other replica.
                let head = q - p;
                Operation::Sequence(vec![
                    Operation::delete(*p, head, *author, *timestamp),
                    Operation::delete(p + n, l - head, *author, *timestamp),
                ])
            }
        }

        (
            Operation::Delete {
                position: pa,
                length: la,
                author,
                timestamp,
            },
            Operation::Delete {
                position: pb,
                length: lb,
                ..
            },
        ) => {
            let (ea, eb) = (pa + la, pb + lb);
            let overlap = ea.min(eb).saturating_sub(*pa.max(pb));
            // Chars removed by `b` strictly before our start.
            let removed_before = if pb < pa { (*lb).min(pa - pb) } else { 0 };
            Operation::Delete {
                position: pa - removed_before,
                length: la - overlap,
                author: *author,
                timestamp: *timestamp,
            }
        }
    }
}

/// Transform each component against `other`, advancing `other` past the
/// components already visited.
fn transform_sequence(parts: &[Operation], other: &Operation) -> Operation {
    let mut against = other.clone();
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        out.push(transform(part, &against));
        against = transform(&against, part);
    }
    Operation::sequence(out)
}

fn with_position(op: &Operation, new_position: usize) -> Operation {
    match op {
        Operation::Insert {
            content,
            author,
            timestamp,
            ..
        } => Operation::Insert {
            position: new_position,
            content: content.clone(),
            author: *author,
            timestamp: *timestamp,
        },
        Operation::Delete {
            length,
            author,
            timestamp,
            ..
        } => Operation::Delete {
            position: new_position,
            length: *length,
            author: *author,
            timestamp: *timestamp,
        },
        other => other.clone(),
    }
}
