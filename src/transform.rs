//! Operational transformation over linear text.
//!
//! Given two operations authored against the same base state, `transform`
//! rewrites one so it applies correctly after the other. The rules:
//!
//! ```text
//! insert / insert   earlier position wins; equal positions tie-break on
//!                   author_session_id (lower id lands first)
//! insert / delete   insert shifts past a preceding delete; an insert inside
//!                   the deleted range clamps to the deletion start and the
//!                   inserted text survives
//! delete / insert   delete shifts past a preceding insert; an insert inside
//!                   the deleted range splits the delete around the survivor
//! delete / delete   already-deleted overlap is dropped, never re-deleted;
//!                   the remainder is contiguous in post-transform coords
//! ```
//!
//! All functions here are pure. `compose` is the only caller of `transform`
//! in the engine: the room sequencer folds an incoming operation over every
//! logged revision past its base, in revision order.
//!
//! Reference: Kleppmann, Chapter 5 — Conflict Resolution

use uuid::Uuid;

use crate::op::{Edit, OpKind, Operation};
use crate::revlog::Revision;

/// Transform `a` so it applies after `b`. Both must share a base state.
///
/// The result carries `a`'s metadata (author, base revision, client op id)
/// with rewritten spans. A fully swallowed delete becomes an identity edit,
/// which still consumes a revision number when applied.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    let mut edits = a.kind.edits();
    // b's spans apply highest-position-first; walking them in that order
    // keeps every span below expressed in coordinates both sides agree on.
    for against in b.kind.edits() {
        let mut next = Vec::with_capacity(edits.len() + 1);
        for edit in &edits {
            next.extend(transform_edit(
                edit,
                a.author_session_id,
                &against,
                b.author_session_id,
            ));
        }
        edits = next;
    }
    a.with_kind(OpKind::from_edits(edits))
}

/// Transform `op` against every revision with `revision_number` greater than
/// its base, in revision order. Produces the operation actually appended.
pub fn compose(op: &Operation, intervening: &[Revision]) -> Operation {
    let mut current = op.clone();
    for revision in intervening {
        current = transform(&current, &revision.operation);
    }
    current
}

/// Materialize an operation against document content.
///
/// Offsets are codepoints; out-of-range spans clamp at the boundaries rather
/// than panic, so a transformed operation can always be applied. Spans apply
/// highest-position-first.
pub fn apply(content: &str, kind: &OpKind) -> String {
    let mut text = content.to_string();
    for edit in kind.edits() {
        match edit {
            Edit::Insert { position, content } => {
                let at = byte_offset(&text, position);
                text.insert_str(at, &content);
            }
            Edit::Delete { position, length } => {
                let start = byte_offset(&text, position);
                let end = byte_offset(&text, position + length);
                text.replace_range(start..end, "");
            }
        }
    }
    text
}

/// Byte index of the `codepoint`-th character, clamped to the end.
fn byte_offset(s: &str, codepoint: u64) -> usize {
    match s.char_indices().nth(codepoint as usize) {
        Some((idx, _)) => idx,
        None => s.len(),
    }
}

/// Transform a single span of `a` against a single span of `b`.
///
/// Returns zero, one, or two spans: a delete can vanish (overlap dropped) or
/// split (concurrent insert inside its range). Split output stays descending.
fn transform_edit(a: &Edit, a_author: Uuid, b: &Edit, b_author: Uuid) -> Vec<Edit> {
    match (a, b) {
        (Edit::Insert { position: pa, content: ca }, Edit::Insert { position: pb, content: cb }) => {
            let shift = pb < pa || (pb == pa && b_author < a_author);
            let position = if shift { pa + count(cb) } else { *pa };
            vec![Edit::Insert { position, content: ca.clone() }]
        }

        (Edit::Insert { position: pa, content: ca }, Edit::Delete { position: pb, length: lb }) => {
            let position = if *pa <= *pb {
                *pa
            } else if *pa >= pb + lb {
                pa - lb
            } else {
                // Inside the deleted range: the insert survives, collapsed
                // to the point where the range closed up.
                *pb
            };
            vec![Edit::Insert { position, content: ca.clone() }]
        }

        (Edit::Delete { position: pa, length: la }, Edit::Insert { position: pb, content: cb }) => {
            let ins = count(cb);
            if *pb <= *pa {
                vec![Edit::Delete { position: pa + ins, length: *la }]
            } else if *pb >= pa + la {
                vec![Edit::Delete { position: *pa, length: *la }]
            } else {
                // Concurrent insert landed inside the range being deleted.
                // The inserted text survives: delete around it.
                let below = pb - pa;
                vec![
                    Edit::Delete { position: pb + ins, length: la - below },
                    Edit::Delete { position: *pa, length: below },
                ]
            }
        }

        (Edit::Delete { position: pa, length: la }, Edit::Delete { position: pb, length: lb }) => {
            if pb + lb <= *pa {
                vec![Edit::Delete { position: pa - lb, length: *la }]
            } else if pa + la <= *pb {
                vec![Edit::Delete { position: *pa, length: *la }]
            } else {
                // Overlapping ranges: whatever b already removed is dropped
                // from a. The survivors are contiguous once b has applied.
                let keep_below = pb.saturating_sub(*pa);
                let keep_above = (pa + la).saturating_sub(pb + lb);
                let length = keep_below + keep_above;
                if length == 0 {
                    vec![]
                } else {
                    vec![Edit::Delete { position: (*pa).min(*pb), length }]
                }
            }
        }
    }
}

fn count(s: &str) -> u64 {
    s.chars().count() as u64
}
