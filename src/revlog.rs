//! Append-only revision log, one per open document.
//!
//! The log is the single source of truth for happened-before within a room:
//! revision numbers increase by exactly one per applied operation, with no
//! gaps and no duplicates. Entries are immutable after append and are only
//! ever removed from the front, by checkpoint-driven pruning that respects
//! the catch-up replay window.
//!
//! Reference: Kleppmann, Chapter 3 — Log-Structured Storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::op::Operation;

/// One accepted, ordered state transition of a document.
///
/// `operation` is the post-transform form, exactly as applied to canonical
/// content. Replaying revisions in order from any checkpoint reproduces the
/// room's content byte for byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub document_id: Uuid,
    /// Strictly increasing; 0 is the empty document and carries no operation,
    /// so logged revisions start at 1.
    pub revision_number: u64,
    pub operation: Operation,
    pub applied_at: DateTime<Utc>,
}

/// Per-document sequence of applied revisions.
pub struct RevisionLog {
    document_id: Uuid,
    /// Latest assigned revision number; equals the baseline when empty.
    head: u64,
    /// Contiguous tail of the history: `entries.last().revision_number == head`.
    entries: Vec<Revision>,
}

impl RevisionLog {
    /// Start a log at a baseline revision, typically the revision of the
    /// snapshot the room's content was loaded from.
    pub fn new(document_id: Uuid, baseline: u64) -> Self {
        Self { document_id, head: baseline, entries: Vec::new() }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Lowest base revision the log can still transform from. Operations
    /// based below the floor require a client resync.
    pub fn floor(&self) -> u64 {
        match self.entries.first() {
            Some(first) => first.revision_number - 1,
            None => self.head,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an applied operation as the next revision and return it.
    pub fn append(&mut self, operation: Operation) -> &Revision {
        self.head += 1;
        self.entries.push(Revision {
            document_id: self.document_id,
            revision_number: self.head,
            operation,
            applied_at: Utc::now(),
        });
        // entries is non-empty on the line above
        &self.entries[self.entries.len() - 1]
    }

    /// Revisions with `revision_number > revision`, in order. `None` when
    /// the prefix needed for that base has already been pruned.
    pub fn since(&self, revision: u64) -> Option<&[Revision]> {
        if revision < self.floor() {
            return None;
        }
        if revision >= self.head {
            return Some(&[]);
        }
        // First retained entry is floor() + 1.
        let skip = (revision - self.floor()) as usize;
        Some(&self.entries[skip..])
    }

    /// Drop entries persisted by a checkpoint and older than the replay
    /// window. Returns how many were removed.
    pub fn prune(&mut self, checkpoint: u64, replay_window: u64) -> usize {
        let window_floor = self.head.saturating_sub(replay_window);
        let cutoff = checkpoint.min(window_floor);
        let keep_from = self
            .entries
            .iter()
            .position(|r| r.revision_number > cutoff)
            .unwrap_or(self.entries.len());
        self.entries.drain(..keep_from).count()
    }
}
