//! Cursor and selection presence, per room.
//!
//! Presence is a second stream next to content operations with weaker
//! guarantees: best-effort, latest-wins per session, never persisted to the
//! revision log, dropped with the session. Losing or reordering a presence
//! update violates nothing; each update carries a per-session sequence
//! number so a late arrival can be recognized as stale and skipped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Selected range in codepoint offsets. `start == end` means no selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: u64,
    pub end: u64,
}

/// A session's cursor state as last reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    /// Caret position, codepoint offset.
    pub position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// Broadcastable presence update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub cursor: CursorState,
    /// Per-session sequence; receivers drop events at or below the last
    /// sequence seen for the session.
    pub seq: u64,
}

struct PresenceEntry {
    user_id: Uuid,
    cursor: CursorState,
    seq: u64,
}

/// Latest-wins cursor map for one room.
#[derive(Default)]
pub struct PresenceTracker {
    entries: HashMap<Uuid, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Record a session's cursor and mint the broadcast event for it.
    pub fn update(&mut self, session_id: Uuid, user_id: Uuid, cursor: CursorState) -> PresenceEvent {
        let entry = self
            .entries
            .entry(session_id)
            .or_insert_with(|| PresenceEntry { user_id, cursor: cursor.clone(), seq: 0 });
        entry.seq += 1;
        entry.cursor = cursor.clone();
        entry.user_id = user_id;
        PresenceEvent { session_id, user_id, cursor, seq: entry.seq }
    }

    /// Merge a remote event, latest-wins. Returns false for stale arrivals.
    pub fn observe(&mut self, event: &PresenceEvent) -> bool {
        match self.entries.get_mut(&event.session_id) {
            Some(entry) if event.seq <= entry.seq => false,
            Some(entry) => {
                entry.seq = event.seq;
                entry.cursor = event.cursor.clone();
                entry.user_id = event.user_id;
                true
            }
            None => {
                self.entries.insert(
                    event.session_id,
                    PresenceEntry {
                        user_id: event.user_id,
                        cursor: event.cursor.clone(),
                        seq: event.seq,
                    },
                );
                true
            }
        }
    }

    /// Drop a session's presence. Ephemeral by design; nothing survives.
    pub fn remove(&mut self, session_id: &Uuid) -> bool {
        self.entries.remove(session_id).is_some()
    }

    /// Current cursors, for seeding a joining session.
    pub fn snapshot(&self) -> Vec<PresenceEvent> {
        self.entries
            .iter()
            .map(|(session_id, entry)| PresenceEvent {
                session_id: *session_id,
                user_id: entry.user_id,
                cursor: entry.cursor.clone(),
                seq: entry.seq,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
