//! Metrics and health surface for an external monitor.
//!
//! Engine-wide counters are plain atomics so the hot paths never take a
//! lock to record them; readers take a snapshot. Per-room figures (queue
//! depth, checkpoint lag) are collected live from the rooms by the session
//! manager's `health()`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

/// Lock-free engine counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub operations_applied: AtomicU64,
    pub operations_rejected: AtomicU64,
    pub broadcasts_dropped: AtomicU64,
    pub checkpoints_written: AtomicU64,
    pub checkpoints_failed: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_expired: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_applied: self.operations_applied.load(Ordering::Relaxed),
            operations_rejected: self.operations_rejected.load(Ordering::Relaxed),
            broadcasts_dropped: self.broadcasts_dropped.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoints_failed: self.checkpoints_failed.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub broadcasts_dropped: u64,
    pub checkpoints_written: u64,
    pub checkpoints_failed: u64,
    pub sessions_opened: u64,
    pub sessions_expired: u64,
}

/// Live figures for one open room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomHealth {
    pub document_id: Uuid,
    /// Commands waiting in the room's inbound queue.
    pub queue_depth: usize,
    pub current_revision: u64,
    pub last_checkpoint_revision: u64,
    pub active_sessions: usize,
    pub grace_sessions: usize,
}

impl RoomHealth {
    /// Revisions applied but not yet persisted.
    pub fn checkpoint_lag(&self) -> u64 {
        self.current_revision - self.last_checkpoint_revision
    }
}

/// Aggregate health report, shaped for a monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub open_rooms: usize,
    pub rooms: Vec<RoomHealth>,
    pub counters: MetricsSnapshot,
}

impl HealthStatus {
    pub fn ok(rooms: Vec<RoomHealth>, counters: MetricsSnapshot) -> Self {
        Self { status: "ok", open_rooms: rooms.len(), rooms, counters }
    }
}
