//! Engine configuration.

use std::time::Duration;

/// Tunables for rooms, sessions, and checkpointing.
///
/// The defaults are sized for interactive editing with tens of sessions per
/// document. Every queue in the engine is bounded; the capacities here are
/// the only backpressure knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum operation size in codepoints (insert content length, delete
    /// length, and per-span sizes inside composites). Bounds worst-case
    /// transform cost.
    pub max_operation_len: u64,
    /// Capacity of each room's inbound command queue. When full, `submit`
    /// fails fast with `Backpressure`.
    pub room_queue_capacity: usize,
    /// Capacity of each session's outbound event buffer. A session that
    /// saturates its buffer is moved to grace-period instead of stalling
    /// the room.
    pub session_buffer_capacity: usize,
    /// Revisions retained past the last checkpoint for catch-up replay.
    /// Operations based below the retained floor are rejected with
    /// `StaleBase`.
    pub replay_window: u64,
    /// Remembered `client_op_id`s per session for idempotent resubmission.
    pub idempotency_window: usize,
    /// How long a disconnected session is retained before it is destroyed.
    pub grace_period_secs: u64,
    /// Housekeeping tick driving checkpoint checks and grace expiry.
    pub tick_interval_ms: u64,
    /// Idle time after which uncheckpointed revisions are persisted.
    pub checkpoint_idle_secs: u64,
    /// Uncheckpointed revision count that forces a checkpoint.
    pub checkpoint_revision_threshold: u64,
    /// Attempts per checkpoint before giving up until the next trigger.
    pub checkpoint_max_retries: u32,
    /// Base delay for exponential checkpoint retry backoff.
    pub checkpoint_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operation_len: 4096,
            room_queue_capacity: 256,
            session_buffer_capacity: 256,
            replay_window: 1024,
            idempotency_window: 64,
            grace_period_secs: 30,
            tick_interval_ms: 1000,
            checkpoint_idle_secs: 10,
            checkpoint_revision_threshold: 100,
            checkpoint_max_retries: 5,
            checkpoint_backoff_ms: 200,
        }
    }
}

impl EngineConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn checkpoint_idle(&self) -> Duration {
        Duration::from_secs(self.checkpoint_idle_secs)
    }
}
