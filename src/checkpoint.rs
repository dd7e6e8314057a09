//! Checkpoint scheduling and snapshot hand-off.
//!
//! Checkpointing is advisory: it runs off the sequencing hot path, on a
//! detached task, and a failing store never affects live editing. A room
//! consults [`CheckpointPolicy::due`] on its housekeeping tick and, when a
//! checkpoint is due, hands `(document_id, content, revision)` to
//! [`write_snapshot`], which retries with exponential backoff before giving
//! up until the next trigger.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::store::DocumentStore;

/// When to persist: revision-count threshold or idle timeout.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    pub idle_after: Duration,
    pub revision_threshold: u64,
}

impl CheckpointPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            idle_after: config.checkpoint_idle(),
            revision_threshold: config.checkpoint_revision_threshold,
        }
    }

    /// Whether a checkpoint should fire now. Never while one is in flight,
    /// never when there is nothing new to persist.
    pub fn due(&self, head: u64, last_checkpoint: u64, idle_for: Duration, in_flight: bool) -> bool {
        if in_flight || head <= last_checkpoint {
            return false;
        }
        let pending = head - last_checkpoint;
        pending >= self.revision_threshold || idle_for >= self.idle_after
    }
}

/// Retry schedule for a single checkpoint attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.checkpoint_max_retries,
            backoff_base: Duration::from_millis(config.checkpoint_backoff_ms),
        }
    }

    /// Delay before the given retry, doubling per attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt)
    }
}

/// Persist a snapshot, retrying transient store failures with exponential
/// backoff. Returns the last error once the attempt budget is spent.
pub async fn write_snapshot(
    store: Arc<dyn DocumentStore>,
    document_id: Uuid,
    content: String,
    revision: u64,
    retry: &RetryPolicy,
) -> Result<(), EngineError> {
    let mut last_error = EngineError::StoreUnavailable("no attempts made".into());
    for attempt in 0..retry.max_attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(retry.delay(attempt - 1)).await;
        }
        match store.save_snapshot(document_id, &content, revision).await {
            Ok(()) => {
                log::info!("Checkpointed doc {document_id} at revision {revision}");
                return Ok(());
            }
            Err(err) => {
                log::warn!(
                    "Checkpoint attempt {attempt} for doc {document_id} at revision {revision} failed: {err}"
                );
                last_error = err;
            }
        }
    }
    log::error!("Giving up checkpoint for doc {document_id} at revision {revision}: {last_error}");
    Err(last_error)
}
