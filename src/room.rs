//! Room sequencer: one single-writer actor per open document.
//!
//! All state mutation for a document funnels through one sequential task,
//! reachable only by message passing. There is no lock around canonical
//! content or the revision counter; the inbound queue is the serialization
//! point, and the order operations are appended to the revision log is the
//! only happened-before order the engine exposes.
//!
//! ```text
//! submit ──┐
//! join   ──┤  bounded mpsc   ┌──────────────┐  try_send   session buffers
//! cursor ──┼────────────────►│ Room (task)   │────────────► (bounded, per
//! ack    ──┤   (fail-fast    │  compose/OT   │              session)
//! leave  ──┘    Backpressure)│  apply/append │
//!                            │  checkpoint   │──► detached snapshot task
//!                            └──────────────┘
//! ```
//!
//! A full inbound queue rejects the submit instead of growing; a full
//! session buffer moves that session to grace-period instead of stalling
//! the room. Cross-room work never serializes: rooms share nothing.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::checkpoint::{self, CheckpointPolicy, RetryPolicy};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::{EngineMetrics, RoomHealth};
use crate::op::Operation;
use crate::presence::{CursorState, PresenceEvent, PresenceTracker};
use crate::protocol::ServerEvent;
use crate::revlog::{Revision, RevisionLog};
use crate::store::DocumentStore;
use crate::transform;

/// Connection lifecycle of a session as the room sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    /// Disconnected or saturated; retained for the grace window so a resume
    /// can pick up buffered traffic.
    GracePeriod,
    Closed,
}

/// Result of joining a room.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub content: String,
    pub revision: u64,
    /// Cursors already present, for seeding the client's presence view.
    pub peers: Vec<PresenceEvent>,
    /// False when the requested catch-up base was already pruned; the
    /// snapshot content must be used instead of replay.
    pub replayed: bool,
}

/// Notifications from rooms back to the session manager.
#[derive(Debug)]
pub(crate) enum RoomNotice {
    SessionExpired { session_id: Uuid },
}

pub(crate) enum RoomCommand {
    Join {
        session_id: Uuid,
        user_id: Uuid,
        sender: mpsc::Sender<ServerEvent>,
        last_acked: Option<u64>,
        reply: oneshot::Sender<JoinInfo>,
    },
    Submit {
        session_id: Uuid,
        operation: Operation,
        reply: oneshot::Sender<Result<Revision, EngineError>>,
    },
    Cursor {
        session_id: Uuid,
        cursor: CursorState,
    },
    Ack {
        session_id: Uuid,
        revision: u64,
    },
    Leave {
        session_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
    Disconnect {
        session_id: Uuid,
    },
    CheckpointOutcome {
        revision: u64,
        ok: bool,
    },
    Health {
        reply: oneshot::Sender<RoomHealth>,
    },
}

/// Cheap, cloneable address of a room task.
#[derive(Clone)]
pub struct RoomHandle {
    document_id: Uuid,
    tx: mpsc::Sender<RoomCommand>,
    queue_capacity: usize,
}

impl RoomHandle {
    /// Spawn a sequencer for a document and return its handle.
    pub(crate) fn open(
        document_id: Uuid,
        content: String,
        baseline_revision: u64,
        config: Arc<EngineConfig>,
        store: Arc<dyn DocumentStore>,
        metrics: Arc<EngineMetrics>,
        notices: mpsc::UnboundedSender<RoomNotice>,
    ) -> RoomHandle {
        let queue_capacity = config.room_queue_capacity;
        let (tx, rx) = mpsc::channel(queue_capacity);
        let room = Room {
            document_id,
            policy: CheckpointPolicy::from_config(&config),
            retry: RetryPolicy::from_config(&config),
            config,
            store,
            metrics,
            notices,
            content,
            log: RevisionLog::new(document_id, baseline_revision),
            sessions: HashMap::new(),
            presence: PresenceTracker::new(),
            seen: HashMap::new(),
            last_checkpoint: baseline_revision,
            checkpoint_in_flight: false,
            last_activity: Instant::now(),
            had_sessions: false,
            self_tx: tx.downgrade(),
        };
        tokio::spawn(room.run(rx));
        log::info!("Room opened for doc {document_id} at revision {baseline_revision}");
        RoomHandle { document_id, tx, queue_capacity }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Submit an operation. Fails fast with `Backpressure` when the inbound
    /// queue is full; once enqueued the submit always completes with an
    /// applied revision or an explicit error, never a silent drop.
    pub async fn submit(
        &self,
        session_id: Uuid,
        operation: Operation,
    ) -> Result<Revision, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(RoomCommand::Submit { session_id, operation, reply })
            .map_err(|err| match err {
                TrySendError::Full(_) => EngineError::Backpressure,
                TrySendError::Closed(_) => EngineError::RoomClosed,
            })?;
        rx.await.map_err(|_| EngineError::RoomClosed)?
    }

    pub(crate) async fn join(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        sender: mpsc::Sender<ServerEvent>,
        last_acked: Option<u64>,
    ) -> Result<JoinInfo, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Join { session_id, user_id, sender, last_acked, reply })
            .await
            .map_err(|_| EngineError::RoomClosed)?;
        rx.await.map_err(|_| EngineError::RoomClosed)
    }

    /// Remove a session. Returns how many sessions remain.
    pub async fn leave(&self, session_id: Uuid) -> Result<usize, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Leave { session_id, reply })
            .await
            .map_err(|_| EngineError::RoomClosed)?;
        rx.await.map_err(|_| EngineError::RoomClosed)
    }

    /// Presence is best-effort: a full queue drops the update.
    pub fn cursor(&self, session_id: Uuid, cursor: CursorState) -> Result<(), EngineError> {
        match self.tx.try_send(RoomCommand::Cursor { session_id, cursor }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::trace!("Dropping cursor update for session {session_id}: queue full");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::RoomClosed),
        }
    }

    pub async fn ack(&self, session_id: Uuid, revision: u64) -> Result<(), EngineError> {
        self.tx
            .send(RoomCommand::Ack { session_id, revision })
            .await
            .map_err(|_| EngineError::RoomClosed)
    }

    pub async fn disconnect(&self, session_id: Uuid) -> Result<(), EngineError> {
        self.tx
            .send(RoomCommand::Disconnect { session_id })
            .await
            .map_err(|_| EngineError::RoomClosed)
    }

    pub async fn health(&self) -> Result<RoomHealth, EngineError> {
        let queue_depth = self.queue_capacity - self.tx.capacity();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Health { reply })
            .await
            .map_err(|_| EngineError::RoomClosed)?;
        let mut health = rx.await.map_err(|_| EngineError::RoomClosed)?;
        health.queue_depth = queue_depth;
        Ok(health)
    }

    /// True once the sequencer task has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct SessionSlot {
    user_id: Uuid,
    sender: mpsc::Sender<ServerEvent>,
    state: ConnectionState,
    grace_deadline: Option<Instant>,
    last_acked: u64,
}

struct Room {
    document_id: Uuid,
    config: Arc<EngineConfig>,
    policy: CheckpointPolicy,
    retry: RetryPolicy,
    store: Arc<dyn DocumentStore>,
    metrics: Arc<EngineMetrics>,
    notices: mpsc::UnboundedSender<RoomNotice>,

    content: String,
    log: RevisionLog,
    sessions: HashMap<Uuid, SessionSlot>,
    presence: PresenceTracker,
    /// Per-session idempotency window: client_op_id -> applied revision.
    seen: HashMap<Uuid, VecDeque<(Uuid, Revision)>>,

    last_checkpoint: u64,
    checkpoint_in_flight: bool,
    last_activity: Instant,
    had_sessions: bool,
    /// Weak so the room never keeps itself alive; checkpoint tasks upgrade
    /// it to report their outcome.
    self_tx: mpsc::WeakSender<RoomCommand>,
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tick.tick() => {
                    self.expire_grace_sessions();
                    self.maybe_checkpoint();
                }
            }
            if self.had_sessions && self.sessions.is_empty() {
                break;
            }
        }

        // Teardown: persist whatever the periodic checkpoints have not.
        if self.log.head() > self.last_checkpoint {
            let result = checkpoint::write_snapshot(
                self.store.clone(),
                self.document_id,
                self.content.clone(),
                self.log.head(),
                &self.retry,
            )
            .await;
            match result {
                Ok(()) => self.metrics.checkpoints_written.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
                Err(_) => self.metrics.checkpoints_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            };
        }
        log::info!("Room closed for doc {} at revision {}", self.document_id, self.log.head());
    }

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { session_id, user_id, sender, last_acked, reply } => {
                self.handle_join(session_id, user_id, sender, last_acked, reply);
            }
            RoomCommand::Submit { session_id, operation, reply } => {
                let result = self.handle_submit(session_id, operation);
                if result.is_err() {
                    self.metrics
                        .operations_rejected
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }
            RoomCommand::Cursor { session_id, cursor } => self.handle_cursor(session_id, cursor),
            RoomCommand::Ack { session_id, revision } => {
                if let Some(slot) = self.sessions.get_mut(&session_id) {
                    slot.last_acked = slot.last_acked.max(revision);
                }
            }
            RoomCommand::Leave { session_id, reply } => {
                self.remove_session(&session_id, "left");
                let _ = reply.send(self.sessions.len());
            }
            RoomCommand::Disconnect { session_id } => {
                if let Some(slot) = self.sessions.get_mut(&session_id) {
                    slot.state = ConnectionState::GracePeriod;
                    slot.grace_deadline = Some(Instant::now() + self.config.grace_period());
                    log::info!("Session {session_id} entered grace-period");
                }
            }
            RoomCommand::CheckpointOutcome { revision, ok } => {
                self.checkpoint_in_flight = false;
                if ok {
                    self.last_checkpoint = self.last_checkpoint.max(revision);
                    let pruned = self.log.prune(self.last_checkpoint, self.config.replay_window);
                    self.metrics
                        .checkpoints_written
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    log::debug!(
                        "Checkpoint at revision {revision} persisted for doc {}, pruned {pruned} entries",
                        self.document_id
                    );
                } else {
                    self.metrics
                        .checkpoints_failed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
            RoomCommand::Health { reply } => {
                let _ = reply.send(self.health());
            }
        }
    }

    fn handle_join(
        &mut self,
        session_id: Uuid,
        user_id: Uuid,
        sender: mpsc::Sender<ServerEvent>,
        last_acked: Option<u64>,
        reply: oneshot::Sender<JoinInfo>,
    ) {
        // Catch-up replay goes into the session's buffer ahead of any live
        // traffic; the room is sequential, so nothing can interleave.
        let mut replayed = last_acked.is_some();
        if let Some(acked) = last_acked {
            match self.log.since(acked) {
                Some(revisions) => {
                    for revision in revisions {
                        if sender.try_send(ServerEvent::operation_applied(revision)).is_err() {
                            replayed = false;
                            break;
                        }
                    }
                }
                None => replayed = false,
            }
        }

        self.sessions.insert(
            session_id,
            SessionSlot {
                user_id,
                sender,
                state: ConnectionState::Active,
                grace_deadline: None,
                last_acked: last_acked.unwrap_or(0),
            },
        );
        self.had_sessions = true;

        self.broadcast_except(&session_id, ServerEvent::user_joined(session_id, user_id));
        log::info!("Session {session_id} (user {user_id}) joined doc {}", self.document_id);

        let _ = reply.send(JoinInfo {
            content: self.content.clone(),
            revision: self.log.head(),
            peers: self.presence.snapshot(),
            replayed,
        });
    }

    fn handle_submit(
        &mut self,
        session_id: Uuid,
        operation: Operation,
    ) -> Result<Revision, EngineError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(EngineError::UnknownSession(session_id));
        }

        // Retry of an operation we already applied: return the original
        // revision, apply nothing.
        if let Some(window) = self.seen.get(&session_id) {
            if let Some((_, revision)) =
                window.iter().find(|(id, _)| *id == operation.client_op_id)
            {
                log::debug!(
                    "Idempotent resubmission of op {} from session {session_id}",
                    operation.client_op_id
                );
                return Ok(revision.clone());
            }
        }

        let head = self.log.head();
        if operation.base_revision > head {
            return Err(EngineError::StaleBase {
                base_revision: operation.base_revision,
                earliest: self.log.floor(),
                head,
            });
        }
        let intervening = self.log.since(operation.base_revision).ok_or(EngineError::StaleBase {
            base_revision: operation.base_revision,
            earliest: self.log.floor(),
            head,
        })?;

        // A fault while transforming or applying rejects this operation
        // only; the room and every other session stay untouched.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let composed = transform::compose(&operation, intervening);
            let next = transform::apply(&self.content, &composed.kind);
            (composed, next)
        }));
        let (composed, next) = match outcome {
            Ok(pair) => pair,
            Err(_) => {
                log::error!(
                    "Operation {} from session {session_id} panicked during transform; rejected",
                    operation.client_op_id
                );
                return Err(EngineError::Internal("operation processing failed".into()));
            }
        };

        self.content = next;
        let revision = self.log.append(composed).clone();
        self.last_activity = Instant::now();
        self.metrics.operations_applied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let window = self.seen.entry(session_id).or_default();
        window.push_back((operation.client_op_id, revision.clone()));
        while window.len() > self.config.idempotency_window {
            window.pop_front();
        }

        // The author's ack is the submit reply; everyone else gets the
        // applied revision pushed.
        self.broadcast_except(&session_id, ServerEvent::operation_applied(&revision));
        Ok(revision)
    }

    fn handle_cursor(&mut self, session_id: Uuid, cursor: CursorState) {
        let Some(slot) = self.sessions.get(&session_id) else {
            log::debug!("Cursor update from unknown session {session_id}");
            return;
        };
        let event = self.presence.update(session_id, slot.user_id, cursor);
        self.broadcast_except(&session_id, ServerEvent::cursor_update(event));
    }

    /// Push an event to every session but one. A session whose buffer is
    /// saturated moves to grace-period; the room never waits for it.
    fn broadcast_except(&mut self, skip: &Uuid, event: ServerEvent) {
        let grace = self.config.grace_period();
        for (session_id, slot) in &mut self.sessions {
            if session_id == skip || slot.state == ConnectionState::Closed {
                continue;
            }
            match slot.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics
                        .broadcasts_dropped
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if slot.state == ConnectionState::Active {
                        slot.state = ConnectionState::GracePeriod;
                        slot.grace_deadline = Some(Instant::now() + grace);
                        log::warn!(
                            "Session {session_id} buffer saturated; moved to grace-period"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    if slot.state != ConnectionState::Closed {
                        slot.state = ConnectionState::Closed;
                        slot.grace_deadline = Some(Instant::now() + grace);
                        log::info!("Session {session_id} receiver dropped; marked closed");
                    }
                }
            }
        }
    }

    fn expire_grace_sessions(&mut self) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.state, ConnectionState::GracePeriod | ConnectionState::Closed)
                    && slot.grace_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        for session_id in expired {
            self.remove_session(&session_id, "grace-period expired");
            self.metrics.sessions_expired.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let _ = self.notices.send(RoomNotice::SessionExpired { session_id });
        }
    }

    fn remove_session(&mut self, session_id: &Uuid, reason: &str) {
        if let Some(slot) = self.sessions.remove(session_id) {
            self.presence.remove(session_id);
            self.seen.remove(session_id);
            self.broadcast_except(session_id, ServerEvent::user_left(*session_id, slot.user_id));
            log::info!("Session {session_id} removed from doc {} ({reason})", self.document_id);
        }
    }

    fn maybe_checkpoint(&mut self) {
        let due = self.policy.due(
            self.log.head(),
            self.last_checkpoint,
            self.last_activity.elapsed(),
            self.checkpoint_in_flight,
        );
        if !due {
            return;
        }
        self.checkpoint_in_flight = true;

        let store = self.store.clone();
        let document_id = self.document_id;
        let content = self.content.clone();
        let revision = self.log.head();
        let retry = self.retry.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let ok =
                checkpoint::write_snapshot(store, document_id, content, revision, &retry).await.is_ok();
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(RoomCommand::CheckpointOutcome { revision, ok }).await;
            }
        });
    }

    fn health(&self) -> RoomHealth {
        let grace_sessions = self
            .sessions
            .values()
            .filter(|slot| slot.state != ConnectionState::Active)
            .count();
        RoomHealth {
            document_id: self.document_id,
            queue_depth: 0, // filled by the handle, which can see the queue
            current_revision: self.log.head(),
            last_checkpoint_revision: self.last_checkpoint,
            active_sessions: self.sessions.len() - grace_sessions,
            grace_sessions,
        }
    }
}
