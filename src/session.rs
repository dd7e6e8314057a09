//! Session manager: the engine's front door.
//!
//! Tracks every connected client session, resolves or creates the room for
//! a document on join, routes inbound traffic to the right sequencer, and
//! hands each session a bounded receiver carrying its outbound events.
//!
//! ```text
//! transport ── join(token, doc) ──► verify ──► room_for(doc) ──► Room
//!          ── submit/cursor/ack ──► session lookup ──► RoomHandle
//!          ◄── mpsc::Receiver<ServerEvent> ── per-session buffer ◄── Room
//! ```
//!
//! Rooms close themselves once their last session is gone and the final
//! checkpoint has landed; the manager detects the closed handle on the next
//! join and opens a fresh room from the persisted snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::{EngineMetrics, HealthStatus, RoomHealth};
use crate::presence::{CursorState, PresenceEvent};
use crate::protocol::{ClientEvent, OperationPayload, ServerEvent};
use crate::revlog::Revision;
use crate::room::{RoomHandle, RoomNotice};
use crate::store::{AuthProvider, DocumentStore};

/// Everything a transport needs after a successful join.
#[derive(Debug)]
pub struct JoinGrant {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub document_id: Uuid,
    /// Canonical content at join time.
    pub content: String,
    pub revision: u64,
    /// Cursors already live in the room.
    pub peers: Vec<PresenceEvent>,
    /// True when the catch-up replay for a reconnect was queued into
    /// `events`; false means start from `content`.
    pub replayed: bool,
    /// Outbound event stream for this session. Bounded; a transport that
    /// stops draining it is moved to grace-period by the room.
    pub events: mpsc::Receiver<ServerEvent>,
}

struct SessionRecord {
    user_id: Uuid,
    document_id: Uuid,
}

/// Routes sessions to rooms. One instance per engine process.
pub struct SessionManager {
    config: Arc<EngineConfig>,
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn DocumentStore>,
    metrics: Arc<EngineMetrics>,
    rooms: RwLock<HashMap<Uuid, RoomHandle>>,
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
    notice_tx: mpsc::UnboundedSender<RoomNotice>,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn DocumentStore>,
    ) -> Arc<SessionManager> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager {
            config: Arc::new(config),
            auth,
            store,
            metrics: Arc::new(EngineMetrics::new()),
            rooms: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            notice_tx,
        });
        tokio::spawn(Self::drain_notices(Arc::downgrade(&manager), notice_rx));
        manager
    }

    /// Rooms report expired grace-period sessions here so the routing table
    /// stays in sync without the rooms knowing about it.
    async fn drain_notices(
        manager: Weak<SessionManager>,
        mut notices: mpsc::UnboundedReceiver<RoomNotice>,
    ) {
        while let Some(notice) = notices.recv().await {
            let Some(manager) = manager.upgrade() else { break };
            match notice {
                RoomNotice::SessionExpired { session_id } => {
                    if manager.sessions.write().await.remove(&session_id).is_some() {
                        log::debug!("Session {session_id} removed from routing after expiry");
                    }
                }
            }
        }
    }

    /// Open a session on a document. Verifies the token, resolves or
    /// creates the room, and, when `last_acked` is given, queues the
    /// replay of `(last_acked, current]` ahead of live traffic.
    pub async fn join(
        &self,
        token: &str,
        document_id: Uuid,
        last_acked: Option<u64>,
    ) -> Result<JoinGrant, EngineError> {
        let user_id = self.auth.verify(token).await?;
        let session_id = Uuid::new_v4();

        // The room can close between lookup and join (its last session
        // leaving); one retry re-resolves against a fresh room.
        let mut info = None;
        let mut events = None;
        for _ in 0..2 {
            let room = self.room_for(document_id).await?;
            let (tx, rx) = mpsc::channel(self.config.session_buffer_capacity);
            match room.join(session_id, user_id, tx, last_acked).await {
                Ok(joined) => {
                    info = Some(joined);
                    events = Some(rx);
                    break;
                }
                Err(EngineError::RoomClosed) => continue,
                Err(err) => return Err(err),
            }
        }
        let (Some(info), Some(events)) = (info, events) else {
            return Err(EngineError::RoomClosed);
        };

        self.sessions
            .write()
            .await
            .insert(session_id, SessionRecord { user_id, document_id });
        self.metrics.sessions_opened.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        log::info!("User {user_id} joined doc {document_id} as session {session_id}");

        Ok(JoinGrant {
            session_id,
            user_id,
            document_id,
            content: info.content,
            revision: info.revision,
            peers: info.peers,
            replayed: info.replayed,
            events,
        })
    }

    /// Submit a raw operation payload (the `payload` object of an
    /// `operation` frame) for a session.
    pub async fn submit(&self, session_id: Uuid, raw_operation: &str) -> Result<Revision, EngineError> {
        let payload: OperationPayload = serde_json::from_str(raw_operation)
            .map_err(|e| EngineError::MalformedOperation(e.to_string()))?;
        self.submit_operation(session_id, payload).await
    }

    /// Typed submission path. The operation is stamped with the session's
    /// document and identity; clients cannot forge authorship.
    pub async fn submit_operation(
        &self,
        session_id: Uuid,
        payload: OperationPayload,
    ) -> Result<Revision, EngineError> {
        let document_id = self.document_of(session_id).await?;
        let operation = payload.into_operation(document_id, session_id);
        operation.validate(self.config.max_operation_len)?;

        let room = self.room_of(document_id).await?;
        room.submit(session_id, operation).await
    }

    /// Record the latest revision a session has applied.
    pub async fn ack(&self, session_id: Uuid, revision: u64) -> Result<(), EngineError> {
        let document_id = self.document_of(session_id).await?;
        self.room_of(document_id).await?.ack(session_id, revision).await
    }

    /// Best-effort presence update; never ordered against content.
    pub async fn update_cursor(
        &self,
        session_id: Uuid,
        cursor: CursorState,
    ) -> Result<(), EngineError> {
        let document_id = self.document_of(session_id).await?;
        self.room_of(document_id).await?.cursor(session_id, cursor)
    }

    /// Explicit departure: the session is destroyed immediately.
    pub async fn leave(&self, session_id: Uuid) -> Result<(), EngineError> {
        let record = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(EngineError::UnknownSession(session_id))?;
        if let Some(room) = self.lookup_room(record.document_id).await {
            // The room may already be gone; leaving a closed room is moot.
            let _ = room.leave(session_id).await;
        }
        log::info!("Session {session_id} left doc {}", record.document_id);
        Ok(())
    }

    /// Abrupt disconnect: the session survives in grace-period and can be
    /// resumed by a fresh join carrying its last acked revision.
    pub async fn disconnect(&self, session_id: Uuid) -> Result<(), EngineError> {
        let document_id = self.document_of(session_id).await?;
        self.room_of(document_id).await?.disconnect(session_id).await
    }

    /// Route a full inbound frame for an established session. Join frames
    /// must go through [`SessionManager::join`]; everything else lands
    /// here. Returns the applied revision for operation frames.
    pub async fn dispatch(
        &self,
        session_id: Uuid,
        raw: &str,
    ) -> Result<Option<Revision>, EngineError> {
        let event = ClientEvent::decode(raw)?;
        let document_id = self.document_of(session_id).await?;
        if event.document_id() != document_id {
            return Err(EngineError::MalformedOperation(
                "frame document_id does not match session".into(),
            ));
        }
        match event {
            ClientEvent::Operation { payload, .. } => {
                Ok(Some(self.submit_operation(session_id, payload).await?))
            }
            ClientEvent::Cursor { payload, .. } => {
                self.update_cursor(session_id, payload).await?;
                Ok(None)
            }
            ClientEvent::Ack { payload, .. } => {
                self.ack(session_id, payload.revision).await?;
                Ok(None)
            }
            ClientEvent::Leave { .. } => {
                self.leave(session_id).await?;
                Ok(None)
            }
            ClientEvent::Join { .. } => Err(EngineError::MalformedOperation(
                "join is not valid on an established session".into(),
            )),
        }
    }

    /// Health report for the monitoring collaborator. Also sweeps handles
    /// of rooms that have shut down.
    pub async fn health(&self) -> HealthStatus {
        let mut closed = Vec::new();
        let mut reports: Vec<RoomHealth> = Vec::new();
        {
            let rooms = self.rooms.read().await;
            for (document_id, room) in rooms.iter() {
                match room.health().await {
                    Ok(report) => reports.push(report),
                    Err(_) => closed.push(*document_id),
                }
            }
        }
        if !closed.is_empty() {
            let mut rooms = self.rooms.write().await;
            for document_id in closed {
                if rooms.get(&document_id).is_some_and(|room| room.is_closed()) {
                    rooms.remove(&document_id);
                }
            }
        }
        HealthStatus::ok(reports, self.metrics.snapshot())
    }

    /// Number of rooms with a live sequencer.
    pub async fn open_rooms(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().filter(|room| !room.is_closed()).count()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    async fn document_of(&self, session_id: Uuid) -> Result<Uuid, EngineError> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|record| record.document_id)
            .ok_or(EngineError::UnknownSession(session_id))
    }

    async fn lookup_room(&self, document_id: Uuid) -> Option<RoomHandle> {
        self.rooms.read().await.get(&document_id).cloned()
    }

    /// Room for an established session; the room must already exist.
    async fn room_of(&self, document_id: Uuid) -> Result<RoomHandle, EngineError> {
        self.lookup_room(document_id).await.ok_or(EngineError::RoomClosed)
    }

    /// Resolve or create the room for a document. Creation loads the
    /// baseline snapshot from the document store first, outside any lock.
    async fn room_for(&self, document_id: Uuid) -> Result<RoomHandle, EngineError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&document_id) {
                if !room.is_closed() {
                    return Ok(room.clone());
                }
            }
        }

        let (content, revision) = self.store.load_snapshot(document_id).await?;

        let mut rooms = self.rooms.write().await;
        // Double-check after reacquiring: another join may have won.
        if let Some(room) = rooms.get(&document_id) {
            if !room.is_closed() {
                return Ok(room.clone());
            }
        }
        let room = RoomHandle::open(
            document_id,
            content,
            revision,
            self.config.clone(),
            self.store.clone(),
            self.metrics.clone(),
            self.notice_tx.clone(),
        );
        rooms.insert(document_id, room.clone());
        Ok(room)
    }
}
