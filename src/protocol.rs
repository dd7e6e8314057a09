//! Transport-boundary message types.
//!
//! The engine does not own the transport; whatever carries these frames
//! (WebSocket, in-process channel, test harness) exchanges the JSON shapes
//! defined here. This framing is the externally observable wire contract
//! and must stay stable for client compatibility:
//!
//! ```text
//! inbound   {"type": "join" | "operation" | "cursor" | "leave" | "ack",
//!            "document_id": …, "timestamp": ISO-8601, "payload": …}
//! outbound  {"type": "operation_applied" | "cursor_update" | "user_joined"
//!            | "user_left" | "error",
//!            "timestamp": ISO-8601, "revision"?: …, "payload": …}
//! ```
//!
//! Error payloads carry the stable codes from [`EngineError::code`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::op::{OpKind, Operation};
use crate::presence::{CursorState, PresenceEvent};
use crate::revlog::Revision;

/// Join request payload. The token is opaque to the engine and handed to
/// the auth collaborator verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub token: String,
    /// Present on reconnect: the engine replays `(last_acked_revision,
    /// current]` into the new session before live traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_acked_revision: Option<u64>,
}

/// Operation payload as submitted by a client. Document and author identity
/// come from the session, never from the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub base_revision: u64,
    #[serde(flatten)]
    pub kind: OpKind,
    pub client_op_id: Uuid,
}

impl OperationPayload {
    /// Normalize into an [`Operation`] stamped with session identity.
    pub fn into_operation(self, document_id: Uuid, author_session_id: Uuid) -> Operation {
        Operation {
            document_id,
            author_session_id,
            base_revision: self.base_revision,
            kind: self.kind,
            client_op_id: self.client_op_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub revision: u64,
}

/// Inbound client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        document_id: Uuid,
        timestamp: DateTime<Utc>,
        payload: JoinPayload,
    },
    Operation {
        document_id: Uuid,
        timestamp: DateTime<Utc>,
        payload: OperationPayload,
    },
    Cursor {
        document_id: Uuid,
        timestamp: DateTime<Utc>,
        payload: CursorState,
    },
    Leave {
        document_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Ack {
        document_id: Uuid,
        timestamp: DateTime<Utc>,
        payload: AckPayload,
    },
}

impl ClientEvent {
    pub fn decode(raw: &str) -> Result<ClientEvent, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::MalformedOperation(e.to_string()))
    }

    pub fn document_id(&self) -> Uuid {
        match self {
            ClientEvent::Join { document_id, .. }
            | ClientEvent::Operation { document_id, .. }
            | ClientEvent::Cursor { document_id, .. }
            | ClientEvent::Leave { document_id, .. }
            | ClientEvent::Ack { document_id, .. } => *document_id,
        }
    }
}

/// Session identity attached to join/leave notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub session_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Outbound server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    OperationApplied {
        timestamp: DateTime<Utc>,
        revision: u64,
        /// The operation as actually applied, post-transform.
        payload: Operation,
    },
    CursorUpdate {
        timestamp: DateTime<Utc>,
        payload: PresenceEvent,
    },
    UserJoined {
        timestamp: DateTime<Utc>,
        payload: UserPayload,
    },
    UserLeft {
        timestamp: DateTime<Utc>,
        payload: UserPayload,
    },
    Error {
        timestamp: DateTime<Utc>,
        payload: ErrorPayload,
    },
}

impl ServerEvent {
    pub fn operation_applied(revision: &Revision) -> ServerEvent {
        ServerEvent::OperationApplied {
            timestamp: Utc::now(),
            revision: revision.revision_number,
            payload: revision.operation.clone(),
        }
    }

    pub fn cursor_update(event: PresenceEvent) -> ServerEvent {
        ServerEvent::CursorUpdate { timestamp: Utc::now(), payload: event }
    }

    pub fn user_joined(session_id: Uuid, user_id: Uuid) -> ServerEvent {
        ServerEvent::UserJoined {
            timestamp: Utc::now(),
            payload: UserPayload { session_id, user_id },
        }
    }

    pub fn user_left(session_id: Uuid, user_id: Uuid) -> ServerEvent {
        ServerEvent::UserLeft {
            timestamp: Utc::now(),
            payload: UserPayload { session_id, user_id },
        }
    }

    pub fn error(err: &EngineError) -> ServerEvent {
        ServerEvent::Error {
            timestamp: Utc::now(),
            payload: ErrorPayload { code: err.code().to_string(), message: err.to_string() },
        }
    }

    pub fn encode(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::Internal(e.to_string()))
    }

    /// Applied revision number, for `operation_applied` events.
    pub fn revision(&self) -> Option<u64> {
        match self {
            ServerEvent::OperationApplied { revision, .. } => Some(*revision),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_roundtrip() {
        let event = ClientEvent::Join {
            document_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload: JoinPayload { token: "tok".into(), last_acked_revision: Some(7) },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"join\""));
        assert!(json.contains("\"last_acked_revision\":7"));
        assert_eq!(ClientEvent::decode(&json).unwrap(), event);
    }

    #[test]
    fn test_fresh_join_omits_last_acked() {
        let event = ClientEvent::Join {
            document_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload: JoinPayload { token: "tok".into(), last_acked_revision: None },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("last_acked_revision"));
    }

    #[test]
    fn test_operation_payload_flattens_kind() {
        let event = ClientEvent::Operation {
            document_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload: OperationPayload {
                base_revision: 5,
                kind: OpKind::Insert { position: 5, content: " world".into() },
                client_op_id: Uuid::new_v4(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"operation\""));
        assert!(json.contains("\"kind\":\"insert\""));
        assert!(json.contains("\"base_revision\":5"));
        assert_eq!(ClientEvent::decode(&json).unwrap(), event);
    }

    #[test]
    fn test_timestamp_is_iso8601() {
        let event = ClientEvent::Leave { document_id: Uuid::new_v4(), timestamp: Utc::now() };
        let json = serde_json::to_string(&event).unwrap();
        // Date and time separated by 'T', the RFC 3339 / ISO-8601 shape.
        let timestamp = json.split("\"timestamp\":\"").nth(1).unwrap();
        assert!(timestamp.split('"').next().unwrap().contains('T'));
    }

    #[test]
    fn test_cursor_and_ack_roundtrip() {
        let cursor = ClientEvent::Cursor {
            document_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload: CursorState { position: 3, selection: None },
        };
        let json = serde_json::to_string(&cursor).unwrap();
        assert!(json.contains("\"type\":\"cursor\""));
        assert_eq!(ClientEvent::decode(&json).unwrap(), cursor);

        let ack = ClientEvent::Ack {
            document_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload: AckPayload { revision: 12 },
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"type\":\"ack\""));
        assert_eq!(ClientEvent::decode(&json).unwrap(), ack);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let raw = format!(
            r#"{{"type":"teleport","document_id":"{}","timestamp":"2026-01-01T00:00:00Z"}}"#,
            Uuid::new_v4()
        );
        assert_eq!(ClientEvent::decode(&raw).unwrap_err().code(), "malformed_operation");
    }

    #[test]
    fn test_operation_applied_wire_shape() {
        let revision = Revision {
            document_id: Uuid::new_v4(),
            revision_number: 6,
            operation: Operation {
                document_id: Uuid::new_v4(),
                author_session_id: Uuid::new_v4(),
                base_revision: 5,
                kind: OpKind::Insert { position: 5, content: " world".into() },
                client_op_id: Uuid::new_v4(),
            },
            applied_at: Utc::now(),
        };
        let event = ServerEvent::operation_applied(&revision);
        let json = event.encode().unwrap();
        assert!(json.contains("\"type\":\"operation_applied\""));
        assert!(json.contains("\"revision\":6"));
        assert_eq!(event.revision(), Some(6));

        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_error_event_carries_stable_code() {
        let event = ServerEvent::error(&EngineError::Backpressure);
        let json = event.encode().unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"backpressure\""));

        let event = ServerEvent::error(&EngineError::StaleBase {
            base_revision: 1,
            earliest: 4,
            head: 9,
        });
        assert!(event.encode().unwrap().contains("\"code\":\"stale_base\""));
    }

    #[test]
    fn test_user_joined_left_tags() {
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let joined = ServerEvent::user_joined(session, user).encode().unwrap();
        let left = ServerEvent::user_left(session, user).encode().unwrap();
        assert!(joined.contains("\"type\":\"user_joined\""));
        assert!(left.contains("\"type\":\"user_left\""));
    }

    #[test]
    fn test_cursor_update_tag() {
        let event = ServerEvent::cursor_update(PresenceEvent {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            cursor: CursorState { position: 1, selection: None },
            seq: 1,
        });
        assert!(event.encode().unwrap().contains("\"type\":\"cursor_update\""));
        assert_eq!(event.revision(), None);
    }
}
