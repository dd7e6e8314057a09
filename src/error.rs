//! Error taxonomy for the collaboration engine.
//!
//! Every client-facing failure maps to a stable machine-readable code that
//! travels in `error` events over the transport. Codes are part of the wire
//! contract and must not change between releases.

use uuid::Uuid;

/// Engine-wide error type.
///
/// A failed operation never takes the room down with it: errors are returned
/// to the submitting session and the sequencer keeps serving everyone else.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Client data failed to parse or validate. No state was mutated.
    MalformedOperation(String),
    /// The operation's base revision is outside the replayable window, or
    /// ahead of the room head. The client must resync from a fresh snapshot.
    StaleBase { base_revision: u64, earliest: u64, head: u64 },
    /// Operation exceeds the configured size limit.
    OperationTooLarge { size: u64, max: u64 },
    /// The document's room is being torn down. Retry the join.
    RoomClosed,
    /// The external document store rejected a load or save.
    StoreUnavailable(String),
    /// The room's inbound queue is full. Retry after a short delay.
    Backpressure,
    /// Token verification failed at join time.
    Unauthorized,
    /// No session with this id is registered.
    UnknownSession(Uuid),
    /// Unexpected fault while processing a single operation. The operation
    /// was rejected for its author only; room state is unaffected.
    Internal(String),
}

impl EngineError {
    /// Stable wire code for `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MalformedOperation(_) => "malformed_operation",
            EngineError::StaleBase { .. } => "stale_base",
            EngineError::OperationTooLarge { .. } => "operation_too_large",
            EngineError::RoomClosed => "room_closed",
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::Backpressure => "backpressure",
            EngineError::Unauthorized => "unauthorized",
            EngineError::UnknownSession(_) => "unknown_session",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether the client may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Backpressure | EngineError::RoomClosed | EngineError::StoreUnavailable(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MalformedOperation(reason) => {
                write!(f, "Malformed operation: {reason}")
            }
            EngineError::StaleBase { base_revision, earliest, head } => write!(
                f,
                "Base revision {base_revision} outside replayable range [{earliest}, {head}]; resync required"
            ),
            EngineError::OperationTooLarge { size, max } => {
                write!(f, "Operation size {size} exceeds limit {max}")
            }
            EngineError::RoomClosed => write!(f, "Room is closed; retry join"),
            EngineError::StoreUnavailable(reason) => {
                write!(f, "Document store unavailable: {reason}")
            }
            EngineError::Backpressure => {
                write!(f, "Room queue full; retry after a short delay")
            }
            EngineError::Unauthorized => write!(f, "Token verification failed"),
            EngineError::UnknownSession(id) => write!(f, "Unknown session {id}"),
            EngineError::Internal(reason) => write!(f, "Internal error: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}
