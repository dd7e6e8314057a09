//! # collabdocs-engine — Real-time collaborative editing core
//!
//! Accepts concurrent text operations from many clients editing the same
//! document, establishes a single causal order for them, and resolves
//! conflicts with operational transformation so every client converges on
//! identical content.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  join/submit   ┌────────────────┐  bounded mpsc  ┌───────────────┐
//! │ Transport  │ ─────────────► │ SessionManager │ ─────────────► │ Room (actor)  │
//! │ (external) │ ◄───────────── │  auth + routing│ ◄───────────── │  OT sequencer │
//! └────────────┘  event stream  └────────────────┘   broadcasts   └──────┬────────┘
//!                                                                        │
//!                                                          ┌─────────────┼──────────────┐
//!                                                          ▼             ▼              ▼
//!                                                   RevisionLog   PresenceTracker  Checkpoint
//!                                                   (append-only) (latest-wins)    (detached,
//!                                                                                   backoff)
//! ```
//!
//! One sequential actor owns each open document: no locks around content or
//! revision counters, and one room's work never blocks another's. The
//! revision log's append order is the only happened-before order exposed.
//!
//! ## Modules
//!
//! - [`op`] — operation model and codec (insert / delete / retain-composite)
//! - [`transform`] — pure OT: `transform`, `compose`, `apply`
//! - [`revlog`] — append-only revision log with windowed pruning
//! - [`room`] — single-writer sequencer actor per document
//! - [`session`] — session lifecycle, routing, broadcast fan-out
//! - [`presence`] — ephemeral cursor/selection state, latest-wins
//! - [`checkpoint`] — snapshot hand-off with exponential backoff
//! - [`protocol`] — JSON wire contract (ISO-8601 timestamps)
//! - [`store`] — auth and document-store collaborator seams
//! - [`metrics`] — lock-free counters and the health surface

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metrics;
pub mod op;
pub mod presence;
pub mod protocol;
pub mod revlog;
pub mod room;
pub mod session;
pub mod store;
pub mod transform;

// Re-exports for convenience
pub use checkpoint::{CheckpointPolicy, RetryPolicy};
pub use config::EngineConfig;
pub use error::EngineError;
pub use metrics::{EngineMetrics, HealthStatus, MetricsSnapshot, RoomHealth};
pub use op::{Edit, OpKind, Operation};
pub use presence::{CursorState, PresenceEvent, PresenceTracker, Selection};
pub use protocol::{ClientEvent, ErrorPayload, JoinPayload, OperationPayload, ServerEvent};
pub use revlog::{Revision, RevisionLog};
pub use room::{ConnectionState, JoinInfo, RoomHandle};
pub use session::{JoinGrant, SessionManager};
pub use store::{AuthProvider, DocumentStore, MemoryStore, StaticAuth};
