//! Operation model and codec.
//!
//! A client edit arrives as JSON and is normalized into an [`Operation`]
//! before it reaches any room. Positions and lengths are codepoint offsets,
//! never bytes; the transform engine and the materializer both address text
//! the same way, which is what keeps replicas convergent.
//!
//! Wire shape (flattened `kind` tag):
//! ```text
//! {"document_id": …, "author_session_id": …, "base_revision": 5,
//!  "kind": "insert", "position": 5, "content": " world",
//!  "client_op_id": …}
//! ```
//!
//! The third kind, `retain-composite`, is a multi-span edit expressed in the
//! coordinates of one base state. Spans are applied highest-position-first so
//! the lower spans' coordinates stay valid while applying.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// One primitive span inside a composite operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    Insert { position: u64, content: String },
    Delete { position: u64, length: u64 },
}

impl Edit {
    pub fn position(&self) -> u64 {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// Codepoints inserted or removed by this span.
    pub fn span_len(&self) -> u64 {
        match self {
            Edit::Insert { content, .. } => content.chars().count() as u64,
            Edit::Delete { length, .. } => *length,
        }
    }

    /// First offset past the span's footprint in its base coordinates.
    pub fn end(&self) -> u64 {
        match self {
            Edit::Insert { position, .. } => *position,
            Edit::Delete { position, length } => position + length,
        }
    }
}

/// The payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    Insert {
        position: u64,
        content: String,
    },
    Delete {
        position: u64,
        length: u64,
    },
    /// Multi-span edit against a single base state. Spans are ordered by
    /// strictly descending position and must not overlap.
    #[serde(rename = "retain-composite")]
    Composite { edits: Vec<Edit> },
}

impl OpKind {
    /// The operation's spans, descending by position. Single-span kinds
    /// normalize to a one-element list.
    pub fn edits(&self) -> Vec<Edit> {
        match self {
            OpKind::Insert { position, content } => vec![Edit::Insert {
                position: *position,
                content: content.clone(),
            }],
            OpKind::Delete { position, length } => vec![Edit::Delete {
                position: *position,
                length: *length,
            }],
            OpKind::Composite { edits } => edits.clone(),
        }
    }

    /// Rebuild a kind from transformed spans, collapsing to the simplest
    /// representation. An empty span list is an identity edit.
    pub fn from_edits(mut edits: Vec<Edit>) -> OpKind {
        edits.retain(|e| !matches!(e, Edit::Delete { length: 0, .. }));
        match edits.len() {
            0 => OpKind::Delete { position: 0, length: 0 },
            1 => match edits.pop().unwrap_or(Edit::Delete { position: 0, length: 0 }) {
                Edit::Insert { position, content } => OpKind::Insert { position, content },
                Edit::Delete { position, length } => OpKind::Delete { position, length },
            },
            _ => OpKind::Composite { edits },
        }
    }

    /// Total size in codepoints, the unit the operation limit is set in.
    pub fn size(&self) -> u64 {
        match self {
            OpKind::Insert { content, .. } => content.chars().count() as u64,
            OpKind::Delete { length, .. } => *length,
            OpKind::Composite { edits } => edits.iter().map(Edit::span_len).sum(),
        }
    }

    /// Identity edit, produced when a transform swallows an operation whole.
    pub fn is_noop(&self) -> bool {
        match self {
            OpKind::Delete { length, .. } => *length == 0,
            OpKind::Composite { edits } => edits.is_empty(),
            OpKind::Insert { content, .. } => content.is_empty(),
        }
    }
}

/// A normalized client edit. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub document_id: Uuid,
    /// Submitting session; the insert-vs-insert tie-break orders on this id.
    pub author_session_id: Uuid,
    /// Revision the author had applied when it authored this op.
    pub base_revision: u64,
    #[serde(flatten)]
    pub kind: OpKind,
    /// Idempotency token: resubmissions with the same id return the
    /// originally applied revision.
    pub client_op_id: Uuid,
}

impl Operation {
    /// Parse and validate a raw JSON operation.
    pub fn decode(raw: &str, max_operation_len: u64) -> Result<Operation, EngineError> {
        let op: Operation = serde_json::from_str(raw)
            .map_err(|e| EngineError::MalformedOperation(e.to_string()))?;
        op.validate(max_operation_len)?;
        Ok(op)
    }

    /// Structural and size validation. Pure; touches no state.
    pub fn validate(&self, max_operation_len: u64) -> Result<(), EngineError> {
        let size = self.kind.size();
        if size > max_operation_len {
            return Err(EngineError::OperationTooLarge { size, max: max_operation_len });
        }
        match &self.kind {
            OpKind::Insert { content, .. } => validate_content(content),
            OpKind::Delete { length, .. } => {
                if *length == 0 {
                    return Err(EngineError::MalformedOperation(
                        "zero-length delete".into(),
                    ));
                }
                Ok(())
            }
            OpKind::Composite { edits } => validate_composite(edits),
        }
    }

    /// Same operation with new spans; metadata carried through untouched.
    pub fn with_kind(&self, kind: OpKind) -> Operation {
        Operation { kind, ..self.clone() }
    }
}

fn validate_content(content: &str) -> Result<(), EngineError> {
    if content.is_empty() {
        return Err(EngineError::MalformedOperation("empty insert content".into()));
    }
    if content.contains('\u{0}') {
        return Err(EngineError::MalformedOperation("NUL in insert content".into()));
    }
    Ok(())
}

fn validate_composite(edits: &[Edit]) -> Result<(), EngineError> {
    if edits.is_empty() {
        return Err(EngineError::MalformedOperation("empty composite".into()));
    }
    for edit in edits {
        match edit {
            Edit::Insert { content, .. } => validate_content(content)?,
            Edit::Delete { length, .. } => {
                if *length == 0 {
                    return Err(EngineError::MalformedOperation(
                        "zero-length delete span".into(),
                    ));
                }
            }
        }
    }
    // Descending, non-overlapping span order is the application contract.
    for pair in edits.windows(2) {
        let (hi, lo) = (&pair[0], &pair[1]);
        if lo.position() >= hi.position() || lo.end() > hi.position() {
            return Err(EngineError::MalformedOperation(
                "composite spans must be descending and disjoint".into(),
            ));
        }
    }
    Ok(())
}
