//! External collaborator seams: authentication and durable document storage.
//!
//! The engine does not own identity or long-term storage. Both arrive as
//! trait objects so deployments can plug in their user service and document
//! service; the in-memory implementations below back the tests and make the
//! engine usable embedded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;

/// Token verification, consulted once per connection at join time.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Uuid, EngineError>;
}

/// Durable snapshot storage, consumed by room creation and checkpointing.
///
/// `load_snapshot` for a document that was never saved returns empty content
/// at revision 0, the baseline every document starts from.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_snapshot(&self, document_id: Uuid) -> Result<(String, u64), EngineError>;
    async fn save_snapshot(
        &self,
        document_id: Uuid,
        content: &str,
        revision: u64,
    ) -> Result<(), EngineError>;
}

/// Fixed token table. Unknown tokens fail with `Unauthorized`.
#[derive(Default)]
pub struct StaticAuth {
    tokens: HashMap<String, Uuid>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: Uuid) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn verify(&self, token: &str) -> Result<Uuid, EngineError> {
        self.tokens.get(token).copied().ok_or(EngineError::Unauthorized)
    }
}

/// In-memory snapshot store with a fault toggle for exercising the
/// checkpoint retry path.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<Uuid, (String, u64)>>,
    unavailable: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, both load and save fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Directly read a persisted snapshot.
    pub async fn snapshot(&self, document_id: Uuid) -> Option<(String, u64)> {
        self.docs.read().await.get(&document_id).cloned()
    }

    /// Seed a snapshot, as if a previous run had checkpointed it.
    pub async fn seed(&self, document_id: Uuid, content: impl Into<String>, revision: u64) {
        self.docs.write().await.insert(document_id, (content.into(), revision));
    }

    fn check_available(&self) -> Result<(), EngineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::StoreUnavailable("store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_snapshot(&self, document_id: Uuid) -> Result<(String, u64), EngineError> {
        self.check_available()?;
        Ok(self
            .docs
            .read()
            .await
            .get(&document_id)
            .cloned()
            .unwrap_or_else(|| (String::new(), 0)))
    }

    async fn save_snapshot(
        &self,
        document_id: Uuid,
        content: &str,
        revision: u64,
    ) -> Result<(), EngineError> {
        self.check_available()?;
        let mut docs = self.docs.write().await;
        docs.insert(document_id, (content.to_string(), revision));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
