//! Persistence port
//!
//! CRUD over Call/Client records is explicitly out of scope (§1 OUT OF
//! SCOPE) — this module defines the narrow trait boundary the core calls
//! through, plus one in-memory implementation used by default and by
//! tests. A real deployment swaps in a MongoDB/Redis-backed
//! implementation behind the same traits without touching the core.
//!
//! The trait exposes the specific mutations C12/DialogStateMachine need
//! (append a turn, advance status, attach a result, ...) rather than a
//! generic `update(|call| ...)` closure, so it stays object-safe and can
//! be held as `Arc<dyn CallStore>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{Call, CallId, CallResult, CallStatus, Client, ConversationTurn, Recording, RecordingEvent};

/// Errors a [`CallStore`]/[`ClientStore`] implementation may raise. Kept
/// intentionally small: the core only needs to know "not found" versus
/// "the backing store is unavailable".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("call not found: {0}")]
    CallNotFound(CallId),
    #[error("client not found: {0}")]
    ClientNotFound(String),
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Persistence operations C12 performs on [`Call`] records.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create(&self, call: Call) -> Result<(), StoreError>;
    async fn get(&self, call_id: CallId) -> Result<Call, StoreError>;
    async fn set_call_sid(&self, call_id: CallId, call_sid: String) -> Result<(), StoreError>;
    async fn set_status(&self, call_id: CallId, status: CallStatus) -> Result<(), StoreError>;
    async fn set_answered_at(&self, call_id: CallId, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn append_turn(&self, call_id: CallId, turn: ConversationTurn) -> Result<(), StoreError>;
    async fn append_recording(&self, call_id: CallId, recording: Recording) -> Result<(), StoreError>;
    async fn append_recording_event(&self, call_id: CallId, event: RecordingEvent) -> Result<(), StoreError>;
    /// Finalize the call: set terminal status, end timestamp, and result.
    /// Idempotent (§8 "`end(call-id)` is idempotent") — calling it again
    /// on an already-terminal call is a no-op.
    async fn finalize(
        &self,
        call_id: CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        result: CallResult,
    ) -> Result<(), StoreError>;
}

/// Persistence operations C12 performs on [`Client`] records.
#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get(&self, client_id: &str) -> Result<Client, StoreError>;
}

/// Default in-memory store: a [`DashMap`] behind the trait boundary.
/// Sufficient for tests and for operating without an external database;
/// calls do not survive a process restart.
pub struct InMemoryCallStore {
    calls: DashMap<CallId, Call>,
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self { calls: DashMap::new() }
    }
}

impl Default for InMemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn create(&self, call: Call) -> Result<(), StoreError> {
        self.calls.insert(call.call_id, call);
        Ok(())
    }

    async fn get(&self, call_id: CallId) -> Result<Call, StoreError> {
        self.calls
            .get(&call_id)
            .map(|c| c.clone())
            .ok_or(StoreError::CallNotFound(call_id))
    }

    async fn set_call_sid(&self, call_id: CallId, call_sid: String) -> Result<(), StoreError> {
        let mut entry = self.calls.get_mut(&call_id).ok_or(StoreError::CallNotFound(call_id))?;
        entry.call_sid = Some(call_sid);
        Ok(())
    }

    async fn set_status(&self, call_id: CallId, status: CallStatus) -> Result<(), StoreError> {
        let mut entry = self.calls.get_mut(&call_id).ok_or(StoreError::CallNotFound(call_id))?;
        if entry.status.is_terminal() {
            return Ok(());
        }
        entry.status = status;
        Ok(())
    }

    async fn set_answered_at(&self, call_id: CallId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entry = self.calls.get_mut(&call_id).ok_or(StoreError::CallNotFound(call_id))?;
        entry.answered_at.get_or_insert(at);
        Ok(())
    }

    async fn append_turn(&self, call_id: CallId, turn: ConversationTurn) -> Result<(), StoreError> {
        let mut entry = self.calls.get_mut(&call_id).ok_or(StoreError::CallNotFound(call_id))?;
        entry.history.push(turn);
        Ok(())
    }

    async fn append_recording(&self, call_id: CallId, recording: Recording) -> Result<(), StoreError> {
        let mut entry = self.calls.get_mut(&call_id).ok_or(StoreError::CallNotFound(call_id))?;
        entry.recordings.push(recording);
        Ok(())
    }

    async fn append_recording_event(&self, call_id: CallId, event: RecordingEvent) -> Result<(), StoreError> {
        let mut entry = self.calls.get_mut(&call_id).ok_or(StoreError::CallNotFound(call_id))?;
        entry.recording_events.push(event);
        Ok(())
    }

    async fn finalize(
        &self,
        call_id: CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        result: CallResult,
    ) -> Result<(), StoreError> {
        let mut entry = self.calls.get_mut(&call_id).ok_or(StoreError::CallNotFound(call_id))?;
        if entry.status.is_terminal() {
            return Ok(());
        }
        entry.status = status;
        entry.ended_at = Some(ended_at);
        entry.result = Some(result);
        Ok(())
    }
}

/// In-memory client directory seeded at construction. A real deployment
/// would back this with the persistence layer's Client CRUD instead.
pub struct InMemoryClientStore {
    clients: DashMap<String, Client>,
}

impl InMemoryClientStore {
    pub fn new() -> Self {
        Self { clients: DashMap::new() }
    }

    pub fn seed(&self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }
}

impl Default for InMemoryClientStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientStore for InMemoryClientStore {
    async fn get(&self, client_id: &str) -> Result<Client, StoreError> {
        self.clients
            .get(client_id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::ClientNotFound(client_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryCallStore::new();
        let id = CallId::new_v4();
        store.create(Call::new(id, "client-1".to_string())).await.unwrap();
        let call = store.get(id).await.unwrap();
        assert_eq!(call.call_id, id);
        assert_eq!(call.status, CallStatus::Initiated);
    }

    #[tokio::test]
    async fn set_status_mutates_in_place() {
        let store = InMemoryCallStore::new();
        let id = CallId::new_v4();
        store.create(Call::new(id, "client-1".to_string())).await.unwrap();
        store.set_status(id, CallStatus::Ringing).await.unwrap();
        let call = store.get(id).await.unwrap();
        assert_eq!(call.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let store = InMemoryCallStore::new();
        let id = CallId::new_v4();
        store.create(Call::new(id, "client-1".to_string())).await.unwrap();
        let result = CallResult {
            agreement: true,
            promised_payment: Some(50000.0),
            next_contact_date: None,
            notes: vec![],
            terminal_reason: crate::types::TerminalReason::Agreement,
        };
        let now = Utc::now();
        store.finalize(id, CallStatus::Completed, now, result.clone()).await.unwrap();
        // Second finalize with a different status must be a no-op.
        store.finalize(id, CallStatus::Failed, now, result).await.unwrap();
        let call = store.get(id).await.unwrap();
        assert_eq!(call.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn get_missing_call_errors() {
        let store = InMemoryCallStore::new();
        let err = store.get(CallId::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::CallNotFound(_)));
    }

    #[tokio::test]
    async fn client_store_returns_seeded_client() {
        let store = InMemoryClientStore::new();
        store.seed(Client {
            id: "c1".to_string(),
            name: "Ivan Petrov".to_string(),
            phone: "+70000000000".to_string(),
            debt_amount: 50000.0,
            company: "Acme Collections".to_string(),
            contract_ref: "K-123".to_string(),
            partial_payment_offer: None,
        });
        let client = store.get("c1").await.unwrap();
        assert_eq!(client.name, "Ivan Petrov");
        assert!(store.get("missing").await.is_err());
    }
}
