//! Event store interface
//!
//! The sync engine never owns the vehicle ledger. It reads and mutates it
//! through [`EventStore`], implemented by the surrounding application.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::event_id::EventId;
use crate::session::{ExitUpdate, NewEntry, VehicleSession};

/// Durable vehicle-session ledger used by the sync engine
///
/// Every mutation must bump the record's `updated_at_ms` so that
/// [`query_since`](EventStore::query_since) returns both new entries and
/// entries closed since the given instant.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Whether a session with this event id has been recorded
    async fn event_exists(&self, event_id: &EventId) -> StoreResult<bool>;

    /// Session currently IN for this plate, if any
    async fn find_open_session(&self, plate_id: &str) -> StoreResult<Option<VehicleSession>>;

    /// Session by event id
    async fn get_session(&self, event_id: &EventId) -> StoreResult<Option<VehicleSession>>;

    /// Open a new session, returning its row id
    ///
    /// Fails with [`StoreError::DuplicateEvent`] if the event id is taken.
    async fn insert_entry(&self, entry: NewEntry) -> StoreResult<u64>;

    /// Close the session with this event id. Returns `false` if none exists.
    async fn update_exit(&self, event_id: &EventId, exit: &ExitUpdate) -> StoreResult<bool>;

    /// Remove the session with this event id. Returns `false` if none exists.
    async fn delete_by_event_id(&self, event_id: &EventId) -> StoreResult<bool>;

    /// Sessions with `updated_at_ms >= since_ms`, oldest first, at most `limit`
    async fn query_since(&self, since_ms: i64, limit: usize) -> StoreResult<Vec<VehicleSession>>;

    /// Last backfill watermark for a peer
    async fn get_peer_watermark(&self, peer_node_id: &str) -> StoreResult<Option<i64>>;

    async fn set_peer_watermark(&self, peer_node_id: &str, timestamp_ms: i64) -> StoreResult<()>;

    /// Supersede `existing` with `incoming`
    ///
    /// Stores that support transactions should override this so the swap is
    /// atomic.
    async fn replace_open_session(
        &self,
        existing: &EventId,
        incoming: NewEntry,
    ) -> StoreResult<u64> {
        self.delete_by_event_id(existing).await?;
        self.insert_entry(incoming).await
    }
}

/// Current wall clock in Unix millis
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    sessions: HashMap<u64, VehicleSession>,
    by_event: HashMap<EventId, u64>,
    watermarks: HashMap<String, i64>,
}

impl MemoryState {
    fn insert(&mut self, session: VehicleSession) -> StoreResult<u64> {
        if let Some(event_id) = &session.event_id {
            if self.by_event.contains_key(event_id) {
                return Err(StoreError::DuplicateEvent(event_id.to_string()));
            }
        }
        self.next_id += 1;
        let id = self.next_id;
        if let Some(event_id) = &session.event_id {
            self.by_event.insert(event_id.clone(), id);
        }
        self.sessions.insert(id, session);
        Ok(id)
    }

    fn remove(&mut self, event_id: &EventId) -> bool {
        match self.by_event.remove(event_id) {
            Some(id) => self.sessions.remove(&id).is_some(),
            None => false,
        }
    }
}

/// In-memory [`EventStore`] for tests and embedded use
#[derive(Default)]
pub struct MemoryEventStore {
    state: RwLock<MemoryState>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with pre-built sessions, keeping their `updated_at_ms`
    pub fn with_sessions(sessions: impl IntoIterator<Item = VehicleSession>) -> StoreResult<Self> {
        let store = Self::new();
        {
            let mut state = store.state.write();
            for session in sessions {
                state.insert(session)?;
            }
        }
        Ok(store)
    }

    /// Snapshot of every session, in insertion order
    pub fn sessions(&self) -> Vec<VehicleSession> {
        let state = self.state.read();
        let mut rows: Vec<_> = state.sessions.iter().collect();
        rows.sort_by_key(|(id, _)| **id);
        rows.into_iter().map(|(_, s)| s.clone()).collect()
    }

    /// Sessions currently IN for a plate
    pub fn open_sessions(&self, plate_id: &str) -> Vec<VehicleSession> {
        self.sessions()
            .into_iter()
            .filter(|s| s.plate_id == plate_id && s.is_open())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn event_exists(&self, event_id: &EventId) -> StoreResult<bool> {
        Ok(self.state.read().by_event.contains_key(event_id))
    }

    async fn find_open_session(&self, plate_id: &str) -> StoreResult<Option<VehicleSession>> {
        let state = self.state.read();
        let mut open: Vec<_> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.plate_id == plate_id && s.is_open())
            .collect();
        open.sort_by_key(|(id, _)| **id);
        Ok(open.first().map(|(_, s)| (*s).clone()))
    }

    async fn get_session(&self, event_id: &EventId) -> StoreResult<Option<VehicleSession>> {
        let state = self.state.read();
        Ok(state
            .by_event
            .get(event_id)
            .and_then(|id| state.sessions.get(id))
            .cloned())
    }

    async fn insert_entry(&self, entry: NewEntry) -> StoreResult<u64> {
        self.state.write().insert(VehicleSession::open(entry, now_ms()))
    }

    async fn update_exit(&self, event_id: &EventId, exit: &ExitUpdate) -> StoreResult<bool> {
        let mut state = self.state.write();
        let Some(id) = state.by_event.get(event_id).copied() else {
            return Ok(false);
        };
        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.close(exit, now_ms());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_by_event_id(&self, event_id: &EventId) -> StoreResult<bool> {
        Ok(self.state.write().remove(event_id))
    }

    async fn query_since(&self, since_ms: i64, limit: usize) -> StoreResult<Vec<VehicleSession>> {
        let state = self.state.read();
        let mut rows: Vec<_> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.updated_at_ms >= since_ms)
            .collect();
        rows.sort_by_key(|(id, s)| (s.updated_at_ms, **id));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn get_peer_watermark(&self, peer_node_id: &str) -> StoreResult<Option<i64>> {
        Ok(self.state.read().watermarks.get(peer_node_id).copied())
    }

    async fn set_peer_watermark(&self, peer_node_id: &str, timestamp_ms: i64) -> StoreResult<()> {
        self.state
            .write()
            .watermarks
            .insert(peer_node_id.to_string(), timestamp_ms);
        Ok(())
    }

    async fn replace_open_session(
        &self,
        existing: &EventId,
        incoming: NewEntry,
    ) -> StoreResult<u64> {
        let mut state = self.state.write();
        if let Some(event_id) = &incoming.event_id {
            if state.by_event.contains_key(event_id) {
                return Err(StoreError::DuplicateEvent(event_id.to_string()));
            }
        }
        state.remove(existing);
        state.insert(VehicleSession::open(incoming, now_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionStatus, SyncStatus};

    fn entry(event_id: &str, plate: &str) -> NewEntry {
        NewEntry {
            event_id: Some(EventId::new(event_id)),
            source_node_id: "A".to_string(),
            edge_id: "edge-1".to_string(),
            plate_id: plate.to_string(),
            plate_view: plate.to_string(),
            entry_time: "2025-12-02 10:30:00".to_string(),
            sync_status: SyncStatus::Synced,
        }
    }

    fn exit() -> ExitUpdate {
        ExitUpdate {
            exit_time: "2025-12-02 11:30:00".to_string(),
            exit_node_id: Some("B".to_string()),
            exit_edge: Some("edge-9".to_string()),
            fee: 10000,
            duration: "1h".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = MemoryEventStore::new();
        let id = EventId::new("A_1000_51F12345");
        store.insert_entry(entry("A_1000_51F12345", "51F12345")).await.unwrap();

        assert!(store.event_exists(&id).await.unwrap());
        let open = store.find_open_session("51F12345").await.unwrap().unwrap();
        assert_eq!(open.event_id, Some(id));
        assert!(store.find_open_session("OTHER").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryEventStore::new();
        store.insert_entry(entry("A_1000_51F12345", "51F12345")).await.unwrap();
        let err = store
            .insert_entry(entry("A_1000_51F12345", "51F12345"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEvent(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_exit() {
        let store = MemoryEventStore::new();
        let id = EventId::new("A_1000_51F12345");
        store.insert_entry(entry("A_1000_51F12345", "51F12345")).await.unwrap();

        assert!(store.update_exit(&id, &exit()).await.unwrap());
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Out);
        assert_eq!(session.fee, Some(10000));
        assert!(store.find_open_session("51F12345").await.unwrap().is_none());

        let missing = EventId::new("A_9_NOPE");
        assert!(!store.update_exit(&missing, &exit()).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_open_session() {
        let store = MemoryEventStore::new();
        let newer = EventId::new("B_1005_51F12345");
        let older = EventId::new("A_1000_51F12345");
        store.insert_entry(entry("B_1005_51F12345", "51F12345")).await.unwrap();

        store
            .replace_open_session(&newer, entry("A_1000_51F12345", "51F12345"))
            .await
            .unwrap();

        assert!(!store.event_exists(&newer).await.unwrap());
        assert!(store.event_exists(&older).await.unwrap());
        assert_eq!(store.open_sessions("51F12345").len(), 1);
    }

    #[tokio::test]
    async fn test_query_since_orders_and_limits() {
        let sessions = (0..10).map(|i| {
            let mut s = VehicleSession::open(entry(&format!("A_{i}_P{i}"), &format!("P{i}")), 0);
            s.updated_at_ms = 100 + (9 - i) as i64;
            s
        });
        let store = MemoryEventStore::with_sessions(sessions).unwrap();

        let rows = store.query_since(103, 3).await.unwrap();
        let stamps: Vec<_> = rows.iter().map(|s| s.updated_at_ms).collect();
        assert_eq!(stamps, vec![103, 104, 105]);

        assert_eq!(store.query_since(0, 100).await.unwrap().len(), 10);
        assert!(store.query_since(200, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watermarks() {
        let store = MemoryEventStore::new();
        assert_eq!(store.get_peer_watermark("B").await.unwrap(), None);
        store.set_peer_watermark("B", 42).await.unwrap();
        store.set_peer_watermark("B", 43).await.unwrap();
        assert_eq!(store.get_peer_watermark("B").await.unwrap(), Some(43));
    }
}
