//! Locally originated events
//!
//! The application reports vehicles seen at this node through
//! [`LocalEvents`]. Each call commits to the store first and broadcasts
//! second, so the local ledger is correct whatever the state of the mesh.

use std::sync::Arc;

use tracing::{info, instrument};

use parkmesh_core::{
    EntryPayload, Envelope, EventId, EventStore, ExitPayload, SyncStatus, normalize_plate, now_ms,
};

use crate::error::{NodeError, NodeResult};
use crate::mesh::Mesh;
use crate::reconciler::Reconciler;

/// Exit details supplied by the application; the exit node is this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDetails {
    pub exit_edge: String,
    pub exit_time: String,
    pub fee: i64,
    pub duration: String,
}

/// Entry point for events observed at this node
#[derive(Clone)]
pub struct LocalEvents {
    node_id: String,
    store: Arc<dyn EventStore>,
    reconciler: Arc<Reconciler>,
    mesh: Arc<Mesh>,
}

impl LocalEvents {
    pub(crate) fn new(
        node_id: impl Into<String>,
        store: Arc<dyn EventStore>,
        reconciler: Arc<Reconciler>,
        mesh: Arc<Mesh>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            reconciler,
            mesh,
        }
    }

    /// Record a vehicle entering and announce it to the mesh
    ///
    /// The plate is normalized before it is stored. Fails with
    /// [`NodeError::AlreadyParked`] if the plate already has an open session.
    #[instrument(skip(self, payload), fields(plate = %payload.plate_id))]
    pub async fn record_entry(&self, mut payload: EntryPayload) -> NodeResult<EventId> {
        payload.plate_id = normalize_plate(&payload.plate_id);
        if payload.plate_view.is_empty() {
            payload.plate_view = payload.plate_id.clone();
        }

        let event_id = {
            let _plate = self.reconciler.lock_plate(&payload.plate_id).await;
            if let Some(open) = self.store.find_open_session(&payload.plate_id).await? {
                return Err(NodeError::AlreadyParked {
                    plate_id: payload.plate_id,
                    event_id: open.event_id.map(|id| id.to_string()).unwrap_or_default(),
                });
            }
            let event_id = EventId::generate(&self.node_id, &payload.plate_id, now_ms());
            self.store
                .insert_entry(payload.to_new_entry(&event_id, &self.node_id, SyncStatus::Local))
                .await?;
            event_id
        };

        let sent = self
            .mesh
            .broadcast(&Envelope::entry_pending(&self.node_id, event_id.clone(), payload));
        info!(event_id = %event_id, sent, "Local entry recorded");
        Ok(event_id)
    }

    /// Announce that an entry's barrier closed
    #[instrument(skip(self, confirmed_time), fields(event_id = %event_id))]
    pub async fn confirm_entry(&self, event_id: &EventId, confirmed_time: impl Into<String>) -> NodeResult<()> {
        if !self.store.event_exists(event_id).await? {
            return Err(NodeError::UnknownSession(event_id.to_string()));
        }
        let sent = self.mesh.broadcast(&Envelope::entry_confirmed(
            &self.node_id,
            event_id.clone(),
            confirmed_time,
        ));
        info!(sent, "Local entry confirmed");
        Ok(())
    }

    /// Close a session and announce the exit
    #[instrument(skip(self, details), fields(event_id = %event_id))]
    pub async fn record_exit(&self, event_id: &EventId, details: ExitDetails) -> NodeResult<()> {
        let payload = ExitPayload {
            exit_node_id: self.node_id.clone(),
            exit_edge: details.exit_edge,
            exit_time: details.exit_time,
            fee: details.fee,
            duration: details.duration,
        };

        {
            let plate = event_id.plate().unwrap_or(event_id.as_str());
            let _plate = self.reconciler.lock_plate(plate).await;
            match self.store.get_session(event_id).await? {
                None => return Err(NodeError::UnknownSession(event_id.to_string())),
                Some(session) if !session.is_open() => {
                    return Err(NodeError::SessionClosed(event_id.to_string()));
                }
                Some(_) => {}
            }
            self.store.update_exit(event_id, &payload.to_exit_update()).await?;
        }

        let sent = self
            .mesh
            .broadcast(&Envelope::exit(&self.node_id, event_id.clone(), payload));
        info!(sent, "Local exit recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkmesh_core::{MemoryEventStore, SessionStatus};

    use crate::hooks::NoopHooks;

    fn local(store: Arc<MemoryEventStore>) -> LocalEvents {
        let reconciler = Arc::new(Reconciler::new(store.clone(), Arc::new(NoopHooks), false));
        LocalEvents::new("central-1", store, reconciler, Arc::new(Mesh::new()))
    }

    fn entry(plate: &str) -> EntryPayload {
        EntryPayload {
            plate_id: plate.to_string(),
            plate_view: String::new(),
            edge_id: "edge-1".to_string(),
            camera_type: "car".to_string(),
            direction: "ENTRY".to_string(),
            entry_time: "2025-12-02 10:30:00".to_string(),
        }
    }

    fn details() -> ExitDetails {
        ExitDetails {
            exit_edge: "edge-2".to_string(),
            exit_time: "2025-12-02 11:30:00".to_string(),
            fee: 25_000,
            duration: "1h 0m".to_string(),
        }
    }

    #[tokio::test]
    async fn test_entry_stored_locally_with_normalized_plate() {
        let store = Arc::new(MemoryEventStore::new());
        let events = local(store.clone());

        let id = events.record_entry(entry("29a-123.45")).await.unwrap();
        assert_eq!(id.node_id(), Some("central-1"));
        assert_eq!(id.plate(), Some("29A12345"));

        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.plate_id, "29A12345");
        assert_eq!(session.plate_view, "29A12345");
        assert_eq!(session.sync_status, SyncStatus::Local);
    }

    #[tokio::test]
    async fn test_second_entry_for_parked_plate_rejected() {
        let store = Arc::new(MemoryEventStore::new());
        let events = local(store.clone());

        events.record_entry(entry("29A12345")).await.unwrap();
        let err = events.record_entry(entry("29A-12345")).await.unwrap_err();
        assert!(matches!(err, NodeError::AlreadyParked { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_exit_closes_session_once() {
        let store = Arc::new(MemoryEventStore::new());
        let events = local(store.clone());

        let id = events.record_entry(entry("29A12345")).await.unwrap();
        events.confirm_entry(&id, "2025-12-02 10:30:05").await.unwrap();
        events.record_exit(&id, details()).await.unwrap();

        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Out);
        assert_eq!(session.exit_node_id.as_deref(), Some("central-1"));
        assert_eq!(session.fee, Some(25_000));

        assert!(matches!(
            events.record_exit(&id, details()).await,
            Err(NodeError::SessionClosed(_))
        ));
        // A new stay may begin once the previous one closed
        events.record_entry(entry("29A12345")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let events = local(Arc::new(MemoryEventStore::new()));
        let id = EventId::new("central-1_1_NOPE");
        assert!(matches!(
            events.record_exit(&id, details()).await,
            Err(NodeError::UnknownSession(_))
        ));
        assert!(matches!(
            events.confirm_entry(&id, "now").await,
            Err(NodeError::UnknownSession(_))
        ));
    }
}
