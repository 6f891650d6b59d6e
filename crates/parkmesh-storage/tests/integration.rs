//! Integration tests for the redb event store
//!
//! Exercises the ledger through the `EventStore` trait the sync engine uses.

use tempfile::TempDir;

use parkmesh_core::{
    EventId, EventStore, ExitUpdate, NewEntry, SessionStatus, StoreError, SyncStatus,
};
use parkmesh_storage::{RedbEventStore, RedbStorageConfig};

fn create_test_store() -> (RedbEventStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = RedbEventStore::open(RedbStorageConfig::in_dir(temp_dir.path())).unwrap();
    (store, temp_dir)
}

fn entry(event_id: &str, plate: &str) -> NewEntry {
    NewEntry {
        event_id: Some(EventId::new(event_id)),
        source_node_id: event_id.split('_').next().unwrap().to_string(),
        edge_id: "edge-1".to_string(),
        plate_id: plate.to_string(),
        plate_view: plate.to_string(),
        entry_time: "2025-12-02 10:30:00".to_string(),
        sync_status: SyncStatus::Synced,
    }
}

fn exit(fee: i64) -> ExitUpdate {
    ExitUpdate {
        exit_time: "2025-12-02 11:30:00".to_string(),
        exit_node_id: Some("B".to_string()),
        exit_edge: Some("edge-9".to_string()),
        fee,
        duration: "1h 0m".to_string(),
    }
}

#[tokio::test]
async fn test_entry_lifecycle() {
    let (store, _temp) = create_test_store();
    let id = EventId::new("A_1000_51F12345");

    store.insert_entry(entry("A_1000_51F12345", "51F12345")).await.unwrap();
    assert!(store.event_exists(&id).await.unwrap());
    assert!(store.find_open_session("51F12345").await.unwrap().is_some());

    assert!(store.update_exit(&id, &exit(25000)).await.unwrap());
    let session = store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Out);
    assert_eq!(session.fee, Some(25000));
    assert_eq!(session.exit_node_id.as_deref(), Some("B"));
    assert!(store.find_open_session("51F12345").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_event_rejected() {
    let (store, _temp) = create_test_store();
    store.insert_entry(entry("A_1000_51F12345", "51F12345")).await.unwrap();

    let err = store
        .insert_entry(entry("A_1000_51F12345", "51F12345"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateEvent(_)));
    assert_eq!(store.len().unwrap(), 1);
}

#[tokio::test]
async fn test_open_lookup_does_not_match_longer_plate() {
    let (store, _temp) = create_test_store();
    store.insert_entry(entry("A_1000_51F123456", "51F123456")).await.unwrap();

    assert!(store.find_open_session("51F12345").await.unwrap().is_none());
    assert!(store.find_open_session("51F123456").await.unwrap().is_some());
}

#[tokio::test]
async fn test_replace_open_session_is_atomic() {
    let (store, _temp) = create_test_store();
    let newer = EventId::new("B_1005_51F12345");
    let older = EventId::new("A_1000_51F12345");
    store.insert_entry(entry("B_1005_51F12345", "51F12345")).await.unwrap();

    store
        .replace_open_session(&newer, entry("A_1000_51F12345", "51F12345"))
        .await
        .unwrap();

    assert!(!store.event_exists(&newer).await.unwrap());
    let open = store.find_open_session("51F12345").await.unwrap().unwrap();
    assert_eq!(open.event_id, Some(older.clone()));

    // A failing replace must leave the existing row in place
    store.insert_entry(entry("C_2000_X9", "X9")).await.unwrap();
    let err = store
        .replace_open_session(&older, entry("C_2000_X9", "51F12345"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateEvent(_)));
    assert!(store.event_exists(&older).await.unwrap());
    assert!(store.find_open_session("51F12345").await.unwrap().is_some());
    assert_eq!(store.len().unwrap(), 2);
}

#[tokio::test]
async fn test_delete_by_event_id() {
    let (store, _temp) = create_test_store();
    let id = EventId::new("A_1000_51F12345");
    store.insert_entry(entry("A_1000_51F12345", "51F12345")).await.unwrap();

    assert!(store.delete_by_event_id(&id).await.unwrap());
    assert!(!store.delete_by_event_id(&id).await.unwrap());
    assert!(store.is_empty().unwrap());
    assert!(store.query_since(0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_query_since_includes_later_exits() {
    let (store, _temp) = create_test_store();
    let first = EventId::new("A_1000_P1");
    store.insert_entry(entry("A_1000_P1", "P1")).await.unwrap();
    store.insert_entry(entry("A_1001_P2", "P2")).await.unwrap();

    let all = store.query_since(0, 100).await.unwrap();
    assert_eq!(all.len(), 2);
    let watermark = all.iter().map(|s| s.updated_at_ms).max().unwrap() + 1;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.update_exit(&first, &exit(100)).await.unwrap();

    let changed = store.query_since(watermark, 100).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].event_id, Some(first));
    assert_eq!(changed[0].status, SessionStatus::Out);

    // Ascending order, capped by limit
    let capped = store.query_since(0, 1).await.unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].plate_id, "P2");
}

#[tokio::test]
async fn test_watermarks_persist_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = RedbStorageConfig::in_dir(temp_dir.path());
    {
        let store = RedbEventStore::open(config.clone()).unwrap();
        assert_eq!(store.get_peer_watermark("central-2").await.unwrap(), None);
        store.set_peer_watermark("central-2", 1_733_140_800_000).await.unwrap();
        store.insert_entry(entry("A_1000_51F12345", "51F12345")).await.unwrap();
    }

    let store = RedbEventStore::open(config).unwrap();
    assert_eq!(
        store.get_peer_watermark("central-2").await.unwrap(),
        Some(1_733_140_800_000)
    );
    assert!(store.event_exists(&EventId::new("A_1000_51F12345")).await.unwrap());
}
