//! Durable [`EventStore`] on redb
//!
//! Every mutation runs in a single write transaction that keeps the event,
//! open and updated-at indexes consistent with the session row.

use std::sync::Arc;

use async_trait::async_trait;
use redb::{ReadableTable, ReadableTableMetadata, WriteTransaction};
use tracing::{debug, instrument};

use parkmesh_core::{
    now_ms, EventId, EventStore, ExitUpdate, NewEntry, StoreResult, VehicleSession,
};

use crate::error::StorageError;
use crate::records::{PeerSyncRecord, SessionRecord};
use crate::tables::{
    next_row_id, open_key, open_prefix, updated_key, updated_lower_bound, RedbStorage,
    RedbStorageConfig, EVENT_INDEX, OPEN_INDEX, PEER_SYNC_STATE, SESSIONS, UPDATED_INDEX,
};

/// Session ledger persisted in redb
pub struct RedbEventStore {
    storage: Arc<RedbStorage>,
}

impl RedbEventStore {
    /// Open or create the ledger at the configured path
    pub fn open(config: RedbStorageConfig) -> Result<Self, StorageError> {
        Ok(Self {
            storage: Arc::new(RedbStorage::open(config)?),
        })
    }

    pub fn new(storage: Arc<RedbStorage>) -> Self {
        Self { storage }
    }

    /// Number of session rows
    pub fn len(&self) -> Result<u64, StorageError> {
        let read = self.storage.db().begin_read().map_err(StorageError::database)?;
        let sessions = read.open_table(SESSIONS).map_err(StorageError::database)?;
        sessions.len().map_err(StorageError::database)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    fn lookup_row(&self, event_id: &EventId) -> Result<Option<(u64, SessionRecord)>, StorageError> {
        let read = self.storage.db().begin_read().map_err(StorageError::database)?;
        let events = read.open_table(EVENT_INDEX).map_err(StorageError::database)?;
        let Some(row_id) = events
            .get(event_id.as_str())
            .map_err(StorageError::database)?
            .map(|v| v.value())
        else {
            return Ok(None);
        };

        let sessions = read.open_table(SESSIONS).map_err(StorageError::database)?;
        let bytes = sessions
            .get(row_id)
            .map_err(StorageError::database)?
            .ok_or_else(|| StorageError::CorruptIndex(format!("event {} -> row {}", event_id, row_id)))?;
        Ok(Some((row_id, SessionRecord::from_bytes(bytes.value())?)))
    }

    fn first_open(&self, plate_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        let read = self.storage.db().begin_read().map_err(StorageError::database)?;
        let open = read.open_table(OPEN_INDEX).map_err(StorageError::database)?;
        let prefix = open_prefix(plate_id);

        let mut range = open
            .range(prefix.as_slice()..)
            .map_err(StorageError::database)?;
        let Some(entry) = range.next() else {
            return Ok(None);
        };
        let (key, row_id) = entry.map_err(StorageError::database)?;
        if !key.value().starts_with(&prefix) {
            return Ok(None);
        }
        let row_id = row_id.value();

        let sessions = read.open_table(SESSIONS).map_err(StorageError::database)?;
        let bytes = sessions
            .get(row_id)
            .map_err(StorageError::database)?
            .ok_or_else(|| StorageError::CorruptIndex(format!("plate {} -> row {}", plate_id, row_id)))?;
        Ok(Some(SessionRecord::from_bytes(bytes.value())?))
    }

    fn insert(&self, entry: NewEntry) -> Result<u64, StorageError> {
        let txn = self.storage.db().begin_write().map_err(StorageError::database)?;
        let row_id = insert_in(&txn, entry)?;
        txn.commit().map_err(StorageError::database)?;
        Ok(row_id)
    }

    fn close(&self, event_id: &EventId, exit: &ExitUpdate) -> Result<bool, StorageError> {
        let txn = self.storage.db().begin_write().map_err(StorageError::database)?;
        let Some((row_id, previous)) = load_in(&txn, event_id)? else {
            return Ok(false);
        };

        let mut session = VehicleSession::from(previous.clone());
        session.close(exit, now_ms());
        write_row(&txn, row_id, Some(&previous), &SessionRecord::from(session))?;

        txn.commit().map_err(StorageError::database)?;
        Ok(true)
    }

    fn delete(&self, event_id: &EventId) -> Result<bool, StorageError> {
        let txn = self.storage.db().begin_write().map_err(StorageError::database)?;
        let removed = delete_in(&txn, event_id)?;
        txn.commit().map_err(StorageError::database)?;
        Ok(removed)
    }

    fn replace(&self, existing: &EventId, incoming: NewEntry) -> Result<u64, StorageError> {
        let txn = self.storage.db().begin_write().map_err(StorageError::database)?;
        delete_in(&txn, existing)?;
        let row_id = insert_in(&txn, incoming)?;
        txn.commit().map_err(StorageError::database)?;
        Ok(row_id)
    }

    fn since(&self, since_ms: i64, limit: usize) -> Result<Vec<VehicleSession>, StorageError> {
        let read = self.storage.db().begin_read().map_err(StorageError::database)?;
        let updated = read.open_table(UPDATED_INDEX).map_err(StorageError::database)?;
        let sessions = read.open_table(SESSIONS).map_err(StorageError::database)?;

        let lower = updated_lower_bound(since_ms);
        let mut out = Vec::new();
        for entry in updated
            .range(lower.as_slice()..)
            .map_err(StorageError::database)?
            .take(limit)
        {
            let (_, row_id) = entry.map_err(StorageError::database)?;
            let row_id = row_id.value();
            let bytes = sessions
                .get(row_id)
                .map_err(StorageError::database)?
                .ok_or_else(|| StorageError::CorruptIndex(format!("updated -> row {}", row_id)))?;
            out.push(SessionRecord::from_bytes(bytes.value())?.into());
        }
        Ok(out)
    }

    fn watermark(&self, peer_node_id: &str) -> Result<Option<i64>, StorageError> {
        let read = self.storage.db().begin_read().map_err(StorageError::database)?;
        let table = read.open_table(PEER_SYNC_STATE).map_err(StorageError::database)?;
        match table.get(peer_node_id).map_err(StorageError::database)? {
            Some(bytes) => {
                let record: PeerSyncRecord = postcard::from_bytes(bytes.value())?;
                Ok(Some(record.last_sync_timestamp))
            }
            None => Ok(None),
        }
    }

    fn put_watermark(&self, peer_node_id: &str, timestamp_ms: i64) -> Result<(), StorageError> {
        let record = PeerSyncRecord::new(peer_node_id, timestamp_ms);
        let value = postcard::to_allocvec(&record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let txn = self.storage.db().begin_write().map_err(StorageError::database)?;
        {
            let mut table = txn.open_table(PEER_SYNC_STATE).map_err(StorageError::database)?;
            table
                .insert(peer_node_id, value.as_slice())
                .map_err(StorageError::database)?;
        }
        txn.commit().map_err(StorageError::database)?;

        debug!(peer = %peer_node_id, watermark = timestamp_ms, "Stored peer watermark");
        Ok(())
    }
}

fn load_in(
    txn: &WriteTransaction,
    event_id: &EventId,
) -> Result<Option<(u64, SessionRecord)>, StorageError> {
    let events = txn.open_table(EVENT_INDEX).map_err(StorageError::database)?;
    let Some(row_id) = events
        .get(event_id.as_str())
        .map_err(StorageError::database)?
        .map(|v| v.value())
    else {
        return Ok(None);
    };

    let sessions = txn.open_table(SESSIONS).map_err(StorageError::database)?;
    let bytes = sessions
        .get(row_id)
        .map_err(StorageError::database)?
        .ok_or_else(|| StorageError::CorruptIndex(format!("event {} -> row {}", event_id, row_id)))?;
    Ok(Some((row_id, SessionRecord::from_bytes(bytes.value())?)))
}

fn insert_in(txn: &WriteTransaction, entry: NewEntry) -> Result<u64, StorageError> {
    if let Some(event_id) = &entry.event_id {
        let events = txn.open_table(EVENT_INDEX).map_err(StorageError::database)?;
        if events
            .get(event_id.as_str())
            .map_err(StorageError::database)?
            .is_some()
        {
            return Err(StorageError::DuplicateEvent(event_id.to_string()));
        }
    }

    let row_id = next_row_id(txn)?;
    let record = SessionRecord::from(VehicleSession::open(entry, now_ms()));
    write_row(txn, row_id, None, &record)?;

    if let Some(event_id) = &record.event_id {
        let mut events = txn.open_table(EVENT_INDEX).map_err(StorageError::database)?;
        events
            .insert(event_id.as_str(), row_id)
            .map_err(StorageError::database)?;
    }
    Ok(row_id)
}

/// Write a row and move its secondary index entries from `previous`
fn write_row(
    txn: &WriteTransaction,
    row_id: u64,
    previous: Option<&SessionRecord>,
    record: &SessionRecord,
) -> Result<(), StorageError> {
    let bytes = record.to_bytes()?;
    let mut sessions = txn.open_table(SESSIONS).map_err(StorageError::database)?;
    let mut open = txn.open_table(OPEN_INDEX).map_err(StorageError::database)?;
    let mut updated = txn.open_table(UPDATED_INDEX).map_err(StorageError::database)?;

    if let Some(prev) = previous {
        updated
            .remove(updated_key(prev.updated_at_ms, row_id).as_slice())
            .map_err(StorageError::database)?;
        open.remove(open_key(&prev.plate_id, row_id).as_slice())
            .map_err(StorageError::database)?;
    }

    sessions
        .insert(row_id, bytes.as_slice())
        .map_err(StorageError::database)?;
    updated
        .insert(updated_key(record.updated_at_ms, row_id).as_slice(), row_id)
        .map_err(StorageError::database)?;
    if record.status == parkmesh_core::SessionStatus::In {
        open.insert(open_key(&record.plate_id, row_id).as_slice(), row_id)
            .map_err(StorageError::database)?;
    }
    Ok(())
}

fn delete_in(txn: &WriteTransaction, event_id: &EventId) -> Result<bool, StorageError> {
    let Some((row_id, previous)) = load_in(txn, event_id)? else {
        return Ok(false);
    };

    let mut sessions = txn.open_table(SESSIONS).map_err(StorageError::database)?;
    let mut open = txn.open_table(OPEN_INDEX).map_err(StorageError::database)?;
    let mut updated = txn.open_table(UPDATED_INDEX).map_err(StorageError::database)?;
    let mut events = txn.open_table(EVENT_INDEX).map_err(StorageError::database)?;

    sessions.remove(row_id).map_err(StorageError::database)?;
    updated
        .remove(updated_key(previous.updated_at_ms, row_id).as_slice())
        .map_err(StorageError::database)?;
    open.remove(open_key(&previous.plate_id, row_id).as_slice())
        .map_err(StorageError::database)?;
    events
        .remove(event_id.as_str())
        .map_err(StorageError::database)?;
    Ok(true)
}

#[async_trait]
impl EventStore for RedbEventStore {
    async fn event_exists(&self, event_id: &EventId) -> StoreResult<bool> {
        let read = self.storage.db().begin_read().map_err(StorageError::database)?;
        let events = read.open_table(EVENT_INDEX).map_err(StorageError::database)?;
        Ok(events
            .get(event_id.as_str())
            .map_err(StorageError::database)?
            .is_some())
    }

    async fn find_open_session(&self, plate_id: &str) -> StoreResult<Option<VehicleSession>> {
        Ok(self.first_open(plate_id)?.map(Into::into))
    }

    async fn get_session(&self, event_id: &EventId) -> StoreResult<Option<VehicleSession>> {
        Ok(self.lookup_row(event_id)?.map(|(_, r)| r.into()))
    }

    #[instrument(skip(self, entry), fields(plate = %entry.plate_id))]
    async fn insert_entry(&self, entry: NewEntry) -> StoreResult<u64> {
        Ok(self.insert(entry)?)
    }

    async fn update_exit(&self, event_id: &EventId, exit: &ExitUpdate) -> StoreResult<bool> {
        Ok(self.close(event_id, exit)?)
    }

    async fn delete_by_event_id(&self, event_id: &EventId) -> StoreResult<bool> {
        Ok(self.delete(event_id)?)
    }

    async fn query_since(&self, since_ms: i64, limit: usize) -> StoreResult<Vec<VehicleSession>> {
        Ok(self.since(since_ms, limit)?)
    }

    async fn get_peer_watermark(&self, peer_node_id: &str) -> StoreResult<Option<i64>> {
        Ok(self.watermark(peer_node_id)?)
    }

    async fn set_peer_watermark(&self, peer_node_id: &str, timestamp_ms: i64) -> StoreResult<()> {
        Ok(self.put_watermark(peer_node_id, timestamp_ms)?)
    }

    async fn replace_open_session(
        &self,
        existing: &EventId,
        incoming: NewEntry,
    ) -> StoreResult<u64> {
        Ok(self.replace(existing, incoming)?)
    }
}
