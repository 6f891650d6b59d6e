//! redb table definitions and storage manager
//!
//! Defines all tables used by the session ledger.

use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, info, instrument};

use crate::error::StorageError;

// Key: row id, Value: postcard SessionRecord
pub const SESSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("sessions");

// Key: event_id, Value: row id
pub const EVENT_INDEX: TableDefinition<&str, u64> = TableDefinition::new("event_index");

// Key: plate_id ‖ 0x00 ‖ row id (be), Value: row id. Only sessions with status IN.
pub const OPEN_INDEX: TableDefinition<&[u8], u64> = TableDefinition::new("open_index");

// Key: sortable updated_at_ms (be) ‖ row id (be), Value: row id
pub const UPDATED_INDEX: TableDefinition<&[u8], u64> = TableDefinition::new("updated_index");

// Key: peer node id, Value: postcard PeerSyncRecord
pub const PEER_SYNC_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("peer_sync_state");

// Key: counter name, Value: counter
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ROW_ID: &str = "next_row_id";

/// Configuration for redb storage
#[derive(Debug, Clone)]
pub struct RedbStorageConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for RedbStorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/parkmesh.redb"),
            cache_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl RedbStorageConfig {
    /// Config for a database file inside `data_dir`
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: data_dir.into().join("parkmesh.redb"),
            ..Default::default()
        }
    }
}

/// Main redb storage manager
pub struct RedbStorage {
    db: Arc<Database>,
    config: RedbStorageConfig,
}

impl RedbStorage {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStorageConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::builder()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        info!("Opened redb database");

        let storage = Self {
            db: Arc::new(db),
            config,
        };

        storage.init_tables()?;

        Ok(storage)
    }

    /// Initialize all tables
    fn init_tables(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write().map_err(StorageError::database)?;

        write_txn.open_table(SESSIONS).map_err(StorageError::database)?;
        write_txn.open_table(EVENT_INDEX).map_err(StorageError::database)?;
        write_txn.open_table(OPEN_INDEX).map_err(StorageError::database)?;
        write_txn.open_table(UPDATED_INDEX).map_err(StorageError::database)?;
        write_txn.open_table(PEER_SYNC_STATE).map_err(StorageError::database)?;
        write_txn.open_table(META).map_err(StorageError::database)?;

        write_txn.commit().map_err(StorageError::database)?;

        debug!("Initialized redb tables");
        Ok(())
    }

    /// Get a reference to the database
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Get the configuration
    pub fn config(&self) -> &RedbStorageConfig {
        &self.config
    }
}

/// Allocate the next row id inside an open write transaction
pub(crate) fn next_row_id(txn: &WriteTransaction) -> Result<u64, StorageError> {
    let mut meta = txn.open_table(META).map_err(StorageError::database)?;
    let next = meta
        .get(NEXT_ROW_ID)
        .map_err(StorageError::database)?
        .map(|v| v.value())
        .unwrap_or(0)
        + 1;
    meta.insert(NEXT_ROW_ID, next).map_err(StorageError::database)?;
    Ok(next)
}

/// Map an i64 onto u64 preserving order, so big-endian keys sort numerically
fn sortable_millis(ms: i64) -> u64 {
    (ms as u64) ^ (1 << 63)
}

/// Key for the updated-at index
pub(crate) fn updated_key(updated_at_ms: i64, row_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&sortable_millis(updated_at_ms).to_be_bytes());
    key[8..].copy_from_slice(&row_id.to_be_bytes());
    key
}

/// Lower bound of the updated-at index for `since_ms`
pub(crate) fn updated_lower_bound(since_ms: i64) -> [u8; 16] {
    updated_key(since_ms, 0)
}

/// Prefix shared by every open-index key for a plate
pub(crate) fn open_prefix(plate_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(plate_id.len() + 9);
    key.extend_from_slice(plate_id.as_bytes());
    key.push(0);
    key
}

/// Key for the open-session index
pub(crate) fn open_key(plate_id: &str, row_id: u64) -> Vec<u8> {
    let mut key = open_prefix(plate_id);
    key.extend_from_slice(&row_id.to_be_bytes());
    key
}
