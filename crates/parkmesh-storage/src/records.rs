//! Persisted row formats
//!
//! Rows are postcard encoded, so every field is always written; the wire
//! form in [`VehicleSession`] omits absent fields instead.

use serde::{Deserialize, Serialize};

use parkmesh_core::{EventId, SessionStatus, SyncStatus, VehicleSession};

use crate::error::StorageError;

/// One vehicle stay as stored in the `sessions` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub event_id: Option<EventId>,
    pub source_node_id: String,
    pub edge_id: String,
    pub plate_id: String,
    pub plate_view: String,
    pub entry_time: String,
    pub exit_time: Option<String>,
    pub exit_node_id: Option<String>,
    pub exit_edge: Option<String>,
    pub fee: Option<i64>,
    pub duration: Option<String>,
    pub status: SessionStatus,
    pub sync_status: SyncStatus,
    pub updated_at_ms: i64,
}

impl SessionRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        postcard::to_allocvec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

impl From<VehicleSession> for SessionRecord {
    fn from(s: VehicleSession) -> Self {
        Self {
            event_id: s.event_id,
            source_node_id: s.source_node_id,
            edge_id: s.edge_id,
            plate_id: s.plate_id,
            plate_view: s.plate_view,
            entry_time: s.entry_time,
            exit_time: s.exit_time,
            exit_node_id: s.exit_node_id,
            exit_edge: s.exit_edge,
            fee: s.fee,
            duration: s.duration,
            status: s.status,
            sync_status: s.sync_status,
            updated_at_ms: s.updated_at_ms,
        }
    }
}

impl From<SessionRecord> for VehicleSession {
    fn from(r: SessionRecord) -> Self {
        Self {
            event_id: r.event_id,
            source_node_id: r.source_node_id,
            edge_id: r.edge_id,
            plate_id: r.plate_id,
            plate_view: r.plate_view,
            entry_time: r.entry_time,
            exit_time: r.exit_time,
            exit_node_id: r.exit_node_id,
            exit_edge: r.exit_edge,
            fee: r.fee,
            duration: r.duration,
            status: r.status,
            sync_status: r.sync_status,
            updated_at_ms: r.updated_at_ms,
        }
    }
}

/// Backfill watermark for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSyncRecord {
    pub peer_node_id: String,
    /// Watermark of the most recent completed backfill (Unix millis)
    pub last_sync_timestamp: i64,
    /// When this row was last written (Unix millis)
    pub updated_at_ms: i64,
}

impl PeerSyncRecord {
    pub fn new(peer_node_id: impl Into<String>, last_sync_timestamp: i64) -> Self {
        Self {
            peer_node_id: peer_node_id.into(),
            last_sync_timestamp,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_absent_fields() {
        let session = VehicleSession {
            event_id: None,
            source_node_id: "A".to_string(),
            edge_id: "edge-1".to_string(),
            plate_id: "51F12345".to_string(),
            plate_view: "51F-123.45".to_string(),
            entry_time: "t0".to_string(),
            exit_time: None,
            exit_node_id: None,
            exit_edge: None,
            fee: Some(0),
            duration: None,
            status: SessionStatus::In,
            sync_status: SyncStatus::Local,
            updated_at_ms: 17,
        };
        let record = SessionRecord::from(session.clone());
        let decoded = SessionRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(VehicleSession::from(decoded), session);
    }

    #[test]
    fn test_corrupt_bytes() {
        assert!(matches!(
            SessionRecord::from_bytes(&[0xff, 0xff, 0xff]),
            Err(StorageError::Deserialization(_))
        ));
    }
}
