//! Vehicle session records
//!
//! One [`VehicleSession`] per vehicle stay. It is created on entry, closed on
//! exit, and only deleted when the conflict rule supersedes it.

use serde::{Deserialize, Serialize};

use crate::event_id::{EventId, normalize_plate};

/// Occupancy state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    /// Vehicle is currently parked
    #[default]
    In,
    /// Vehicle has left
    Out,
}

/// Where a session originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    /// Created at this node
    #[default]
    Local,
    /// Received from a peer
    Synced,
}

fn unknown_edge() -> String {
    "unknown".to_string()
}

/// A vehicle stay as exchanged in `SYNC_RESPONSE` batches
///
/// Absent optional fields are omitted on the wire rather than sent as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleSession {
    /// Missing on rows that predate synchronization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, alias = "source_central")]
    pub source_node_id: String,
    #[serde(default = "unknown_edge")]
    pub edge_id: String,
    #[serde(default)]
    pub plate_id: String,
    #[serde(default)]
    pub plate_view: String,
    #[serde(default)]
    pub entry_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<String>,
    #[serde(default, alias = "exit_central", skip_serializing_if = "Option::is_none")]
    pub exit_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_edge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Last mutation time at the owning store, Unix millis
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl VehicleSession {
    /// Build an open session from an entry
    pub fn open(entry: NewEntry, updated_at_ms: i64) -> Self {
        Self {
            event_id: entry.event_id,
            source_node_id: entry.source_node_id,
            edge_id: entry.edge_id,
            plate_id: entry.plate_id,
            plate_view: entry.plate_view,
            entry_time: entry.entry_time,
            exit_time: None,
            exit_node_id: None,
            exit_edge: None,
            fee: None,
            duration: None,
            status: SessionStatus::In,
            sync_status: entry.sync_status,
            updated_at_ms,
        }
    }

    /// Apply exit details and mark the session OUT
    pub fn close(&mut self, exit: &ExitUpdate, updated_at_ms: i64) {
        self.exit_time = Some(exit.exit_time.clone());
        self.exit_node_id = exit.exit_node_id.clone();
        self.exit_edge = exit.exit_edge.clone();
        self.fee = Some(exit.fee);
        self.duration = Some(exit.duration.clone());
        self.status = SessionStatus::Out;
        self.updated_at_ms = updated_at_ms;
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::In
    }

    /// Entry half of this record, re-sourced with the given sync status.
    /// The plate is normalized so legacy peers sending raw plates still match.
    pub fn to_new_entry(&self, sync_status: SyncStatus) -> NewEntry {
        let plate_view = if self.plate_view.is_empty() {
            self.plate_id.clone()
        } else {
            self.plate_view.clone()
        };
        NewEntry {
            event_id: self.event_id.clone(),
            source_node_id: self.source_node_id.clone(),
            edge_id: self.edge_id.clone(),
            plate_id: normalize_plate(&self.plate_id),
            plate_view,
            entry_time: self.entry_time.clone(),
            sync_status,
        }
    }

    /// Exit half of this record, if the stay is complete
    pub fn exit_update(&self) -> Option<ExitUpdate> {
        if self.status != SessionStatus::Out {
            return None;
        }
        let exit_time = self.exit_time.clone()?;
        Some(ExitUpdate {
            exit_time,
            exit_node_id: self.exit_node_id.clone(),
            exit_edge: self.exit_edge.clone(),
            fee: self.fee.unwrap_or(0),
            duration: self.duration.clone().unwrap_or_default(),
        })
    }
}

/// Fields required to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub event_id: Option<EventId>,
    pub source_node_id: String,
    pub edge_id: String,
    pub plate_id: String,
    pub plate_view: String,
    pub entry_time: String,
    pub sync_status: SyncStatus,
}

/// Fields written when a session is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitUpdate {
    pub exit_time: String,
    pub exit_node_id: Option<String>,
    pub exit_edge: Option<String>,
    pub fee: i64,
    pub duration: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> NewEntry {
        NewEntry {
            event_id: Some(EventId::new("central-1_1000_29A12345")),
            source_node_id: "central-1".to_string(),
            edge_id: "edge-1".to_string(),
            plate_id: "29A12345".to_string(),
            plate_view: "29A-123.45".to_string(),
            entry_time: "2025-12-02 10:30:00".to_string(),
            sync_status: SyncStatus::Local,
        }
    }

    #[test]
    fn test_open_session_omits_nulls() {
        let session = VehicleSession::open(sample_entry(), 42);
        let json = serde_json::to_value(&session).unwrap();
        let obj = json.as_object().unwrap();

        assert_eq!(obj["status"], "IN");
        assert_eq!(obj["sync_status"], "LOCAL");
        for absent in ["exit_time", "exit_node_id", "exit_edge", "fee", "duration"] {
            assert!(!obj.contains_key(absent), "{absent} should be omitted");
        }
    }

    #[test]
    fn test_close_session() {
        let mut session = VehicleSession::open(sample_entry(), 1);
        let exit = ExitUpdate {
            exit_time: "2025-12-02 11:30:00".to_string(),
            exit_node_id: Some("central-5".to_string()),
            exit_edge: Some("edge-20".to_string()),
            fee: 25000,
            duration: "1h 0m".to_string(),
        };
        session.close(&exit, 2);

        assert!(!session.is_open());
        assert_eq!(session.updated_at_ms, 2);
        assert_eq!(session.exit_update(), Some(exit));
    }

    #[test]
    fn test_new_entry_from_record_normalizes_plate() {
        let mut entry = sample_entry();
        entry.plate_id = "29a 123.45".to_string();
        let session = VehicleSession::open(entry, 1);

        let again = session.to_new_entry(SyncStatus::Synced);
        assert_eq!(again.plate_id, "29A12345");
        assert_eq!(again.plate_view, "29A-123.45");
        assert_eq!(again.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_decode_legacy_record() {
        let json = r#"{
            "source_central": "central-2",
            "plate_id": "51F12345",
            "entry_time": "2025-12-02 09:00:00",
            "exit_central": "central-3",
            "status": "OUT",
            "exit_time": "2025-12-02 10:00:00"
        }"#;
        let session: VehicleSession = serde_json::from_str(json).unwrap();

        assert_eq!(session.event_id, None);
        assert_eq!(session.source_node_id, "central-2");
        assert_eq!(session.edge_id, "unknown");
        assert_eq!(session.exit_node_id.as_deref(), Some("central-3"));
        assert_eq!(session.status, SessionStatus::Out);
        assert_eq!(session.sync_status, SyncStatus::Local);

        let entry = session.to_new_entry(SyncStatus::Synced);
        assert_eq!(entry.plate_view, "51F12345");
        assert_eq!(session.exit_update().unwrap().fee, 0);
    }

    #[test]
    fn test_exit_update_requires_out_and_time() {
        let mut session = VehicleSession::open(sample_entry(), 1);
        assert!(session.exit_update().is_none());

        session.status = SessionStatus::Out;
        assert!(session.exit_update().is_none());
    }
}
