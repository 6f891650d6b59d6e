//! Wire protocol between central nodes
//!
//! Every frame carries one JSON [`Envelope`]:
//!
//! ```text
//! { "kind": "VEHICLE_ENTRY_PENDING", "source_node_id": "central-1",
//!   "event_id": "central-1_1733140800000_29A12345", "payload": { ... } }
//! ```
//!
//! Envelopes carry no sequence number. Ordering between competing entries
//! is reconstructed from the timestamp embedded in the event id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::event_id::{EventId, normalize_plate};
use crate::session::{ExitUpdate, NewEntry, SyncStatus, VehicleSession};

/// Largest frame accepted on a peer link. A full sync batch must fit.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of records in one `SYNC_RESPONSE`
pub const SYNC_BATCH_LIMIT: usize = 5000;

/// Discriminant of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    VehicleEntryPending,
    VehicleEntryConfirmed,
    VehicleExit,
    Heartbeat,
    SyncRequest,
    SyncResponse,
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::VehicleEntryPending => "VEHICLE_ENTRY_PENDING",
            MessageKind::VehicleEntryConfirmed => "VEHICLE_ENTRY_CONFIRMED",
            MessageKind::VehicleExit => "VEHICLE_EXIT",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::SyncRequest => "SYNC_REQUEST",
            MessageKind::SyncResponse => "SYNC_RESPONSE",
        }
    }

    /// Whether envelopes of this kind must carry an event id
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            MessageKind::VehicleEntryPending
                | MessageKind::VehicleEntryConfirmed
                | MessageKind::VehicleExit
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `VEHICLE_ENTRY_PENDING` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPayload {
    pub plate_id: String,
    #[serde(default)]
    pub plate_view: String,
    #[serde(default)]
    pub edge_id: String,
    #[serde(default)]
    pub camera_type: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub entry_time: String,
}

impl EntryPayload {
    /// Session fields for this entry, keyed by the normalized plate
    pub fn to_new_entry(
        &self,
        event_id: &EventId,
        source_node_id: &str,
        sync_status: SyncStatus,
    ) -> NewEntry {
        let plate_view = if self.plate_view.is_empty() {
            self.plate_id.clone()
        } else {
            self.plate_view.clone()
        };
        NewEntry {
            event_id: Some(event_id.clone()),
            source_node_id: source_node_id.to_string(),
            edge_id: self.edge_id.clone(),
            plate_id: normalize_plate(&self.plate_id),
            plate_view,
            entry_time: self.entry_time.clone(),
            sync_status,
        }
    }
}

/// `VEHICLE_ENTRY_CONFIRMED` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedPayload {
    #[serde(default)]
    pub confirmed_time: String,
}

/// `VEHICLE_EXIT` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPayload {
    #[serde(alias = "exit_central")]
    pub exit_node_id: String,
    #[serde(default)]
    pub exit_edge: String,
    pub exit_time: String,
    #[serde(default)]
    pub fee: i64,
    #[serde(default)]
    pub duration: String,
}

impl ExitPayload {
    pub fn to_exit_update(&self) -> ExitUpdate {
        ExitUpdate {
            exit_time: self.exit_time.clone(),
            exit_node_id: Some(self.exit_node_id.clone()),
            exit_edge: Some(self.exit_edge.clone()),
            fee: self.fee,
            duration: self.duration.clone(),
        }
    }
}

/// `HEARTBEAT` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Sender wall clock, Unix millis
    pub timestamp: i64,
}

/// `SYNC_REQUEST` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    #[serde(default)]
    pub since_timestamp: i64,
}

/// `SYNC_RESPONSE` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    #[serde(default)]
    pub events: Vec<VehicleSession>,
}

/// Typed body of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    EntryPending(EntryPayload),
    EntryConfirmed(ConfirmedPayload),
    Exit(ExitPayload),
    Heartbeat(HeartbeatPayload),
    SyncRequest(SyncRequestPayload),
    SyncResponse(SyncResponsePayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::EntryPending(_) => MessageKind::VehicleEntryPending,
            Message::EntryConfirmed(_) => MessageKind::VehicleEntryConfirmed,
            Message::Exit(_) => MessageKind::VehicleExit,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::SyncRequest(_) => MessageKind::SyncRequest,
            Message::SyncResponse(_) => MessageKind::SyncResponse,
        }
    }
}

/// Unit of wire exchange between nodes
///
/// Immutable once built; use the per-kind constructors so `source_node_id`
/// and, for lifecycle kinds, `event_id` are always stamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    source_node_id: String,
    event_id: Option<EventId>,
    message: Message,
}

impl Envelope {
    /// Vehicle seen entering, barrier not yet closed
    pub fn entry_pending(
        source_node_id: impl Into<String>,
        event_id: EventId,
        payload: EntryPayload,
    ) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            event_id: Some(event_id),
            message: Message::EntryPending(payload),
        }
    }

    /// Entry confirmed (barrier closed)
    pub fn entry_confirmed(
        source_node_id: impl Into<String>,
        event_id: EventId,
        confirmed_time: impl Into<String>,
    ) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            event_id: Some(event_id),
            message: Message::EntryConfirmed(ConfirmedPayload {
                confirmed_time: confirmed_time.into(),
            }),
        }
    }

    /// Vehicle left; `event_id` is the id of the matching entry
    pub fn exit(source_node_id: impl Into<String>, event_id: EventId, payload: ExitPayload) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            event_id: Some(event_id),
            message: Message::Exit(payload),
        }
    }

    pub fn heartbeat(source_node_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            event_id: None,
            message: Message::Heartbeat(HeartbeatPayload { timestamp }),
        }
    }

    pub fn sync_request(source_node_id: impl Into<String>, since_timestamp: i64) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            event_id: None,
            message: Message::SyncRequest(SyncRequestPayload { since_timestamp }),
        }
    }

    pub fn sync_response(source_node_id: impl Into<String>, events: Vec<VehicleSession>) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            event_id: None,
            message: Message::SyncResponse(SyncResponsePayload { events }),
        }
    }

    pub fn source_node_id(&self) -> &str {
        &self.source_node_id
    }

    pub fn event_id(&self) -> Option<&EventId> {
        self.event_id.as_ref()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse from the JSON wire form
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Untyped wire form of an [`Envelope`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(alias = "type")]
    kind: MessageKind,
    #[serde(alias = "source_central")]
    source_node_id: String,
    #[serde(default)]
    event_id: Option<EventId>,
    #[serde(default, alias = "data")]
    payload: serde_json::Value,
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    kind: MessageKind,
    payload: serde_json::Value,
) -> ProtocolResult<T> {
    // A missing payload is treated as an empty object so all-default payloads decode.
    let payload = if payload.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        if kind.is_lifecycle() && wire.event_id.is_none() {
            return Err(ProtocolError::MissingEventId(kind.to_string()));
        }

        let message = match kind {
            MessageKind::VehicleEntryPending => Message::EntryPending(decode_payload(kind, wire.payload)?),
            MessageKind::VehicleEntryConfirmed => {
                Message::EntryConfirmed(decode_payload(kind, wire.payload)?)
            }
            MessageKind::VehicleExit => Message::Exit(decode_payload(kind, wire.payload)?),
            MessageKind::Heartbeat => Message::Heartbeat(decode_payload(kind, wire.payload)?),
            MessageKind::SyncRequest => Message::SyncRequest(decode_payload(kind, wire.payload)?),
            MessageKind::SyncResponse => Message::SyncResponse(decode_payload(kind, wire.payload)?),
        };

        Ok(Envelope {
            source_node_id: wire.source_node_id,
            event_id: wire.event_id,
            message,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.kind();
        // Payload structs contain only strings, integers and vectors of them.
        let payload = match envelope.message {
            Message::EntryPending(p) => serde_json::to_value(p),
            Message::EntryConfirmed(p) => serde_json::to_value(p),
            Message::Exit(p) => serde_json::to_value(p),
            Message::Heartbeat(p) => serde_json::to_value(p),
            Message::SyncRequest(p) => serde_json::to_value(p),
            Message::SyncResponse(p) => serde_json::to_value(p),
        }
        .unwrap_or(serde_json::Value::Null);

        WireEnvelope {
            kind,
            source_node_id: envelope.source_node_id,
            event_id: envelope.event_id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    fn entry_payload() -> EntryPayload {
        EntryPayload {
            plate_id: "29A12345".to_string(),
            plate_view: "29A-123.45".to_string(),
            edge_id: "edge-1".to_string(),
            camera_type: "car".to_string(),
            direction: "ENTRY".to_string(),
            entry_time: "2025-12-02 10:30:00".to_string(),
        }
    }

    #[test]
    fn test_entry_pending_wire_shape() {
        let id = EventId::new("central-1_1733140800000_29A12345");
        let env = Envelope::entry_pending("central-1", id, entry_payload());
        let json: serde_json::Value = serde_json::from_slice(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["kind"], "VEHICLE_ENTRY_PENDING");
        assert_eq!(json["source_node_id"], "central-1");
        assert_eq!(json["event_id"], "central-1_1733140800000_29A12345");
        assert_eq!(json["payload"]["plate_view"], "29A-123.45");
        assert_eq!(json["payload"]["camera_type"], "car");
    }

    #[test]
    fn test_heartbeat_has_null_event_id() {
        let env = Envelope::heartbeat("central-1", 1234);
        let json: serde_json::Value = serde_json::from_slice(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "HEARTBEAT");
        assert!(json["event_id"].is_null());
        assert_eq!(json["payload"]["timestamp"], 1234);
    }

    #[test]
    fn test_decode_exit_with_legacy_field() {
        let raw = br#"{
            "kind": "VEHICLE_EXIT",
            "source_node_id": "central-5",
            "event_id": "central-1_1733140800000_29A12345",
            "payload": {
                "exit_central": "central-5",
                "exit_edge": "edge-20",
                "exit_time": "2025-12-02 11:30:00",
                "fee": 25000,
                "duration": "1h 0m"
            }
        }"#;
        let env = Envelope::from_json(raw).unwrap();
        assert_eq!(env.kind(), MessageKind::VehicleExit);
        match env.message() {
            Message::Exit(p) => {
                assert_eq!(p.exit_node_id, "central-5");
                assert_eq!(p.fee, 25000);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = br#"{"kind": "TELEPORT", "source_node_id": "x", "event_id": null, "payload": {}}"#;
        assert!(matches!(
            Envelope::from_json(raw),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_lifecycle_requires_event_id() {
        let raw = br#"{"kind": "VEHICLE_ENTRY_CONFIRMED", "source_node_id": "x", "event_id": null,
                       "payload": {"confirmed_time": "t"}}"#;
        assert!(matches!(
            Envelope::from_json(raw),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_sync_request_default_payload() {
        let raw = br#"{"kind": "SYNC_REQUEST", "source_node_id": "central-2"}"#;
        let env = Envelope::from_json(raw).unwrap();
        assert_eq!(
            env.message(),
            &Message::SyncRequest(SyncRequestPayload { since_timestamp: 0 })
        );
    }

    #[test]
    fn test_sync_response_strips_nulls() {
        let entry = entry_payload().to_new_entry(
            &EventId::new("central-1_1000_29A12345"),
            "central-1",
            SyncStatus::Local,
        );
        let session = VehicleSession::open(entry, 10);
        let env = Envelope::sync_response("central-1", vec![session.clone()]);

        let json: serde_json::Value = serde_json::from_slice(&env.to_json().unwrap()).unwrap();
        let record = &json["payload"]["events"][0];
        assert!(record.get("exit_time").is_none());
        assert!(record.get("fee").is_none());

        let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        match back.message() {
            Message::SyncResponse(p) => {
                assert_eq!(p.events.len(), 1);
                assert_eq!(p.events[0].status, SessionStatus::In);
                assert_eq!(p.events[0], session);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_entry_payload_plate_normalized() {
        let mut payload = entry_payload();
        payload.plate_id = "29a-123.45".to_string();
        payload.plate_view = String::new();
        let id = EventId::new("central-2_1000_29A12345");

        let entry = payload.to_new_entry(&id, "central-2", SyncStatus::Synced);
        assert_eq!(entry.plate_id, "29A12345");
        assert_eq!(entry.plate_view, "29a-123.45");
        assert_eq!(entry.source_node_id, "central-2");
    }

    #[test]
    fn test_kind_names() {
        assert!(MessageKind::VehicleExit.is_lifecycle());
        assert!(!MessageKind::SyncResponse.is_lifecycle());
        let json = serde_json::to_string(&MessageKind::SyncResponse).unwrap();
        assert_eq!(json, format!("\"{}\"", MessageKind::SyncResponse.as_str()));
    }
}
