//! Event identifiers
//!
//! An event ID has the form `{node_id}_{unix_ms}_{normalized_plate}`. It is
//! minted once at the node where the physical event happened and is used both
//! as the idempotency key for at-least-once delivery and as the logical clock
//! for comparing two competing entries for the same plate.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one vehicle-lifecycle occurrence
///
/// Stored verbatim; parsing happens lazily so legacy identifiers that do not
/// follow the `{node}_{ms}_{plate}` layout still round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Wrap an existing identifier without validating it
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mint a new identifier for an event observed at `timestamp_ms`
    pub fn generate(node_id: &str, plate: &str, timestamp_ms: i64) -> Self {
        Self(format!("{}_{}_{}", node_id, timestamp_ms, normalize_plate(plate)))
    }

    /// Mint a new identifier stamped with the current wall clock
    pub fn generate_now(node_id: &str, plate: &str) -> Self {
        Self::generate(node_id, plate, chrono::Utc::now().timestamp_millis())
    }

    /// The raw identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(node_id, timestamp, plate)`, if well formed
    ///
    /// Splits from the right so node ids that contain `_` still parse; the
    /// plate suffix is normalized and never contains one.
    fn parts(&self) -> Option<(&str, i64, &str)> {
        let mut it = self.0.rsplitn(3, '_');
        let plate = it.next()?;
        let ts = it.next()?.parse::<i64>().ok()?;
        let node = it.next()?;
        if node.is_empty() {
            return None;
        }
        Some((node, ts, plate))
    }

    /// Embedded logical timestamp in milliseconds
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.parts().map(|(_, ts, _)| ts)
    }

    /// Node that minted this identifier
    pub fn node_id(&self) -> Option<&str> {
        self.parts().map(|(node, _, _)| node)
    }

    /// Normalized plate suffix
    pub fn plate(&self) -> Option<&str> {
        self.parts().map(|(_, _, plate)| plate)
    }

    /// Whether this event strictly predates `other`
    ///
    /// `None` when either identifier has no parseable timestamp.
    pub fn is_older_than(&self, other: &EventId) -> Option<bool> {
        let ours = self.timestamp_ms()?;
        let theirs = other.timestamp_ms()?;
        Some(ours.cmp(&theirs) == Ordering::Less)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for EventId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a plate for use as a key: ASCII alphanumerics, uppercased
///
/// `"29a-123.45"` becomes `"29A12345"`.
pub fn normalize_plate(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
