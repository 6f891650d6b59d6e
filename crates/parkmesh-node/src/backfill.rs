//! Reconnect catch-up
//!
//! When an outbound link connects we ask the peer for everything it changed
//! since our watermark for it. The peer answers with at most
//! [`SYNC_BATCH_LIMIT`] sessions, oldest first, and we apply each one through
//! the reconciler.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use parkmesh_core::{Envelope, EventStore, SYNC_BATCH_LIMIT, VehicleSession, now_ms};

use crate::error::{NodeError, NodeResult};
use crate::reconciler::{ApplyOutcome, Reconciler};

/// How far back the first sync with a peer reaches
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Where a peer's watermark moves after a batch is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPolicy {
    /// Local wall clock at the time the batch was applied. Also advanced on
    /// disconnect. Records the peer changes between its query and our update
    /// can be missed.
    #[default]
    ReceiveTime,
    /// Highest `updated_at_ms` in the batch. Full batches are followed by
    /// another request from that point.
    MaxSeen,
}

/// Tally of one applied `SYNC_RESPONSE`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    /// Records that changed the store
    pub applied: usize,
    pub duplicates: usize,
    /// Records without an event id, or discarded by the conflict rule
    pub skipped: usize,
    /// Watermark stored for the peer, if it moved
    pub watermark: Option<i64>,
    /// Set when another page should be requested from this point
    pub next_since: Option<i64>,
}

/// Drives the SYNC_REQUEST / SYNC_RESPONSE exchange
pub struct Backfill {
    node_id: String,
    store: Arc<dyn EventStore>,
    reconciler: Arc<Reconciler>,
    policy: WatermarkPolicy,
    batch_limit: usize,
    lookback: Duration,
}

impl Backfill {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn EventStore>,
        reconciler: Arc<Reconciler>,
        policy: WatermarkPolicy,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            reconciler,
            policy,
            batch_limit: SYNC_BATCH_LIMIT,
            lookback: DEFAULT_LOOKBACK,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    pub fn policy(&self) -> WatermarkPolicy {
        self.policy
    }

    /// Request to send when a link to `peer_node_id` comes up
    #[instrument(skip(self))]
    pub async fn on_peer_connected(&self, peer_node_id: &str) -> NodeResult<Envelope> {
        let since = match self.store.get_peer_watermark(peer_node_id).await? {
            Some(watermark) => watermark,
            None => now_ms() - self.lookback.as_millis() as i64,
        };
        info!(since, "Requesting backfill");
        Ok(Envelope::sync_request(&self.node_id, since))
    }

    /// Answer a peer's `SYNC_REQUEST`
    #[instrument(skip(self))]
    pub async fn handle_sync_request(&self, requester: &str, since_timestamp: i64) -> NodeResult<Envelope> {
        let events = self.store.query_since(since_timestamp, self.batch_limit).await?;
        info!(count = events.len(), "Answering backfill request");
        Ok(Envelope::sync_response(&self.node_id, events))
    }

    /// Apply a peer's `SYNC_RESPONSE`
    ///
    /// Every record is attempted. If any fails the first error is returned
    /// and the watermark is left where it was, so the next sync retries.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn handle_sync_response(
        &self,
        peer_node_id: &str,
        events: &[VehicleSession],
    ) -> NodeResult<BatchSummary> {
        let mut summary = BatchSummary {
            received: events.len(),
            ..BatchSummary::default()
        };
        let mut first_error: Option<NodeError> = None;
        let mut min_seen = i64::MAX;
        let mut max_seen = i64::MIN;

        for record in events {
            min_seen = min_seen.min(record.updated_at_ms);
            max_seen = max_seen.max(record.updated_at_ms);

            let Some(event_id) = &record.event_id else {
                summary.skipped += 1;
                continue;
            };
            match self.reconciler.apply_record(event_id, record).await {
                Ok(outcome) if outcome.is_change() => summary.applied += 1,
                Ok(ApplyOutcome::Duplicate) => summary.duplicates += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "Failed to apply backfill record");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        summary.watermark = match self.policy {
            WatermarkPolicy::ReceiveTime => Some(now_ms()),
            WatermarkPolicy::MaxSeen if !events.is_empty() => Some(max_seen),
            WatermarkPolicy::MaxSeen => None,
        };
        if let Some(watermark) = summary.watermark {
            self.store.set_peer_watermark(peer_node_id, watermark).await?;
        }

        if self.policy == WatermarkPolicy::MaxSeen && events.len() >= self.batch_limit {
            if max_seen > min_seen {
                summary.next_since = Some(max_seen);
            } else {
                warn!(
                    updated_at_ms = max_seen,
                    "Full batch shares one timestamp, cannot page further"
                );
            }
        }

        info!(
            applied = summary.applied,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            watermark = ?summary.watermark,
            "Backfill batch applied"
        );
        Ok(summary)
    }

    /// Advance the watermark when a link drops so the next sync covers only
    /// the outage
    #[instrument(skip(self))]
    pub async fn on_peer_disconnected(&self, peer_node_id: &str) -> NodeResult<()> {
        if self.policy == WatermarkPolicy::ReceiveTime {
            self.store.set_peer_watermark(peer_node_id, now_ms()).await?;
        } else {
            debug!("Keeping max-seen watermark");
        }
        Ok(())
    }
}
