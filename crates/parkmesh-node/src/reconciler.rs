//! Event reconciler
//!
//! Applies remote lifecycle events to the local store. Deduplication is by
//! event id; two open sessions for the same plate are resolved by the
//! "older event wins" rule on the timestamp embedded in the event id, which
//! gives the same result whichever node evaluates it and in whatever order.
//!
//! Check-then-act sequences for one plate are serialized by a per-plate
//! async lock, so two peers delivering competing entries at the same time
//! cannot both insert.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use parkmesh_core::{
    EntryPayload, EventId, EventStore, ExitPayload, ExitUpdate, NewEntry, SyncStatus,
    VehicleSession, normalize_plate,
};

use crate::error::NodeResult;
use crate::hooks::{ConflictResolution, SyncHooks};

/// Upper bound on exits held while waiting for their entry
const MAX_BUFFERED_EXITS: usize = 10_000;

/// What applying one event did to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new open session was recorded
    Inserted,
    /// Already applied; nothing changed
    Duplicate,
    /// The incoming entry was older and replaced a local open session
    Replaced { superseded: EventId },
    /// A local open session was older; the incoming entry was dropped
    Discarded,
    /// A session was closed
    ExitApplied,
    /// Exit for an unknown session, dropped
    ExitOrphaned,
    /// Exit for an unknown session, held until its entry arrives
    ExitBuffered,
    /// Entry confirmation observed; no state change
    Confirmed,
}

impl ApplyOutcome {
    /// Whether the store was mutated
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted | ApplyOutcome::Replaced { .. } | ApplyOutcome::ExitApplied
        )
    }
}

/// Holds one plate's lock and prunes the lock table on release
pub(crate) struct PlateGuard<'a> {
    locks: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PlateGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Applies lifecycle events against an [`EventStore`]
pub struct Reconciler {
    store: Arc<dyn EventStore>,
    hooks: Arc<dyn SyncHooks>,
    plate_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Present when orphan exit buffering is enabled
    orphan_exits: Option<Mutex<HashMap<EventId, ExitUpdate>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EventStore>, hooks: Arc<dyn SyncHooks>, buffer_orphan_exits: bool) -> Self {
        Self {
            store,
            hooks,
            plate_locks: DashMap::new(),
            orphan_exits: buffer_orphan_exits.then(|| Mutex::new(HashMap::new())),
        }
    }

    /// Number of exits waiting for their entry
    pub fn buffered_exits(&self) -> usize {
        self.orphan_exits.as_ref().map_or(0, |b| b.lock().len())
    }

    /// Serialize work on one plate
    pub(crate) async fn lock_plate(&self, plate_id: &str) -> PlateGuard<'_> {
        let key = normalize_plate(plate_id);
        let lock = self
            .plate_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        PlateGuard {
            locks: &self.plate_locks,
            key,
            guard: Some(guard),
        }
    }

    /// `VEHICLE_ENTRY_PENDING`
    #[instrument(skip(self, payload), fields(event_id = %event_id, plate = %payload.plate_id))]
    pub async fn apply_entry(
        &self,
        source_node_id: &str,
        event_id: &EventId,
        payload: &EntryPayload,
    ) -> NodeResult<ApplyOutcome> {
        let _plate = self.lock_plate(&payload.plate_id).await;

        if self.store.event_exists(event_id).await? {
            debug!("Entry already applied");
            return Ok(ApplyOutcome::Duplicate);
        }

        let entry = payload.to_new_entry(event_id, source_node_id, SyncStatus::Synced);
        self.open_or_resolve(event_id, entry).await
    }

    /// `VEHICLE_ENTRY_CONFIRMED`. Observed only; the entry already set IN.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn apply_confirmed(&self, event_id: &EventId) -> NodeResult<ApplyOutcome> {
        if self.store.event_exists(event_id).await? {
            debug!("Entry confirmed");
        } else {
            debug!("Confirmation for an entry not seen yet");
        }
        Ok(ApplyOutcome::Confirmed)
    }

    /// `VEHICLE_EXIT`. The session is looked up by the entry's event id.
    #[instrument(skip(self, payload), fields(event_id = %event_id))]
    pub async fn apply_exit(&self, event_id: &EventId, payload: &ExitPayload) -> NodeResult<ApplyOutcome> {
        let plate = event_id.plate().unwrap_or(event_id.as_str());
        let _plate = self.lock_plate(plate).await;
        self.close_session(event_id, payload.to_exit_update()).await
    }

    /// One record from a `SYNC_RESPONSE`
    ///
    /// Open records go through the conflict rule. Completed records are
    /// inserted and closed. A record that is open locally but arrives closed
    /// has its exit applied.
    #[instrument(skip(self, record), fields(event_id = %event_id, plate = %record.plate_id))]
    pub async fn apply_record(&self, event_id: &EventId, record: &VehicleSession) -> NodeResult<ApplyOutcome> {
        let _plate = self.lock_plate(&record.plate_id).await;
        let exit = record.exit_update();

        if let Some(local) = self.store.get_session(event_id).await? {
            return match exit {
                Some(exit) if local.is_open() => self.close_session(event_id, exit).await,
                _ => Ok(ApplyOutcome::Duplicate),
            };
        }

        match exit {
            Some(exit) => {
                self.store
                    .insert_entry(record.to_new_entry(SyncStatus::Synced))
                    .await?;
                self.store.update_exit(event_id, &exit).await?;
                self.take_orphan_exit(event_id);
                debug!("Completed stay applied");
                if let Some(session) = self.store.get_session(event_id).await? {
                    self.hooks.on_entry_applied(&session);
                    self.hooks.on_exit_applied(&session);
                }
                Ok(ApplyOutcome::ExitApplied)
            }
            None => {
                self.open_or_resolve(event_id, record.to_new_entry(SyncStatus::Synced))
                    .await
            }
        }
    }

    /// Insert an open session, resolving against any session already IN for
    /// the plate. Caller holds the plate lock.
    async fn open_or_resolve(&self, event_id: &EventId, entry: NewEntry) -> NodeResult<ApplyOutcome> {
        let plate_id = entry.plate_id.clone();

        let Some(existing) = self.store.find_open_session(&plate_id).await? else {
            self.store.insert_entry(entry).await?;
            info!("Entry applied");
            self.entry_committed(event_id).await?;
            return Ok(ApplyOutcome::Inserted);
        };

        // A local record without a parseable id is treated as infinitely old
        let superseded = match &existing.event_id {
            Some(local) if event_id.is_older_than(local) == Some(true) => Some(local.clone()),
            _ => None,
        };

        match superseded {
            Some(local) => {
                self.store.replace_open_session(&local, entry).await?;
                info!(superseded = %local, "Conflict resolved, incoming entry is older");
                self.hooks.on_conflict_resolved(&ConflictResolution {
                    plate_id,
                    winner: Some(event_id.clone()),
                    loser: local.clone(),
                    replaced_local: true,
                });
                self.entry_committed(event_id).await?;
                Ok(ApplyOutcome::Replaced { superseded: local })
            }
            None => {
                info!(kept = ?existing.event_id, "Conflict resolved, keeping local entry");
                self.hooks.on_conflict_resolved(&ConflictResolution {
                    plate_id,
                    winner: existing.event_id.clone(),
                    loser: event_id.clone(),
                    replaced_local: false,
                });
                if self.take_orphan_exit(event_id).is_some() {
                    debug!("Dropped buffered exit for discarded entry");
                }
                Ok(ApplyOutcome::Discarded)
            }
        }
    }

    /// Apply any buffered exit and fire hooks for a newly opened session
    async fn entry_committed(&self, event_id: &EventId) -> NodeResult<()> {
        if let Some(exit) = self.take_orphan_exit(event_id) {
            if self.store.update_exit(event_id, &exit).await? {
                info!("Applied buffered exit");
            }
        }
        if let Some(session) = self.store.get_session(event_id).await? {
            self.hooks.on_entry_applied(&session);
            if !session.is_open() {
                self.hooks.on_exit_applied(&session);
            }
        }
        Ok(())
    }

    /// Caller holds the plate lock
    async fn close_session(&self, event_id: &EventId, exit: ExitUpdate) -> NodeResult<ApplyOutcome> {
        match self.store.get_session(event_id).await? {
            Some(session) if !session.is_open() => {
                debug!("Exit already applied");
                Ok(ApplyOutcome::Duplicate)
            }
            Some(_) => {
                if !self.store.update_exit(event_id, &exit).await? {
                    warn!("Session vanished before exit could be applied");
                    return Ok(ApplyOutcome::ExitOrphaned);
                }
                info!(fee = exit.fee, "Exit applied");
                if let Some(session) = self.store.get_session(event_id).await? {
                    self.hooks.on_exit_applied(&session);
                }
                Ok(ApplyOutcome::ExitApplied)
            }
            None => self.orphan_exit(event_id, exit),
        }
    }

    fn orphan_exit(&self, event_id: &EventId, exit: ExitUpdate) -> NodeResult<ApplyOutcome> {
        let Some(buffer) = &self.orphan_exits else {
            warn!("Exit for unknown entry dropped");
            return Ok(ApplyOutcome::ExitOrphaned);
        };
        let mut buffer = buffer.lock();
        if buffer.len() >= MAX_BUFFERED_EXITS && !buffer.contains_key(event_id) {
            warn!(buffered = buffer.len(), "Orphan exit buffer full, dropping exit");
            return Ok(ApplyOutcome::ExitOrphaned);
        }
        buffer.insert(event_id.clone(), exit);
        info!("Exit for unknown entry buffered");
        Ok(ApplyOutcome::ExitBuffered)
    }

    fn take_orphan_exit(&self, event_id: &EventId) -> Option<ExitUpdate> {
        self.orphan_exits.as_ref()?.lock().remove(event_id)
    }
}
