//! Callbacks fired after the reconciler commits a change
//!
//! Hooks run on the dispatch task. Keep them short; anything slow should be
//! handed off to the application's own tasks.

use parkmesh_core::{EventId, VehicleSession};

/// Result of resolving two competing open sessions for one plate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolution {
    pub plate_id: String,
    /// Surviving event id. `None` when a legacy record without an id was kept.
    pub winner: Option<EventId>,
    /// Event that was deleted or discarded
    pub loser: EventId,
    /// Whether the local record was deleted in favor of the incoming one
    pub replaced_local: bool,
}

/// Application callbacks. Every method defaults to a no-op.
pub trait SyncHooks: Send + Sync {
    /// A remote entry opened a session
    fn on_entry_applied(&self, _session: &VehicleSession) {}

    /// A remote exit closed a session
    fn on_exit_applied(&self, _session: &VehicleSession) {}

    /// Two entries competed for the same plate
    fn on_conflict_resolved(&self, _resolution: &ConflictResolution) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SyncHooks for NoopHooks {}
