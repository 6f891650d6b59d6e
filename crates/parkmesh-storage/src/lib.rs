//! # Parkmesh Storage
//!
//! Durable session ledger for a central node, built on redb.
//!
//! [`RedbEventStore`] implements [`parkmesh_core::EventStore`]. Rows are
//! postcard encoded and every mutation is a single redb write transaction,
//! so the conflict swap (delete superseded entry, insert winner) is atomic.

pub mod error;
pub mod event_store;
pub mod records;
pub mod tables;

pub use error::StorageError;
pub use event_store::RedbEventStore;
pub use records::{PeerSyncRecord, SessionRecord};
pub use tables::{RedbStorage, RedbStorageConfig};
