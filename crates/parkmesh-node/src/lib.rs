//! # Parkmesh Node
//!
//! Sync coordinator for one parking central node.
//!
//! This crate provides [`NodeCoordinator`], which ties together:
//! - Transport layer (outbound [`PeerLink`](parkmesh_transport::PeerLink)s and an inbound server)
//! - Reconciliation of remote entries and exits against the local store
//! - Backfill of missed events when a peer reconnects
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use parkmesh_node::{MeshConfig, NodeCoordinator, PeerDescriptor};
//! use parkmesh_storage::{RedbEventStore, RedbStorageConfig};
//!
//! let config = MeshConfig::new("central-1", "0.0.0.0", 9000)
//!     .with_peer(PeerDescriptor::new("central-2", "10.0.0.2", 9000));
//! let store = Arc::new(RedbEventStore::open(RedbStorageConfig::in_dir("./data"))?);
//!
//! let node = NodeCoordinator::new(config, store)?;
//! node.start().await?;
//!
//! let event_id = node.local_events().record_entry(entry).await?;
//! ```

pub mod backfill;
mod config;
mod coordinator;
mod error;
pub mod hooks;
mod local;
pub mod mesh;
pub mod reconciler;

pub use backfill::{Backfill, BatchSummary, DEFAULT_LOOKBACK, WatermarkPolicy};
pub use config::{LocalNode, MeshConfig, PeerDescriptor};
pub use coordinator::{NodeCoordinator, NodeStatus};
pub use error::{NodeError, NodeResult};
pub use hooks::{ConflictResolution, NoopHooks, SyncHooks};
pub use local::{ExitDetails, LocalEvents};
pub use mesh::{Mesh, PeerStatus};
pub use reconciler::{ApplyOutcome, Reconciler};
