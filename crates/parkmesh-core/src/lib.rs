//! # Parkmesh Core
//!
//! Foundational types for the central-node synchronization engine.
//!
//! ## Key Types
//!
//! - [`Envelope`]: the unit of wire exchange, one per frame
//! - [`EventId`]: `{node_id}_{unix_ms}_{plate}` idempotency key and conflict clock
//! - [`VehicleSession`]: one vehicle stay in the ledger
//!
//! ## Key Traits
//!
//! - [`EventStore`]: the ledger operations the engine depends on

pub mod error;
pub mod event_id;
pub mod protocol;
pub mod session;
pub mod store;

pub use error::*;
pub use event_id::*;
pub use protocol::*;
pub use session::*;
pub use store::*;
