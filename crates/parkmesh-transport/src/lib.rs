//! # Parkmesh Transport
//!
//! Peer-to-peer links between central nodes.
//!
//! Each node dials every configured peer through a [`PeerLink`] and accepts
//! connections from peers that dial it through a [`PeerServer`]. Both sides
//! exchange length-prefixed JSON envelopes and report what they see as
//! [`LinkEvent`]s on a channel owned by the node coordinator.
//!
//! Sends are best-effort: a frame queued on a link that is down or backed up
//! is dropped and counted, never retried. Missed events are recovered by
//! backfill when the link comes back.

pub mod config;
pub mod error;
pub mod framing;
pub mod link;
pub mod server;
mod session;

pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use link::PeerLink;
pub use server::PeerServer;
pub use session::{LinkDirection, LinkEvent, LinkStats, LinkStatsSnapshot};
