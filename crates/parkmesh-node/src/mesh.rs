//! Peer registry
//!
//! Owns every outbound [`PeerLink`] and the inbound [`PeerServer`], fans
//! broadcasts out over both directions and keeps the counters reported by
//! [`NodeStatus`](crate::NodeStatus).

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use parkmesh_core::Envelope;
use parkmesh_transport::{PeerLink, PeerServer, framing};

/// Connection state of one peer as seen by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub node_id: String,
    /// Reachable over either an outbound link or an inbound connection
    pub connected: bool,
    /// Last envelope received from this peer, Unix millis
    #[serde(rename = "last_seen", alias = "last_seen_ms")]
    pub last_seen_ms: Option<i64>,
    /// Whether the peer appears in this node's configuration
    pub configured: bool,
}

#[derive(Default)]
pub struct Mesh {
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    server: RwLock<Option<Arc<PeerServer>>>,
    last_seen: DashMap<String, i64>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_link(&self, link: PeerLink) {
        let node_id = link.node_id().to_string();
        if self.links.write().insert(node_id.clone(), Arc::new(link)).is_some() {
            warn!(peer = %node_id, "Replaced existing link");
        }
    }

    pub(crate) fn set_server(&self, server: PeerServer) {
        *self.server.write() = Some(Arc::new(server));
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.read().as_ref().map(|s| s.local_addr())
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Record an envelope delivered to dispatch
    pub(crate) fn record_received(&self, from: &str, at_ms: i64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_seen.insert(from.to_string(), at_ms);
    }

    /// Whether an outbound link to `node_id` is up
    pub fn is_link_connected(&self, node_id: &str) -> bool {
        self.links
            .read()
            .get(node_id)
            .is_some_and(|l| l.is_connected())
    }

    /// Node ids with at least one live connection in either direction
    pub fn connected_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .links
            .read()
            .values()
            .filter(|l| l.is_connected())
            .map(|l| l.node_id().to_string())
            .collect();
        if let Some(server) = self.server.read().as_ref() {
            ids.extend(server.connected_node_ids());
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Send to every connected outbound link and every inbound connection
    ///
    /// Returns the number of links that accepted the envelope. A no-op
    /// when there are no peers.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let links: Vec<Arc<PeerLink>> = self.links.read().values().cloned().collect();
        let server = self.server.read().clone();
        if links.is_empty() && server.is_none() {
            return 0;
        }

        let frame = match framing::encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %envelope.kind(), error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let mut sent = links
            .iter()
            .filter(|l| l.is_connected())
            .filter(|l| l.send_frame(frame.clone()))
            .count();
        if let Some(server) = server {
            sent += server.broadcast_frame(frame);
        }

        self.messages_sent.fetch_add(sent as u64, Ordering::Relaxed);
        debug!(kind = %envelope.kind(), sent, "Broadcast");
        sent
    }

    /// Send to one peer, preferring the outbound link
    pub fn send_to_peer(&self, node_id: &str, envelope: &Envelope) -> bool {
        let link = self.links.read().get(node_id).cloned();
        let sent = match link {
            Some(link) if link.is_connected() && link.send(envelope) => true,
            _ => {
                let server = self.server.read().clone();
                server.is_some_and(|s| s.send_to(node_id, envelope))
            }
        };
        if sent {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(peer = %node_id, kind = %envelope.kind(), "No route to peer");
        }
        sent
    }

    /// Per-peer status: configured peers plus any node seen inbound
    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        let mut peers: BTreeMap<String, PeerStatus> = BTreeMap::new();
        for link in self.links.read().values() {
            peers.insert(
                link.node_id().to_string(),
                PeerStatus {
                    node_id: link.node_id().to_string(),
                    connected: link.is_connected(),
                    last_seen_ms: None,
                    configured: true,
                },
            );
        }
        if let Some(server) = self.server.read().as_ref() {
            for node_id in server.connected_node_ids() {
                peers
                    .entry(node_id.clone())
                    .or_insert_with(|| PeerStatus {
                        node_id,
                        connected: false,
                        last_seen_ms: None,
                        configured: false,
                    })
                    .connected = true;
            }
        }
        for entry in self.last_seen.iter() {
            if let Some(peer) = peers.get_mut(entry.key()) {
                peer.last_seen_ms = Some(*entry.value());
            }
        }
        peers.into_values().collect()
    }

    /// Stop every link and the server, waiting for their tasks
    pub(crate) async fn shutdown(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.write().drain().map(|(_, l)| l).collect();
        for link in &links {
            link.stop().await;
        }
        let server = self.server.write().take();
        if let Some(server) = server {
            server.stop().await;
        }
    }
}
