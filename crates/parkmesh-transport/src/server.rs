//! Inbound peer server
//!
//! Accepts connections from peers that dial us. A connection's node id is
//! unknown until its first envelope arrives and is taken from that
//! envelope's `source_node_id`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use parkmesh_core::Envelope;

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::framing;
use crate::session::{LinkDirection, LinkEvent, LinkStats, LinkStatsSnapshot, PeerTag, Session, SessionEnd};

struct InboundConnection {
    remote: SocketAddr,
    node_id: Arc<RwLock<Option<String>>>,
    outbox: mpsc::Sender<Bytes>,
}

struct ServerShared {
    connections: DashMap<u64, InboundConnection>,
    next_conn_id: AtomicU64,
    stats: LinkStats,
}

/// Listener for peers that dial this node
pub struct PeerServer {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerServer {
    /// Bind `addr` and start accepting in the background
    #[instrument(skip(config, events, tracker))]
    pub async fn bind(
        addr: &str,
        config: TransportConfig,
        events: mpsc::Sender<LinkEvent>,
        tracker: &TaskTracker,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            stats: LinkStats::default(),
        });
        let cancel = CancellationToken::new();

        let task = tracker.spawn(accept_loop(
            listener,
            config,
            shared.clone(),
            events,
            cancel.clone(),
            tracker.clone(),
        ));

        info!(addr = %local_addr, "Peer server listening");

        Ok(Self {
            local_addr,
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open inbound connections
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Node ids learned on open inbound connections
    pub fn connected_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .connections
            .iter()
            .filter_map(|c| c.node_id.read().clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Queue a frame on every inbound connection. Returns how many accepted it.
    pub fn broadcast_frame(&self, frame: Bytes) -> usize {
        let mut sent = 0;
        for conn in self.shared.connections.iter() {
            if self.offer(&conn, frame.clone()) {
                sent += 1;
            }
        }
        sent
    }

    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        match framing::encode(envelope) {
            Ok(frame) => self.broadcast_frame(frame),
            Err(e) => {
                warn!(error = %e, "Failed to encode envelope");
                0
            }
        }
    }

    pub fn send_to(&self, node_id: &str, envelope: &Envelope) -> bool {
        match framing::encode(envelope) {
            Ok(frame) => self.send_frame_to(node_id, frame),
            Err(e) => {
                warn!(peer = %node_id, error = %e, "Failed to encode envelope");
                false
            }
        }
    }

    /// Queue a frame on the newest inbound connection from `node_id`
    pub fn send_frame_to(&self, node_id: &str, frame: Bytes) -> bool {
        let newest = self
            .shared
            .connections
            .iter()
            .filter(|c| c.node_id.read().as_deref() == Some(node_id))
            .map(|c| *c.key())
            .max();
        match newest.and_then(|id| self.shared.connections.get(&id)) {
            Some(conn) => self.offer(&conn, frame),
            None => false,
        }
    }

    fn offer(&self, conn: &InboundConnection, frame: Bytes) -> bool {
        match conn.outbox.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(remote = %conn.remote, "Inbound outbox full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting, close every inbound connection and wait for their tasks
    ///
    /// Safe to call more than once.
    #[instrument(skip(self), fields(addr = %self.local_addr))]
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("Peer server stopped");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: TransportConfig,
    shared: Arc<ServerShared>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if shared.connections.len() >= config.max_inbound_connections {
                        warn!(remote = %remote, max = config.max_inbound_connections, "Refusing inbound connection");
                        drop(stream);
                        continue;
                    }
                    let conn = serve_connection(
                        stream,
                        remote,
                        config.clone(),
                        shared.clone(),
                        events.clone(),
                        cancel.child_token(),
                    );
                    connections.spawn(tracker.track_future(conn));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            },
        }
    }

    // Listener drops here, so no new connections are accepted
    drop(listener);
    while connections.join_next().await.is_some() {}
    shared.connections.clear();
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    config: TransportConfig,
    shared: Arc<ServerShared>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (outbox_tx, mut outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));
    let node_id = Arc::new(RwLock::new(None));

    shared.connections.insert(
        conn_id,
        InboundConnection {
            remote,
            node_id: node_id.clone(),
            outbox: outbox_tx,
        },
    );
    shared.stats.connects.fetch_add(1, Ordering::Relaxed);
    debug!(remote = %remote, conn_id, "Accepted inbound connection");

    let end = Session {
        config: &config,
        outbox: &mut outbox_rx,
        events: &events,
        cancel: &cancel,
        stats: &shared.stats,
        peer: PeerTag::Learned(node_id.clone()),
        via: LinkDirection::Inbound,
    }
    .run(stream)
    .await;

    shared.connections.remove(&conn_id);
    let peer = node_id.read().clone().unwrap_or_else(|| "unknown".to_string());
    match end {
        SessionEnd::Cancelled => debug!(remote = %remote, peer = %peer, "Inbound connection closed"),
        SessionEnd::Closed(reason) => {
            info!(remote = %remote, peer = %peer, reason = %reason, "Inbound connection ended")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn accept_one(server: &PeerServer) -> (framing::FrameStream, framing::FrameSink) {
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        framing::split(stream, 1024 * 1024)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_learns_node_id_and_routes_replies() {
        let tracker = TaskTracker::new();
        let (tx, mut rx) = mpsc::channel(16);
        let server = PeerServer::bind("127.0.0.1:0", TransportConfig::default(), tx, &tracker)
            .await
            .unwrap();

        let (mut reader, mut writer) = accept_one(&server).await;
        writer
            .send(framing::encode(&Envelope::sync_request("B", 5)).unwrap())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            LinkEvent::Message { from, via, .. } => {
                assert_eq!(from.as_deref(), Some("B"));
                assert_eq!(via, LinkDirection::Inbound);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(server.connected_node_ids(), vec!["B".to_string()]);

        assert!(server.send_to("B", &Envelope::heartbeat("A", 1)));
        assert!(!server.send_frame_to("C", Bytes::from_static(b"{}")));

        let frame = reader.recv().await.unwrap().unwrap();
        assert_eq!(framing::decode(&frame).unwrap(), Envelope::heartbeat("A", 1));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let tracker = TaskTracker::new();
        let (tx, _rx) = mpsc::channel(16);
        let server = PeerServer::bind("127.0.0.1:0", TransportConfig::default(), tx, &tracker)
            .await
            .unwrap();

        let (mut r1, _w1) = accept_one(&server).await;
        let (mut r2, _w2) = accept_one(&server).await;
        wait_for(|| server.connection_count() == 2).await;

        assert_eq!(server.broadcast(&Envelope::heartbeat("A", 3)), 2);
        for reader in [&mut r1, &mut r2] {
            let frame = reader.recv().await.unwrap().unwrap();
            assert_eq!(framing::decode(&frame).unwrap(), Envelope::heartbeat("A", 3));
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let tracker = TaskTracker::new();
        let (tx, mut rx) = mpsc::channel(16);
        let server = PeerServer::bind("127.0.0.1:0", TransportConfig::default(), tx, &tracker)
            .await
            .unwrap();

        let (_reader, mut writer) = accept_one(&server).await;
        writer.send(Bytes::from_static(b"not json")).await.unwrap();
        writer
            .send(Bytes::from_static(br#"{"kind":"BOGUS","source_node_id":"B"}"#))
            .await
            .unwrap();
        writer
            .send(framing::encode(&Envelope::heartbeat("B", 9)).unwrap())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            LinkEvent::Message { envelope, .. } => assert_eq!(envelope, Envelope::heartbeat("B", 9)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(server.stats().frames_malformed, 2);
        assert_eq!(server.connection_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_connections_and_joins_tasks() {
        let tracker = TaskTracker::new();
        let (tx, _rx) = mpsc::channel(16);
        let server = PeerServer::bind("127.0.0.1:0", TransportConfig::default(), tx, &tracker)
            .await
            .unwrap();
        let addr = server.local_addr();

        let (mut reader, _writer) = accept_one(&server).await;
        wait_for(|| server.connection_count() == 1).await;
        assert_eq!(tracker.len(), 2);

        server.stop().await;
        server.stop().await;

        assert_eq!(tracker.len(), 0);
        assert_eq!(server.connection_count(), 0);
        assert!(reader.recv().await.unwrap_or(None).is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
