//! Outbound peer links
//!
//! A [`PeerLink`] owns one reconnect loop that dials a configured peer,
//! pumps frames while connected, and redials after a fixed backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use parkmesh_core::Envelope;

use crate::config::TransportConfig;
use crate::framing;
use crate::session::{self, LinkDirection, LinkEvent, LinkStats, LinkStatsSnapshot, PeerTag, Session, SessionEnd};

struct LinkShared {
    connected: AtomicBool,
    stats: LinkStats,
}

/// Persistent logical connection to one configured peer
pub struct PeerLink {
    node_id: String,
    addr: String,
    shared: Arc<LinkShared>,
    outbox: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    /// Start dialing `addr` in the background
    ///
    /// Lifecycle signals and decoded envelopes are delivered on `events`.
    pub fn spawn(
        node_id: impl Into<String>,
        addr: impl Into<String>,
        config: TransportConfig,
        events: mpsc::Sender<LinkEvent>,
        tracker: &TaskTracker,
    ) -> Self {
        let node_id = node_id.into();
        let addr = addr.into();
        let (outbox_tx, outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));
        let shared = Arc::new(LinkShared {
            connected: AtomicBool::new(false),
            stats: LinkStats::default(),
        });
        let cancel = CancellationToken::new();

        let task = tracker.spawn(run_link(
            node_id.clone(),
            addr.clone(),
            config,
            shared.clone(),
            outbox_rx,
            events,
            cancel.clone(),
        ));

        Self {
            node_id,
            addr,
            shared,
            outbox: outbox_tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// When this link last delivered a decoded envelope
    pub fn last_seen_ms(&self) -> Option<i64> {
        self.shared.stats.last_seen_ms()
    }

    /// Best-effort send. Returns false if the link is down or backed up.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match framing::encode(envelope) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                warn!(peer = %self.node_id, error = %e, "Failed to encode envelope");
                false
            }
        }
    }

    /// Best-effort send of a pre-encoded frame
    pub fn send_frame(&self, frame: Bytes) -> bool {
        if !self.is_connected() {
            self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.outbox.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %self.node_id, "Outbox full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Cancel the reconnect loop and wait for it to exit
    ///
    /// Safe to call more than once.
    #[instrument(skip(self), fields(peer = %self.node_id))]
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            debug!("Peer link stopped");
        }
    }
}

async fn run_link(
    node_id: String,
    addr: String,
    config: TransportConfig,
    shared: Arc<LinkShared>,
    mut outbox: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        let connect = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr.as_str()));
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            res = connect => res,
        };

        match attempt {
            Ok(Ok(stream)) => {
                shared.connected.store(true, Ordering::SeqCst);
                shared.stats.connects.fetch_add(1, Ordering::Relaxed);
                info!(peer = %node_id, addr = %addr, "Connected to peer");

                let connected = LinkEvent::Connected { node_id: node_id.clone() };
                if !session::emit(&events, &cancel, connected).await {
                    break;
                }

                let end = Session {
                    config: &config,
                    outbox: &mut outbox,
                    events: &events,
                    cancel: &cancel,
                    stats: &shared.stats,
                    peer: PeerTag::Configured(node_id.clone()),
                    via: LinkDirection::Outbound,
                }
                .run(stream)
                .await;

                shared.connected.store(false, Ordering::SeqCst);
                let dropped = session::drain(&mut outbox);

                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Closed(reason) => {
                        warn!(peer = %node_id, reason = %reason, dropped, "Peer connection lost");
                        let disconnected = LinkEvent::Disconnected { node_id: node_id.clone() };
                        if !session::emit(&events, &cancel, disconnected).await {
                            break;
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(peer = %node_id, addr = %addr, error = %e, "Connect failed");
            }
            Err(_) => {
                debug!(peer = %node_id, addr = %addr, "Connect timed out");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_backoff()) => {}
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
}
