//! Per-connection read/write loop shared by outbound links and inbound connections

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parkmesh_core::{Envelope, now_ms};

use crate::config::TransportConfig;
use crate::framing;

/// Which side opened the connection an event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

/// Events emitted by links to the node coordinator
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// An outbound link finished connecting
    Connected { node_id: String },
    /// An outbound link lost its connection
    Disconnected { node_id: String },
    /// A decoded envelope arrived
    Message {
        /// Node id of the link, when known
        from: Option<String>,
        via: LinkDirection,
        envelope: Envelope,
    },
}

/// Frame counters for one link or server
#[derive(Debug, Default)]
pub struct LinkStats {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    /// Frames that failed to decode
    pub frames_malformed: AtomicU64,
    /// Frames refused because the link was down or its outbox was full
    pub frames_dropped: AtomicU64,
    pub connects: AtomicU64,
    /// Wall clock of the last decoded frame, Unix millis, 0 if none
    pub last_seen_ms: AtomicI64,
}

impl LinkStats {
    pub fn last_seen_ms(&self) -> Option<i64> {
        match self.last_seen_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            last_seen_ms: self.last_seen_ms(),
        }
    }
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub frames_dropped: u64,
    pub connects: u64,
    pub last_seen_ms: Option<i64>,
}

/// Identity of the remote end of a session
pub(crate) enum PeerTag {
    /// Known from configuration
    Configured(String),
    /// Learned from the first envelope's `source_node_id`
    Learned(Arc<RwLock<Option<String>>>),
}

impl PeerTag {
    fn observe(&self, envelope: &Envelope) -> Option<String> {
        match self {
            PeerTag::Configured(id) => Some(id.clone()),
            PeerTag::Learned(slot) => {
                if slot.read().is_none() {
                    let id = envelope.source_node_id().to_string();
                    debug!(peer = %id, "Learned inbound peer identity");
                    *slot.write() = Some(id);
                }
                slot.read().clone()
            }
        }
    }
}

pub(crate) enum SessionEnd {
    Cancelled,
    Closed(String),
}

/// Send an event upward unless cancelled first. Returns false on cancel or
/// when the coordinator is gone.
pub(crate) async fn emit(
    events: &mpsc::Sender<LinkEvent>,
    cancel: &CancellationToken,
    event: LinkEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        res = events.send(event) => res.is_ok(),
    }
}

pub(crate) struct Session<'a> {
    pub config: &'a TransportConfig,
    pub outbox: &'a mut mpsc::Receiver<Bytes>,
    pub events: &'a mpsc::Sender<LinkEvent>,
    pub cancel: &'a CancellationToken,
    pub stats: &'a LinkStats,
    pub peer: PeerTag,
    pub via: LinkDirection,
}

impl Session<'_> {
    /// Pump frames in both directions until the stream ends or we are cancelled
    pub(crate) async fn run(mut self, stream: TcpStream) -> SessionEnd {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = framing::split(stream, self.config.max_frame_size);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,

                frame = self.outbox.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Cancelled;
                    };
                    let write = tokio::time::timeout(self.config.write_timeout(), writer.send(frame));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                        res = write => match res {
                            Ok(Ok(())) => {
                                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Err(e)) => return SessionEnd::Closed(format!("write failed: {}", e)),
                            Err(_) => return SessionEnd::Closed("write timed out".to_string()),
                        }
                    }
                }

                frame = reader.recv() => match frame {
                    Ok(Some(bytes)) => {
                        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        match framing::decode(&bytes) {
                            Ok(envelope) => {
                                self.stats.last_seen_ms.store(now_ms(), Ordering::Relaxed);
                                let from = self.peer.observe(&envelope);
                                let event = LinkEvent::Message { from, via: self.via, envelope };
                                if !emit(self.events, self.cancel, event).await {
                                    return SessionEnd::Cancelled;
                                }
                            }
                            Err(e) => {
                                self.stats.frames_malformed.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %e, len = bytes.len(), "Dropping malformed frame");
                            }
                        }
                    }
                    Ok(None) => return SessionEnd::Closed("stream closed by peer".to_string()),
                    Err(e) => return SessionEnd::Closed(format!("read failed: {}", e)),
                },
            }
        }
    }
}

/// Discard frames queued for a connection that has gone away
pub(crate) fn drain(outbox: &mut mpsc::Receiver<Bytes>) -> usize {
    let mut dropped = 0;
    while outbox.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}
