//! Node coordinator
//!
//! [`NodeCoordinator`] ties the pieces together: it binds the peer server,
//! dials every configured peer, routes inbound envelopes to the reconciler
//! and backfill, and sends heartbeats. A node with no peers runs standalone
//! and starts nothing.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use parkmesh_core::{Envelope, EventId, EventStore, Message, ProtocolError, now_ms};
use parkmesh_transport::{LinkEvent, PeerLink, PeerServer};

use crate::backfill::Backfill;
use crate::config::MeshConfig;
use crate::error::{NodeError, NodeResult};
use crate::hooks::{NoopHooks, SyncHooks};
use crate::local::LocalEvents;
use crate::mesh::{Mesh, PeerStatus};
use crate::reconciler::Reconciler;

/// Snapshot of a running (or stopped) node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub this_node_id: String,
    pub standalone: bool,
    pub running: bool,
    pub peers: Vec<PeerStatus>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// One central node's view of the mesh
pub struct NodeCoordinator {
    config: MeshConfig,
    store: Arc<dyn EventStore>,
    mesh: Arc<Mesh>,
    reconciler: Arc<Reconciler>,
    backfill: Arc<Backfill>,
    tracker: TaskTracker,
    shutdown_tx: broadcast::Sender<()>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl NodeCoordinator {
    /// Create a coordinator over `store`. Nothing runs until [`start`](Self::start).
    pub fn new(config: MeshConfig, store: Arc<dyn EventStore>) -> NodeResult<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let hooks: Arc<dyn SyncHooks> = Arc::new(NoopHooks);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            hooks,
            config.buffer_orphan_exits,
        ));
        let backfill = Arc::new(Backfill::new(
            config.node_id(),
            store.clone(),
            reconciler.clone(),
            config.watermark_policy,
        ));

        Ok(Self {
            config,
            store,
            mesh: Arc::new(Mesh::new()),
            reconciler,
            backfill,
            tracker: TaskTracker::new(),
            shutdown_tx,
            background_tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Replace the application hooks. Call before [`start`](Self::start).
    pub fn with_hooks(mut self, hooks: Arc<dyn SyncHooks>) -> Self {
        self.reconciler = Arc::new(Reconciler::new(
            self.store.clone(),
            hooks,
            self.config.buffer_orphan_exits,
        ));
        self.backfill = Arc::new(Backfill::new(
            self.config.node_id(),
            self.store.clone(),
            self.reconciler.clone(),
            self.config.watermark_policy,
        ));
        self
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        self.config.node_id()
    }

    /// Bind, dial peers and spawn the dispatch and heartbeat tasks
    #[instrument(skip(self), fields(node_id = %self.config.node_id()))]
    pub async fn start(&self) -> NodeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }

        if self.config.is_standalone() {
            info!("No peers configured, running standalone");
            return Ok(());
        }

        let transport = self.config.transport_config();
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity);

        let listen_addr = self.config.this_node.listen_addr();
        let server = match PeerServer::bind(&listen_addr, transport.clone(), events_tx.clone(), &self.tracker).await {
            Ok(server) => server,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        self.mesh.set_server(server);

        for peer in &self.config.peers {
            let link = PeerLink::spawn(
                peer.node_id.clone(),
                peer.addr(),
                transport.clone(),
                events_tx.clone(),
                &self.tracker,
            );
            self.mesh.add_link(link);
        }
        drop(events_tx);

        let dispatcher = Dispatcher {
            node_id: self.config.node_id().to_string(),
            mesh: self.mesh.clone(),
            reconciler: self.reconciler.clone(),
            backfill: self.backfill.clone(),
        };
        let dispatch_task = self
            .tracker
            .spawn(dispatcher.run(events_rx, self.shutdown_tx.subscribe()));

        let heartbeat_task = self.tracker.spawn(heartbeat_loop(
            self.config.node_id().to_string(),
            self.mesh.clone(),
            self.config.heartbeat_interval(),
            self.shutdown_tx.subscribe(),
        ));

        {
            let mut tasks = self.background_tasks.lock();
            tasks.push(dispatch_task);
            tasks.push(heartbeat_task);
        }

        info!(
            addr = ?self.mesh.local_addr(),
            peers = self.config.peers.len(),
            "Node started"
        );
        Ok(())
    }

    /// Stop every task and close every socket. Safe to call repeatedly.
    #[instrument(skip(self), fields(node_id = %self.config.node_id()))]
    pub async fn stop(&self) -> NodeResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(());
        self.mesh.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        info!("Node stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Tasks still owned by this node; zero once stopped
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Address the peer server is bound to, while running with peers
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mesh.local_addr()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            this_node_id: self.config.node_id().to_string(),
            standalone: self.config.is_standalone(),
            running: self.is_started(),
            peers: self.mesh.peer_statuses(),
            messages_sent: self.mesh.messages_sent(),
            messages_received: self.mesh.messages_received(),
        }
    }

    /// Handle for recording events observed at this node
    pub fn local_events(&self) -> LocalEvents {
        LocalEvents::new(
            self.config.node_id(),
            self.store.clone(),
            self.reconciler.clone(),
            self.mesh.clone(),
        )
    }

    /// Send an envelope to every connected peer
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.mesh.broadcast(envelope)
    }

    pub fn send_to_peer(&self, node_id: &str, envelope: &Envelope) -> bool {
        self.mesh.send_to_peer(node_id, envelope)
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }
}

/// Routes link events from the transport to reconciliation and backfill
struct Dispatcher {
    node_id: String,
    mesh: Arc<Mesh>,
    reconciler: Arc<Reconciler>,
    backfill: Arc<Backfill>,
}

impl Dispatcher {
    async fn run(self, mut events: mpsc::Receiver<LinkEvent>, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Dispatch started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }
        debug!("Dispatch stopped");
    }

    /// Handle one event. A panicking handler or hook drops that event only.
    async fn dispatch(&self, event: LinkEvent) {
        if let Err(panic) = AssertUnwindSafe(self.handle_event(event)).catch_unwind().await {
            error!(panic = %panic_message(panic.as_ref()), "Handler panicked, event dropped");
        }
    }

    async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { node_id } => {
                info!(peer = %node_id, "Peer connected");
                if let Err(e) = self.request_backfill(&node_id).await {
                    error!(peer = %node_id, error = %e, "Failed to request backfill");
                }
            }
            LinkEvent::Disconnected { node_id } => {
                info!(peer = %node_id, "Peer disconnected");
                if let Err(e) = self.backfill.on_peer_disconnected(&node_id).await {
                    error!(peer = %node_id, error = %e, "Failed to update watermark");
                }
            }
            LinkEvent::Message { from, via, envelope } => {
                let source = envelope.source_node_id().to_string();
                if source == self.node_id {
                    debug!("Ignoring envelope from self");
                    return;
                }
                if let Some(link_peer) = &from {
                    if *link_peer != source {
                        warn!(link = %link_peer, source = %source, "Envelope source differs from link peer");
                    }
                }
                self.mesh.record_received(&source, now_ms());
                if let Err(e) = self.handle_message(&envelope).await {
                    error!(
                        peer = %source,
                        kind = %envelope.kind(),
                        via = ?via,
                        error = %e,
                        "Failed to handle message"
                    );
                }
            }
        }
    }

    async fn request_backfill(&self, peer: &str) -> NodeResult<()> {
        let request = self.backfill.on_peer_connected(peer).await?;
        if !self.mesh.send_to_peer(peer, &request) {
            warn!(peer = %peer, "Backfill request not sent");
        }
        Ok(())
    }

    async fn handle_message(&self, envelope: &Envelope) -> NodeResult<()> {
        let source = envelope.source_node_id();
        match envelope.message() {
            Message::EntryPending(payload) => {
                let event_id = lifecycle_id(envelope)?;
                self.reconciler.apply_entry(source, event_id, payload).await?;
            }
            Message::EntryConfirmed(_) => {
                self.reconciler.apply_confirmed(lifecycle_id(envelope)?).await?;
            }
            Message::Exit(payload) => {
                let event_id = lifecycle_id(envelope)?;
                self.reconciler.apply_exit(event_id, payload).await?;
            }
            Message::Heartbeat(payload) => {
                debug!(peer = %source, timestamp = payload.timestamp, "Heartbeat");
            }
            Message::SyncRequest(payload) => {
                let response = self
                    .backfill
                    .handle_sync_request(source, payload.since_timestamp)
                    .await?;
                if !self.mesh.send_to_peer(source, &response) {
                    warn!(peer = %source, "Backfill response not sent");
                }
            }
            Message::SyncResponse(payload) => {
                let summary = self.backfill.handle_sync_response(source, &payload.events).await?;
                if let Some(since) = summary.next_since {
                    debug!(peer = %source, since, "Requesting next backfill page");
                    self.mesh
                        .send_to_peer(source, &Envelope::sync_request(&self.node_id, since));
                }
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn lifecycle_id(envelope: &Envelope) -> NodeResult<&EventId> {
    envelope
        .event_id()
        .ok_or_else(|| NodeError::from(ProtocolError::MissingEventId(envelope.kind().to_string())))
}

async fn heartbeat_loop(
    node_id: String,
    mesh: Arc<Mesh>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let sent = mesh.broadcast(&Envelope::heartbeat(&node_id, now_ms()));
                debug!(sent, "Heartbeat sent");
            }
        }
    }
}
