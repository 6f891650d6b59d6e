//! Integration tests for parkmesh-transport
//!
//! Two in-process endpoints wired over loopback TCP.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use parkmesh_core::{EntryPayload, Envelope, EventId, Message};
use parkmesh_transport::{LinkDirection, LinkEvent, PeerLink, PeerServer, TransportConfig};

fn fast_config() -> TransportConfig {
    TransportConfig::default()
        .with_reconnect_backoff(Duration::from_millis(25))
        .with_connect_timeout(Duration::from_millis(250))
}

async fn next_message(rx: &mut mpsc::Receiver<LinkEvent>) -> (Option<String>, LinkDirection, Envelope) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("event channel closed");
        if let LinkEvent::Message { from, via, envelope } = event {
            return (from, via, envelope);
        }
    }
}

fn entry(node: &str, ts: i64, plate: &str) -> Envelope {
    Envelope::entry_pending(
        node,
        EventId::generate(node, plate, ts),
        EntryPayload {
            plate_id: plate.to_string(),
            plate_view: plate.to_string(),
            edge_id: "edge-1".to_string(),
            camera_type: "car".to_string(),
            direction: "ENTRY".to_string(),
            entry_time: "2025-12-02 10:30:00".to_string(),
        },
    )
}

#[tokio::test]
async fn test_link_to_server_round_trip() {
    let tracker = TaskTracker::new();

    let (server_tx, mut server_rx) = mpsc::channel(64);
    let server = PeerServer::bind("127.0.0.1:0", fast_config(), server_tx, &tracker)
        .await
        .unwrap();

    let (link_tx, mut link_rx) = mpsc::channel(64);
    let link = PeerLink::spawn(
        "server-node",
        server.local_addr().to_string(),
        fast_config(),
        link_tx,
        &tracker,
    );

    match tokio::time::timeout(Duration::from_secs(5), link_rx.recv()).await.unwrap() {
        Some(LinkEvent::Connected { node_id }) => assert_eq!(node_id, "server-node"),
        other => panic!("expected connect, got {other:?}"),
    }

    // Outbound to inbound
    let sent = entry("client-node", 1_000, "29A12345");
    assert!(link.send(&sent));
    let (from, via, got) = next_message(&mut server_rx).await;
    assert_eq!(from.as_deref(), Some("client-node"));
    assert_eq!(via, LinkDirection::Inbound);
    assert_eq!(got, sent);

    // Reply on the inbound side reaches the dialer
    let reply = Envelope::sync_request("server-node", 42);
    assert!(server.send_frame_to(
        "client-node",
        parkmesh_transport::framing::encode(&reply).unwrap()
    ));
    let (from, via, got) = next_message(&mut link_rx).await;
    assert_eq!(from.as_deref(), Some("server-node"));
    assert_eq!(via, LinkDirection::Outbound);
    assert!(matches!(got.message(), Message::SyncRequest(p) if p.since_timestamp == 42));

    link.stop().await;
    server.stop().await;
    assert_eq!(tracker.len(), 0);
}

#[tokio::test]
async fn test_frames_arrive_in_send_order() {
    let tracker = TaskTracker::new();
    let (server_tx, mut server_rx) = mpsc::channel(256);
    let server = PeerServer::bind("127.0.0.1:0", fast_config(), server_tx, &tracker)
        .await
        .unwrap();
    let (link_tx, mut link_rx) = mpsc::channel(16);
    let link = PeerLink::spawn("s", server.local_addr().to_string(), fast_config(), link_tx, &tracker);
    assert!(matches!(link_rx.recv().await, Some(LinkEvent::Connected { .. })));

    for i in 0..100 {
        assert!(link.send(&Envelope::heartbeat("c", i)));
    }
    for i in 0..100 {
        let (_, _, got) = next_message(&mut server_rx).await;
        assert_eq!(got, Envelope::heartbeat("c", i));
    }

    link.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_link_reconnects_when_server_restarts() {
    let tracker = TaskTracker::new();
    let (server_tx, _server_rx) = mpsc::channel(64);
    let server = PeerServer::bind("127.0.0.1:0", fast_config(), server_tx.clone(), &tracker)
        .await
        .unwrap();
    let addr = server.local_addr();

    let (link_tx, mut link_rx) = mpsc::channel(64);
    let link = PeerLink::spawn("s", addr.to_string(), fast_config(), link_tx, &tracker);
    assert!(matches!(link_rx.recv().await, Some(LinkEvent::Connected { .. })));

    server.stop().await;
    match tokio::time::timeout(Duration::from_secs(5), link_rx.recv()).await.unwrap() {
        Some(LinkEvent::Disconnected { node_id }) => assert_eq!(node_id, "s"),
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert!(!link.send(&Envelope::heartbeat("c", 1)));

    let server = PeerServer::bind(&addr.to_string(), fast_config(), server_tx, &tracker)
        .await
        .unwrap();
    match tokio::time::timeout(Duration::from_secs(5), link_rx.recv()).await.unwrap() {
        Some(LinkEvent::Connected { .. }) => {}
        other => panic!("expected reconnect, got {other:?}"),
    }
    assert!(link.is_connected());
    assert!(link.stats().connects >= 2);

    link.stop().await;
    server.stop().await;
    assert_eq!(tracker.len(), 0);
}
