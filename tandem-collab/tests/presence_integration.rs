//! Integration tests for presence over the network.
//!
//! These tests start a real server and connect clients, verifying that
//! presence is broadcast as a full set, survives the join handshake and
//! disappears when its owner leaves.

use std::sync::Arc;
use tandem_collab::{
    ClientConfig, ClientState, PresenceEntry, PresencePayload, ServerConfig, SyncClient,
    SyncEvent, SyncServer,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

/// Start a server on a free port, return it with its base URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    }));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

/// Connect a client and wait until it is live.
async fn connect_client(url: &str, room: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(ClientConfig::new(url, room));
    let events = client.take_event_rx().unwrap();
    client.connect();
    for _ in 0..150 {
        if client.state().await == ClientState::Live {
            return (client, events);
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("client never went live");
}

/// Wait for a presence set satisfying `accept`.
async fn wait_for_presence(
    events: &mut mpsc::Receiver<SyncEvent>,
    accept: impl Fn(&[PresenceEntry]) -> bool,
) -> Vec<PresenceEntry> {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(SyncEvent::PresenceChanged(entries)) if accept(&entries) => return entries,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("presence never arrived")
}

fn cursor_of(entries: &[PresenceEntry], client_id: Uuid) -> Option<usize> {
    let entry = entries.iter().find(|e| e.client_id == client_id)?;
    PresencePayload::decode(&entry.payload).ok()?.cursor
}

#[tokio::test]
async fn test_presence_broadcast_to_peers() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "cursors").await;
    let (_bob, mut bob_events) = connect_client(&url, "cursors").await;

    let payload = PresencePayload::for_client(alice.client_id()).with_cursor(Some(3));
    alice.set_presence(&payload).await.unwrap();

    let entries = wait_for_presence(&mut bob_events, |e| !e.is_empty()).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].client_id, alice.client_id());
    let received = PresencePayload::decode(&entries[0].payload).unwrap();
    assert_eq!(received, payload);
    assert!(received.name.starts_with("User"));
    assert!(received.color.starts_with("hsl("));
}

#[tokio::test]
async fn test_rapid_presence_settles_on_latest() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "burst").await;
    let (_bob, mut bob_events) = connect_client(&url, "burst").await;
    let id = alice.client_id();

    // Many updates inside one throttle interval; the trailing one must win.
    for cursor in 0..20 {
        let payload = PresencePayload::for_client(id).with_cursor(Some(cursor));
        alice.set_presence(&payload).await.unwrap();
    }

    let entries = wait_for_presence(&mut bob_events, |e| cursor_of(e, id) == Some(19)).await;
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_presence_set_before_connect_announced_on_join() {
    let (server, url) = start_test_server().await;
    let (_bob, mut bob_events) = connect_client(&url, "handshake").await;

    let mut alice = SyncClient::new(ClientConfig::new(&url, "handshake"));
    let id = alice.client_id();
    let payload = PresencePayload::for_client(id).with_cursor(Some(7));
    alice.set_presence(&payload).await.unwrap();
    alice.connect();

    let entries = wait_for_presence(&mut bob_events, |e| cursor_of(e, id).is_some()).await;
    assert_eq!(cursor_of(&entries, id), Some(7));
    assert_eq!(server.sessions().presence("handshake").await.unwrap().len(), 1);

    alice.close().await;
}

#[tokio::test]
async fn test_joiner_receives_existing_presence() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "late").await;
    let id = alice.client_id();
    alice
        .set_presence(&PresencePayload::for_client(id).with_cursor(Some(1)))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    // The snapshot carries the current presence set.
    let (_carol, mut carol_events) = connect_client(&url, "late").await;
    let entries = wait_for_presence(&mut carol_events, |e| !e.is_empty()).await;
    assert_eq!(cursor_of(&entries, id), Some(1));
}

#[tokio::test]
async fn test_presence_removed_on_leave() {
    let (server, url) = start_test_server().await;
    let (mut alice, _alice_events) = connect_client(&url, "exit").await;
    let (_bob, mut bob_events) = connect_client(&url, "exit").await;
    let id = alice.client_id();

    alice
        .set_presence(&PresencePayload::for_client(id))
        .await
        .unwrap();
    wait_for_presence(&mut bob_events, |e| !e.is_empty()).await;

    alice.close().await;
    let entries = wait_for_presence(&mut bob_events, |e| e.is_empty()).await;
    assert!(entries.is_empty());
    assert!(server.sessions().presence("exit").await.unwrap().is_empty());
    assert_eq!(server.sessions().client_count("exit").await, 1);
}
