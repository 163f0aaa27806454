//! Session-level scenarios, run in-process against a `SessionManager`.
//!
//! Each `Peer` stands in for a connected client: it owns a local replica
//! and the receiving end of its outbound queue, exactly what a server
//! connection task would forward over the socket.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_collab::{
    ClientHandle, CollabError, EditOp, MessageType, Outbound, RoomEvent, SessionConfig,
    SessionManager, SyncMessage,
};
use tandem_core::{decode_update, encode_update, Document, ReplicaId};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

struct Peer {
    id: Uuid,
    doc: Document,
    rx: mpsc::Receiver<Outbound>,
}

impl Peer {
    async fn join(sessions: &SessionManager, room: &str, capacity: usize) -> Self {
        let id = Uuid::new_v4();
        let (handle, rx) = ClientHandle::new(id, capacity);
        let response = sessions.join_room(room, handle).await.unwrap();
        let mut doc = Document::with_replica(ReplicaId::from_uuid(id));
        doc.merge_update(&response.snapshot);
        Self { id, doc, rx }
    }

    /// Local edit, then hand the frame to the session like a socket would.
    async fn type_at(&mut self, sessions: &SessionManager, room: &str, index: usize, text: &str) {
        let frame = encode_update(&self.doc.insert_at(index, text)).unwrap();
        sessions.on_remote_update(room, &self.id, &frame).await.unwrap();
    }

    /// Merge every update currently queued for this peer.
    fn pump(&mut self) -> usize {
        let mut merged = 0;
        while let Ok(bytes) = self.rx.try_recv() {
            let msg = SyncMessage::decode(&bytes).unwrap();
            if msg.msg_type == MessageType::Update {
                self.doc.merge_update(&decode_update(&msg.payload).unwrap());
                merged += 1;
            }
        }
        merged
    }
}

#[tokio::test]
async fn test_join_empty_room_gets_empty_snapshot() {
    let sessions = SessionManager::with_defaults();
    let peer = Peer::join(&sessions, "empty", 16).await;
    assert_eq!(peer.doc.to_visible_text(), "");
    assert_eq!(sessions.text("empty").await.unwrap(), "");
}

#[tokio::test]
async fn test_typed_text_visible_to_next_joiner() {
    let sessions = SessionManager::with_defaults();
    let mut alice = Peer::join(&sessions, "room", 16).await;
    alice.type_at(&sessions, "room", 0, "hi").await;

    let bob = Peer::join(&sessions, "room", 16).await;
    assert_eq!(bob.doc.to_visible_text(), "hi");
}

#[tokio::test]
async fn test_concurrent_edits_converge_through_server() {
    let sessions = SessionManager::with_defaults();
    let mut alice = Peer::join(&sessions, "room", 64).await;
    let mut bob = Peer::join(&sessions, "room", 64).await;

    // Both type before seeing each other's edits.
    let from_alice = encode_update(&alice.doc.insert_at(0, "ab")).unwrap();
    let from_bob = encode_update(&bob.doc.insert_at(0, "xy")).unwrap();
    sessions.on_remote_update("room", &bob.id, &from_bob).await.unwrap();
    sessions.on_remote_update("room", &alice.id, &from_alice).await.unwrap();

    alice.pump();
    bob.pump();

    let server_text = sessions.text("room").await.unwrap();
    assert_eq!(server_text.len(), 4);
    assert_eq!(alice.doc.to_visible_text(), server_text);
    assert_eq!(bob.doc.to_visible_text(), server_text);
}

#[tokio::test]
async fn test_reconnect_after_foreign_edits_resyncs() {
    let sessions = SessionManager::with_defaults();
    let mut writer = Peer::join(&sessions, "room", 64).await;
    writer.type_at(&sessions, "room", 0, "base").await;

    let mut roamer = Peer::join(&sessions, "room", 64).await;
    assert_eq!(roamer.doc.to_visible_text(), "base");
    sessions.leave_room("room", &roamer.id).await.unwrap();

    // Five edits happen while the roamer is away; it also types offline.
    for i in 0..5 {
        let end = writer.doc.visible_len();
        writer.type_at(&sessions, "room", end, &format!(" {i}")).await;
    }
    let offline = roamer.doc.insert_at(0, ">");

    // Rejoin with an empty state vector: full snapshot.
    let (handle, rx) = ClientHandle::new(roamer.id, 64);
    roamer.rx = rx;
    let response = sessions.join_room("room", handle).await.unwrap();
    roamer.doc.merge_update(&response.snapshot);
    assert_eq!(roamer.doc.to_visible_text(), format!(">{}", sessions.text("room").await.unwrap()));

    // Push what the server lacks.
    let lacking = tandem_core::diff_since(&roamer.doc, &response.state_vector);
    assert_eq!(lacking.items.len(), offline.items.len());
    sessions
        .on_remote_update("room", &roamer.id, &encode_update(&lacking).unwrap())
        .await
        .unwrap();

    writer.pump();
    assert_eq!(sessions.text("room").await.unwrap(), ">base 0 1 2 3 4");
    assert_eq!(writer.doc.to_visible_text(), sessions.text("room").await.unwrap());
    assert_eq!(roamer.doc.to_visible_text(), sessions.text("room").await.unwrap());
}

#[tokio::test]
async fn test_late_cleanup_of_old_connection_keeps_rejoined_client() {
    let sessions = SessionManager::with_defaults();
    let mut writer = Peer::join(&sessions, "room", 64).await;
    let mut roamer = Peer::join(&sessions, "room", 64).await;
    let (old_handle, old_rx) = ClientHandle::new(roamer.id, 64);
    let old_connection = old_handle.connection;
    // Replace the handle Peer::join registered with one whose token we hold.
    sessions.join_room("room", old_handle).await.unwrap();
    roamer.rx = old_rx;

    // Reconnect with the same client id; the old socket has not noticed yet.
    let (handle, rx) = ClientHandle::new(roamer.id, 64);
    roamer.rx = rx;
    let response = sessions.join_room("room", handle).await.unwrap();
    roamer.doc.merge_update(&response.snapshot);

    // The old connection task finally runs its cleanup.
    sessions
        .leave_connection("room", &roamer.id, old_connection)
        .await
        .unwrap();
    assert_eq!(sessions.client_count("room").await, 2);

    writer.type_at(&sessions, "room", 0, "still here").await;
    assert_eq!(roamer.pump(), 1);
    assert_eq!(roamer.doc.to_visible_text(), "still here");
}

#[tokio::test]
async fn test_update_not_ranked_above_origin_rejected() {
    let sessions = SessionManager::with_defaults();
    let mut author = Peer::join(&sessions, "room", 16).await;
    let mut watcher = Peer::join(&sessions, "room", 16).await;
    author.type_at(&sessions, "room", 0, "ab").await;

    // A forged item anchored after a later item than itself.
    let mut forger = Document::with_replica(ReplicaId(42));
    forger.merge_update(&decode_update(&encode_update(&author.doc.snapshot()).unwrap()).unwrap());
    let mut update = forger.insert_at(2, "x");
    let last = author.doc.id_at(1).unwrap();
    update.items[0].origin = Some(tandem_core::ItemId::new(last.replica, last.counter + 10));
    let frame = encode_update(&update).unwrap();

    let result = sessions.on_remote_update("room", &author.id, &frame).await;
    assert!(matches!(result, Err(CollabError::MalformedUpdate(_))));
    assert_eq!(sessions.text("room").await.unwrap(), "ab");
    watcher.pump();
    assert_eq!(watcher.doc.to_visible_text(), "ab");
}

#[tokio::test]
async fn test_malformed_update_affects_only_sender() {
    let sessions = SessionManager::with_defaults();
    let mut good = Peer::join(&sessions, "room", 16).await;
    let bad = Peer::join(&sessions, "room", 16).await;
    let mut watcher = Peer::join(&sessions, "room", 16).await;

    good.type_at(&sessions, "room", 0, "fine").await;
    let result = sessions.on_remote_update("room", &bad.id, b"\x01garbage").await;
    assert!(matches!(result, Err(CollabError::MalformedUpdate(_))));

    // The server connection would now drop `bad`; everyone else carries on.
    sessions.leave_room("room", &bad.id).await.unwrap();
    good.type_at(&sessions, "room", 4, "!").await;

    watcher.pump();
    assert_eq!(watcher.doc.to_visible_text(), "fine!");
    assert_eq!(sessions.text("room").await.unwrap(), "fine!");
    assert_eq!(sessions.client_count("room").await, 2);
}

#[tokio::test]
async fn test_slow_consumer_evicted_others_unaffected() {
    let sessions = SessionManager::with_defaults();
    let mut author = Peer::join(&sessions, "room", 64).await;
    let mut slow = Peer::join(&sessions, "room", 2).await;
    let mut fast = Peer::join(&sessions, "room", 64).await;

    for i in 0..5 {
        let end = author.doc.visible_len();
        author.type_at(&sessions, "room", end, &i.to_string()).await;
    }

    // The slow client's queue was closed after the messages it could hold.
    assert_eq!(slow.pump(), 2);
    assert!(slow.rx.recv().await.is_none());
    assert_eq!(sessions.client_count("room").await, 2);

    assert_eq!(fast.pump(), 5);
    assert_eq!(fast.doc.to_visible_text(), "01234");

    let stats = sessions.broadcast_stats("room").await.unwrap();
    assert_eq!(stats.clients_evicted, 1);

    // Its connection task then leaves; the room survives.
    sessions.leave_room("room", &slow.id).await.unwrap();
    assert_eq!(sessions.room_count().await, 1);
}

#[tokio::test]
async fn test_presence_expires_via_sweeper() {
    let config = SessionConfig {
        presence_ttl: Duration::from_millis(60),
        sweep_interval: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    let sessions = SessionManager::new(config);
    let peer = Peer::join(&sessions, "room", 16).await;
    let mut events = sessions.subscribe("room").await.unwrap();

    sessions.set_presence("room", &peer.id, b"cursor".to_vec()).await.unwrap();
    assert_eq!(sessions.presence("room").await.unwrap().len(), 1);

    // First the set, then the expiry.
    let mut saw_empty = false;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(RoomEvent::PresenceChanged(entries))) if entries.is_empty() => {
                saw_empty = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_empty, "presence never expired");
    assert!(sessions.presence("room").await.unwrap().is_empty());
    // Expiry removes presence only; the client is still connected.
    assert_eq!(sessions.client_count("room").await, 1);
}

#[tokio::test]
async fn test_leave_broadcasts_presence_removal() {
    let sessions = SessionManager::with_defaults();
    let leaver = Peer::join(&sessions, "room", 16).await;
    let mut stayer = Peer::join(&sessions, "room", 16).await;
    sessions.set_presence("room", &leaver.id, vec![1]).await.unwrap();
    let _ = stayer.rx.recv().await.unwrap();

    sessions.leave_room("room", &leaver.id).await.unwrap();

    let msg = SyncMessage::decode(&stayer.rx.recv().await.unwrap()).unwrap();
    assert_eq!(msg.msg_type, MessageType::PresenceSet);
    assert!(msg.presence_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_local_edit_events_for_presentation_layer() {
    let sessions = SessionManager::with_defaults();
    let mut viewer = Peer::join(&sessions, "room", 16).await;
    let mut events = sessions.subscribe("room").await.unwrap();
    let host = Uuid::new_v4();

    sessions
        .on_local_edit("room", &host, EditOp::Replace { text: "let x = 1;".into() })
        .await
        .unwrap();
    sessions
        .on_local_edit("room", &host, EditOp::Delete { index: 8, len: 1 })
        .await
        .unwrap();

    let mut texts = Vec::new();
    while let Ok(Ok(RoomEvent::Applied { text, .. })) =
        timeout(Duration::from_millis(100), events.recv()).await
    {
        texts.push(text);
    }
    assert_eq!(texts, vec!["let x = 1;".to_string(), "let x = ;".to_string()]);

    viewer.pump();
    assert_eq!(viewer.doc.to_visible_text(), "let x = ;");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let sessions = SessionManager::with_defaults();
    let mut a = Peer::join(&sessions, "one", 16).await;
    let mut b = Peer::join(&sessions, "two", 16).await;

    a.type_at(&sessions, "one", 0, "only here").await;
    assert_eq!(b.pump(), 0);
    assert_eq!(sessions.text("two").await.unwrap(), "");
    assert_eq!(sessions.room_count().await, 2);
    assert_eq!(a.pump(), 0);
}

#[tokio::test]
async fn test_concurrent_join_leave_keeps_registry_consistent() {
    let sessions = Arc::new(SessionManager::with_defaults());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let sessions = sessions.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let id = Uuid::new_v4();
                let (handle, _rx) = ClientHandle::new(id, 4);
                sessions.join_room("busy", handle).await.unwrap();
                tokio::task::yield_now().await;
                sessions.leave_room("busy", &id).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(sessions.room_count().await, 0);
}
