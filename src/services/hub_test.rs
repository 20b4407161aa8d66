use super::*;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;

use crate::message::{BoardSnapshot, DeletePayload, DrawPayload, Payload};
use crate::services::broadcast::Outbound;
use crate::state::test_helpers::{RecordingStore, draw_object, test_session};

fn spawn_hub(store: &Arc<RecordingStore>) -> (HubHandle, PersistenceBatcher) {
    let batcher = PersistenceBatcher::new(store.clone());
    let (hub, _task) = Hub::spawn(store.clone(), batcher.clone(), 64);
    (hub, batcher)
}

async fn recv(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("outbound queue closed")
}

fn assert_empty(rx: &mut mpsc::Receiver<Outbound>) {
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)), "unexpected message queued");
}

fn board(id: &str) -> BoardId {
    BoardId::from(id)
}

fn draw(user_id: Uuid, object_id: &str) -> Message {
    Message::new(board("b1"), user_id, Payload::Draw(DrawPayload { object: draw_object(object_id) }))
}

// =============================================================================
// join / leave
// =============================================================================

#[tokio::test]
async fn join_pushes_one_snapshot_to_the_new_session_only() {
    let store = Arc::new(RecordingStore::new());
    store
        .insert_board("b1", BoardSnapshot { objects: vec![draw_object("a"), draw_object("b")], version: 7 })
        .await;
    let (hub, _batcher) = spawn_hub(&store);

    let (first, mut rx_first) = test_session("b1", Uuid::new_v4(), 8);
    hub.join(first).await.unwrap();
    let _ = recv(&mut rx_first).await;

    let (second, mut rx_second) = test_session("b1", Uuid::new_v4(), 8);
    hub.join(second).await.unwrap();

    let sync = recv(&mut rx_second).await;
    let Payload::Sync(snapshot) = &sync.payload else {
        panic!("expected sync, got {}", sync.kind());
    };
    let ids: Vec<&str> = snapshot.objects.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);
    assert_eq!(snapshot.version, 7);
    assert_eq!(sync.board_id, board("b1"));
    assert!(sync.user_id.is_nil());

    hub.settle().await;
    assert_empty(&mut rx_second);
    assert_empty(&mut rx_first);
}

#[tokio::test]
async fn join_unknown_board_registers_without_sync() {
    let store = Arc::new(RecordingStore::new());
    let (hub, _batcher) = spawn_hub(&store);

    let (session, mut rx) = test_session("fresh", Uuid::new_v4(), 8);
    hub.join(session).await.unwrap();
    hub.settle().await;

    assert_eq!(hub.online_count(&board("fresh")).await, 1);
    assert_empty(&mut rx);
}

#[tokio::test]
async fn join_empty_board_still_gets_a_sync() {
    let store = Arc::new(RecordingStore::new());
    store.insert_board("b1", BoardSnapshot::default()).await;
    let (hub, _batcher) = spawn_hub(&store);

    let (session, mut rx) = test_session("b1", Uuid::new_v4(), 8);
    hub.join(session).await.unwrap();

    let sync = recv(&mut rx).await;
    assert_eq!(sync.payload, Payload::Sync(BoardSnapshot::default()));
    assert_eq!(hub.online_count(&board("b1")).await, 1);
}

#[tokio::test]
async fn last_leave_releases_the_board_and_leave_is_idempotent() {
    let store = Arc::new(RecordingStore::new());
    let (hub, _batcher) = spawn_hub(&store);
    let (a, _rx_a) = test_session("b1", Uuid::new_v4(), 8);
    let (b, _rx_b) = test_session("b1", Uuid::new_v4(), 8);
    let (a_id, b_id) = (a.session_id, b.session_id);
    hub.join(a).await.unwrap();
    hub.join(b).await.unwrap();
    assert_eq!(hub.online_count(&board("b1")).await, 2);
    assert_eq!(hub.active_boards().await, 1);

    assert!(hub.leave(board("b1"), a_id).await.unwrap());
    assert_eq!(hub.online_count(&board("b1")).await, 1);

    assert!(hub.leave(board("b1"), b_id).await.unwrap());
    assert_eq!(hub.online_count(&board("b1")).await, 0);
    assert_eq!(hub.active_boards().await, 0);

    assert!(!hub.leave(board("b1"), b_id).await.unwrap());
    assert!(!hub.leave(board("never"), Uuid::new_v4()).await.unwrap());
}

#[tokio::test]
async fn leave_closes_the_outbound_queue() {
    let store = Arc::new(RecordingStore::new());
    let (hub, _batcher) = spawn_hub(&store);
    let (session, mut rx) = test_session("b1", Uuid::new_v4(), 8);
    let session_id = session.session_id;
    hub.join(session).await.unwrap();

    hub.leave(board("b1"), session_id).await.unwrap();

    let closed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn online_count_is_zero_for_unknown_board() {
    let (hub, _batcher) = spawn_hub(&Arc::new(RecordingStore::new()));
    assert_eq!(hub.online_count(&board("nobody-here")).await, 0);
}

// =============================================================================
// route
// =============================================================================

#[tokio::test]
async fn draw_reaches_every_session_including_sender_and_is_queued() {
    let store = Arc::new(RecordingStore::new());
    let (hub, batcher) = spawn_hub(&store);
    let alice = Uuid::new_v4();
    let (a, mut rx_a) = test_session("b1", alice, 8);
    let (b, mut rx_b) = test_session("b1", Uuid::new_v4(), 8);
    let a_id = a.session_id;
    hub.join(a).await.unwrap();
    hub.join(b).await.unwrap();

    hub.route(a_id, draw(alice, "x1")).await.unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let msg = recv(rx).await;
        assert_eq!(msg.kind(), "draw");
        assert_eq!(msg.user_id, alice);
    }
    assert_eq!(batcher.pending_count(&board("b1")), 1);
}

#[tokio::test]
async fn draws_stay_on_their_board() {
    let store = Arc::new(RecordingStore::new());
    let (hub, _batcher) = spawn_hub(&store);
    let alice = Uuid::new_v4();
    let (a, mut rx_a) = test_session("b1", alice, 8);
    let (other, mut rx_other) = test_session("b2", Uuid::new_v4(), 8);
    let a_id = a.session_id;
    hub.join(a).await.unwrap();
    hub.join(other).await.unwrap();

    hub.route(a_id, draw(alice, "x1")).await.unwrap();
    let _ = recv(&mut rx_a).await;
    hub.settle().await;

    assert_empty(&mut rx_other);
}

#[tokio::test]
async fn relay_is_not_echoed_to_sender() {
    let store = Arc::new(RecordingStore::new());
    let (hub, _batcher) = spawn_hub(&store);
    let alice = Uuid::new_v4();
    let (a, mut rx_a) = test_session("b1", alice, 8);
    let (b, mut rx_b) = test_session("b1", Uuid::new_v4(), 8);
    let a_id = a.session_id;
    hub.join(a).await.unwrap();
    hub.join(b).await.unwrap();

    let cursor = Payload::Relay { kind: "cursor".into(), body: json!({"x": 3, "y": 4}) };
    hub.route(a_id, Message::new(board("b1"), alice, cursor)).await.unwrap();

    let msg = recv(&mut rx_b).await;
    assert_eq!(msg.kind(), "cursor");
    hub.settle().await;
    assert_empty(&mut rx_a);
}

#[tokio::test]
async fn delete_and_clear_fan_out_to_all() {
    let store = Arc::new(RecordingStore::new());
    store
        .insert_board("b1", BoardSnapshot { objects: vec![draw_object("a")], version: 1 })
        .await;
    let (hub, _batcher) = spawn_hub(&store);
    let alice = Uuid::new_v4();
    let (a, mut rx_a) = test_session("b1", alice, 8);
    let a_id = a.session_id;
    hub.join(a).await.unwrap();
    let _ = recv(&mut rx_a).await;

    let delete = Payload::Delete(DeletePayload { object_id: "a".into() });
    hub.route(a_id, Message::new(board("b1"), alice, delete)).await.unwrap();
    hub.route(a_id, Message::new(board("b1"), alice, Payload::Clear)).await.unwrap();

    assert_eq!(recv(&mut rx_a).await.kind(), "delete");
    assert_eq!(recv(&mut rx_a).await.kind(), "clear");
    assert!(store.object_ids("b1").await.is_empty());
}

#[tokio::test]
async fn sync_request_answers_the_requester_only() {
    let store = Arc::new(RecordingStore::new());
    store
        .insert_board("b1", BoardSnapshot { objects: vec![draw_object("a")], version: 3 })
        .await;
    let (hub, _batcher) = spawn_hub(&store);
    let alice = Uuid::new_v4();
    let (a, mut rx_a) = test_session("b1", alice, 8);
    let (b, mut rx_b) = test_session("b1", Uuid::new_v4(), 8);
    let a_id = a.session_id;
    hub.join(a).await.unwrap();
    hub.join(b).await.unwrap();
    let _ = recv(&mut rx_a).await;
    let _ = recv(&mut rx_b).await;

    hub.route(a_id, Message::new(board("b1"), alice, Payload::SyncRequest)).await.unwrap();

    let sync = recv(&mut rx_a).await;
    let Payload::Sync(snapshot) = &sync.payload else {
        panic!("expected sync, got {}", sync.kind());
    };
    assert_eq!(snapshot.version, 3);
    hub.settle().await;
    assert_empty(&mut rx_b);
}

#[tokio::test]
async fn message_for_board_without_sessions_is_dropped() {
    let store = Arc::new(RecordingStore::new());
    let (hub, batcher) = spawn_hub(&store);

    hub.route(Uuid::new_v4(), draw(Uuid::new_v4(), "x1")).await.unwrap();
    hub.settle().await;

    // Side effects still run; only delivery is skipped.
    assert_eq!(batcher.pending_count(&board("b1")), 1);
    assert_eq!(hub.active_boards().await, 0);
}

// =============================================================================
// backpressure
// =============================================================================

#[tokio::test]
async fn full_queue_unregisters_only_the_slow_session() {
    let store = Arc::new(RecordingStore::new());
    let (hub, _batcher) = spawn_hub(&store);
    let alice = Uuid::new_v4();
    let (slow, mut rx_slow) = test_session("b1", Uuid::new_v4(), 256);
    let (fast, mut rx_fast) = test_session("b1", alice, 512);
    let fast_id = fast.session_id;
    hub.join(slow).await.unwrap();
    hub.join(fast).await.unwrap();

    for i in 0..256 {
        hub.route(fast_id, draw(alice, &format!("o{i}"))).await.unwrap();
    }
    hub.settle().await;
    assert_eq!(hub.online_count(&board("b1")).await, 2);

    hub.route(fast_id, draw(alice, "overflow")).await.unwrap();
    hub.settle().await;

    assert_eq!(hub.online_count(&board("b1")).await, 1);
    assert_eq!(rx_fast.len(), 257);

    // The slow peer keeps its backlog, then sees the queue close.
    let mut drained = 0;
    while rx_slow.recv().await.is_some() {
        drained += 1;
    }
    assert_eq!(drained, 256);
}

#[tokio::test]
async fn evicting_the_last_session_releases_the_board() {
    let store = Arc::new(RecordingStore::new());
    let (hub, _batcher) = spawn_hub(&store);
    let alice = Uuid::new_v4();
    let (only, rx_only) = test_session("b1", alice, 8);
    let only_id = only.session_id;
    hub.join(only).await.unwrap();
    drop(rx_only);

    hub.route(only_id, draw(alice, "x1")).await.unwrap();
    hub.settle().await;

    assert_eq!(hub.online_count(&board("b1")).await, 0);
    assert_eq!(hub.active_boards().await, 0);
}

// =============================================================================
// lifecycle
// =============================================================================

#[tokio::test]
async fn calls_fail_once_the_control_loop_is_gone() {
    let store = Arc::new(RecordingStore::new());
    let batcher = PersistenceBatcher::new(store.clone());
    let (hub, task) = Hub::spawn(store, batcher, 4);
    task.abort();
    let _ = task.await;

    let (session, _rx) = test_session("b1", Uuid::new_v4(), 8);
    assert!(matches!(hub.join(session).await, Err(HubError::Closed)));
    assert!(matches!(hub.route(Uuid::new_v4(), draw(Uuid::new_v4(), "x")).await, Err(HubError::Closed)));
}
