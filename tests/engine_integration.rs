//! End-to-end tests through the public SessionManager API.
//!
//! These drive the full pipeline: join (auth + room creation), operation
//! submission (codec + OT + revision log), broadcast fan-out, presence,
//! checkpointing, and reconnect replay.

use std::sync::Arc;
use std::time::Duration;

use collabdocs_engine::op::OpKind;
use collabdocs_engine::presence::CursorState;
use collabdocs_engine::protocol::{OperationPayload, ServerEvent};
use collabdocs_engine::session::{JoinGrant, SessionManager};
use collabdocs_engine::store::{MemoryStore, StaticAuth};
use collabdocs_engine::transform;
use collabdocs_engine::EngineConfig;
use tokio::time::timeout;
use uuid::Uuid;

fn test_config() -> EngineConfig {
    EngineConfig {
        tick_interval_ms: 10,
        checkpoint_idle_secs: 3600,
        checkpoint_revision_threshold: 1000,
        checkpoint_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

fn build_manager(store: Arc<MemoryStore>, config: EngineConfig) -> Arc<SessionManager> {
    let auth = Arc::new(
        StaticAuth::new()
            .with_token("alice", Uuid::from_bytes([0xa; 16]))
            .with_token("bob", Uuid::from_bytes([0xb; 16]))
            .with_token("carol", Uuid::from_bytes([0xc; 16])),
    );
    SessionManager::new(config, auth, store)
}

fn insert(base: u64, position: u64, content: &str) -> OperationPayload {
    OperationPayload {
        base_revision: base,
        kind: OpKind::Insert { position, content: content.into() },
        client_op_id: Uuid::new_v4(),
    }
}

fn delete(base: u64, position: u64, length: u64) -> OperationPayload {
    OperationPayload {
        base_revision: base,
        kind: OpKind::Delete { position, length },
        client_op_id: Uuid::new_v4(),
    }
}

/// Drain a session's event stream and fold the applied operations into its
/// local copy of the document, exactly as a client would.
async fn catch_up(grant: &mut JoinGrant, content: &mut String, until_revision: u64) {
    let mut seen = grant.revision;
    while seen < until_revision {
        let event = timeout(Duration::from_secs(2), grant.events.recv())
            .await
            .expect("event within timeout")
            .expect("stream open");
        if let ServerEvent::OperationApplied { revision, payload, .. } = event {
            *content = transform::apply(content, &payload.kind);
            seen = revision;
        }
    }
}

#[tokio::test]
async fn test_worked_example_hello_world() {
    // Room at revision 5 with "hello"; A inserts " world" at 5, B deletes
    // [0, 5), both based on revision 5. Expected: " world" at revision 7.
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    store.seed(doc, "hello", 5).await;
    let manager = build_manager(store, test_config());

    let a = manager.join("alice", doc, None).await.unwrap();
    let b = manager.join("bob", doc, None).await.unwrap();
    assert_eq!(a.content, "hello");

    let first = manager
        .submit_operation(a.session_id, insert(5, 5, " world"))
        .await
        .unwrap();
    let second = manager
        .submit_operation(b.session_id, delete(5, 0, 5))
        .await
        .unwrap();
    assert_eq!(first.revision_number, 6);
    assert_eq!(second.revision_number, 7);

    let c = manager.join("carol", doc, None).await.unwrap();
    assert_eq!(c.content, " world");
    assert_eq!(c.revision, 7);
}

#[tokio::test]
async fn test_convergence_across_sessions() {
    // Two sessions submit concurrently against the same base. A third
    // replica built purely from the broadcast stream, and another built by
    // replaying the returned revisions, must both equal the canonical
    // content a fresh join reads.
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    store.seed(doc, "base", 0).await;
    let manager = build_manager(store.clone(), test_config());

    // The observer joins first and only listens.
    let mut observer = manager.join("carol", doc, None).await.unwrap();
    let a = manager.join("alice", doc, None).await.unwrap();
    let b = manager.join("bob", doc, None).await.unwrap();

    let mut applied = Vec::new();
    for (session, payload) in [
        (a.session_id, insert(0, 4, "-tail")),
        (b.session_id, insert(0, 0, "head-")),
        (a.session_id, delete(0, 0, 2)),
    ] {
        applied.push(manager.submit_operation(session, payload).await.unwrap());
    }
    assert_eq!(applied.last().unwrap().revision_number, 3);

    let canonical = manager.join("carol", doc, None).await.unwrap();

    // Replica 1: fold the observer's event stream.
    let mut streamed = "base".to_string();
    catch_up(&mut observer, &mut streamed, 3).await;

    // Replica 2: replay the applied revisions the authors got back.
    let mut replayed = "base".to_string();
    for revision in &applied {
        replayed = transform::apply(&replayed, &revision.operation.kind);
    }

    assert_eq!(streamed, canonical.content);
    assert_eq!(replayed, canonical.content);
    // rev1 appends "-tail", rev2 prepends "head-", rev3's delete of the
    // first two codepoints of "base" lands at offset 5 post-transform.
    assert_eq!(canonical.content, "head-se-tail");
}

#[tokio::test]
async fn test_revision_monotonicity() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let manager = build_manager(store, test_config());

    let a = manager.join("alice", doc, None).await.unwrap();
    let b = manager.join("bob", doc, None).await.unwrap();

    let mut numbers = Vec::new();
    for i in 0..10u64 {
        let session = if i % 2 == 0 { a.session_id } else { b.session_id };
        // Everyone claims base 0; the sequencer transforms as needed.
        let revision = manager
            .submit_operation(session, insert(0, 0, "x"))
            .await
            .unwrap();
        numbers.push(revision.revision_number);
    }
    assert_eq!(numbers, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_idempotent_resubmission() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let manager = build_manager(store, test_config());
    let a = manager.join("alice", doc, None).await.unwrap();

    let payload = insert(0, 0, "only once");
    let first = manager
        .submit_operation(a.session_id, payload.clone())
        .await
        .unwrap();
    // Client times out and retries the identical payload.
    let second = manager.submit_operation(a.session_id, payload).await.unwrap();

    assert_eq!(first.revision_number, second.revision_number);
    let check = manager.join("bob", doc, None).await.unwrap();
    assert_eq!(check.content, "only once");
    assert_eq!(check.revision, 1);
}

#[tokio::test]
async fn test_tie_break_insensitive_to_arrival_order() {
    // Two inserts at the same position from sessions A and B must resolve
    // to the same final ordering regardless of which reaches the sequencer
    // first: the lower session id's insert lands first. Run both arrival
    // orders and check each outcome against its own session ids.
    for flip in [false, true] {
        let store = Arc::new(MemoryStore::new());
        let doc = Uuid::new_v4();
        store.seed(doc, "||", 0).await;
        let manager = build_manager(store, test_config());

        let a = manager.join("alice", doc, None).await.unwrap();
        let b = manager.join("bob", doc, None).await.unwrap();

        // Fixed payload per author; arrival order flips between runs.
        let subs = if flip {
            [(b.session_id, insert(0, 1, "BBB")), (a.session_id, insert(0, 1, "AAA"))]
        } else {
            [(a.session_id, insert(0, 1, "AAA")), (b.session_id, insert(0, 1, "BBB"))]
        };
        for (session, payload) in subs {
            manager.submit_operation(session, payload).await.unwrap();
        }

        let expected = if a.session_id < b.session_id { "|AAABBB|" } else { "|BBBAAA|" };
        let check = manager.join("carol", doc, None).await.unwrap();
        assert_eq!(check.content, expected, "arrival order flipped: {flip}");
    }
}

#[tokio::test]
async fn test_recovery_replay_exact_suffix() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let manager = build_manager(store, test_config());

    let a = manager.join("alice", doc, None).await.unwrap();
    let mut b = manager.join("bob", doc, None).await.unwrap();

    // B applies the first two revisions, then vanishes.
    for i in 0..2u64 {
        manager
            .submit_operation(a.session_id, insert(i, i, "x"))
            .await
            .unwrap();
    }
    let mut b_content = b.content.clone();
    catch_up(&mut b, &mut b_content, 2).await;
    assert_eq!(b_content, "xx");
    manager.disconnect(b.session_id).await.unwrap();

    // The room keeps moving while B is away.
    for i in 2..5u64 {
        manager
            .submit_operation(a.session_id, insert(i, 0, "y"))
            .await
            .unwrap();
    }

    // B reconnects claiming revision 2 and receives exactly (2, 5].
    let mut resumed = manager.join("bob", doc, Some(2)).await.unwrap();
    assert!(resumed.replayed);
    assert_eq!(resumed.revision, 5);

    let mut revisions = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(2), resumed.events.recv())
            .await
            .expect("replay event")
            .expect("stream open");
        if let ServerEvent::OperationApplied { revision, payload, .. } = event {
            revisions.push(revision);
            b_content = transform::apply(&b_content, &payload.kind);
        }
    }
    assert_eq!(revisions, vec![3, 4, 5]);

    // Converged with canonical content.
    let check = manager.join("carol", doc, None).await.unwrap();
    assert_eq!(b_content, check.content);
    assert_eq!(b_content, "yyyxx");
}

#[tokio::test]
async fn test_broadcast_skips_author_and_reaches_peers() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let manager = build_manager(store, test_config());

    let mut a = manager.join("alice", doc, None).await.unwrap();
    let mut b = manager.join("bob", doc, None).await.unwrap();

    // A hears B join.
    let event = timeout(Duration::from_secs(2), a.events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ServerEvent::UserJoined { .. }));

    manager
        .submit_operation(a.session_id, insert(0, 0, "ping"))
        .await
        .unwrap();

    // B receives the applied operation; A receives nothing further.
    let event = timeout(Duration::from_secs(2), b.events.recv()).await.unwrap().unwrap();
    match event {
        ServerEvent::OperationApplied { revision, .. } => assert_eq!(revision, 1),
        other => panic!("expected operation_applied, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.events.try_recv().is_err());
}

#[tokio::test]
async fn test_cursor_stream_independent_of_content() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let manager = build_manager(store, test_config());

    let a = manager.join("alice", doc, None).await.unwrap();
    let mut b = manager.join("bob", doc, None).await.unwrap();

    manager
        .update_cursor(a.session_id, CursorState { position: 2, selection: None })
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), b.events.recv()).await.unwrap().unwrap();
    match event {
        ServerEvent::CursorUpdate { payload, .. } => {
            assert_eq!(payload.session_id, a.session_id);
            assert_eq!(payload.cursor.position, 2);
        }
        other => panic!("expected cursor_update, got {other:?}"),
    }

    // Presence seeded for late joiners, dropped once the session leaves.
    let c = manager.join("carol", doc, None).await.unwrap();
    assert_eq!(c.peers.len(), 1);
    manager.leave(a.session_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let d = manager.join("alice", doc, None).await.unwrap();
    assert!(d.peers.is_empty());
}

#[tokio::test]
async fn test_grace_period_then_expiry_destroys_session() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let config = EngineConfig { grace_period_secs: 0, ..test_config() };
    let manager = build_manager(store, config);

    let a = manager.join("alice", doc, None).await.unwrap();
    let b = manager.join("bob", doc, None).await.unwrap();

    manager.disconnect(b.session_id).await.unwrap();

    // Zero grace window: the next housekeeping tick destroys the session
    // and the routing entry follows.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = manager
        .submit_operation(b.session_id, insert(0, 0, "late"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknown_session");

    // The survivor keeps editing.
    manager
        .submit_operation(a.session_id, insert(0, 0, "fine"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_malformed_frames_rejected_without_state_change() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let manager = build_manager(store, test_config());
    let a = manager.join("alice", doc, None).await.unwrap();

    assert_eq!(
        manager.submit(a.session_id, "{not json").await.unwrap_err().code(),
        "malformed_operation"
    );
    assert_eq!(
        manager
            .submit(a.session_id, r#"{"base_revision":0,"kind":"delete","position":0,"length":0,"client_op_id":"00000000-0000-0000-0000-000000000000"}"#)
            .await
            .unwrap_err()
            .code(),
        "malformed_operation"
    );

    let check = manager.join("bob", doc, None).await.unwrap();
    assert_eq!(check.revision, 0);
    assert_eq!(check.content, "");
}

#[tokio::test]
async fn test_error_events_encode_for_transport() {
    // Transports forward engine errors as typed error events; the codes
    // must survive the trip.
    let store = Arc::new(MemoryStore::new());
    let manager = build_manager(store, test_config());
    let a = manager.join("alice", Uuid::new_v4(), None).await.unwrap();

    let err = manager
        .submit_operation(a.session_id, insert(99, 0, "future"))
        .await
        .unwrap_err();
    let frame = ServerEvent::error(&err).encode().unwrap();
    assert!(frame.contains("\"type\":\"error\""));
    assert!(frame.contains("\"code\":\"stale_base\""));
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let store = Arc::new(MemoryStore::new());
    let manager = build_manager(store, test_config());
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    let a = manager.join("alice", doc_a, None).await.unwrap();
    let mut b = manager.join("bob", doc_b, None).await.unwrap();

    manager
        .submit_operation(a.session_id, insert(0, 0, "only doc_a"))
        .await
        .unwrap();

    // Nothing crosses rooms.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.events.try_recv().is_err());
    assert_eq!(manager.open_rooms().await, 2);

    let health = manager.health().await;
    assert_eq!(health.open_rooms, 2);
    let lags: Vec<u64> = health.rooms.iter().map(|room| room.checkpoint_lag()).collect();
    assert!(lags.contains(&1));
    assert!(lags.contains(&0));
}
