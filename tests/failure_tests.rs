//! Partial-failure scenarios: disconnected children, dead streams, and
//! spawn failures.


use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use canopy::config::NodeConfig;
use canopy::engine::{Engine, Notice};
use canopy::shell::exit_status;
use canopy::topology::Topology;
use test_harness::{assert_no_frame, next_frame, FailingSpawner, TestTree};

/// A child severed before it reports start: the client sees no spurious
/// start frame; after reconnect the queued state-update replays and the
/// job converges.
#[tokio::test]
async fn test_child_disconnect_before_start() {
    let tree = TestTree::new_excluding(Topology::flat(4), &[2]).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0-3")
        .await
        .expect("start accepted");

    // ranks 0, 1, 3 start; rank 2 is absent, so start never converges
    assert_no_frame(&mut stream, Duration::from_millis(300)).await;

    // rank 2 attaches: the queued state-update replays, restricted to its
    // subtree
    let mut frames = tree.root().handle.hello(2).await.expect("hello accepted");
    let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("frame within timeout")
        .expect("stream open");
    assert_eq!(frame.kind, "state-update");
    assert_eq!(frame.idset.to_string(), "2");
    let jobs = frame.data["jobs"].as_array().expect("jobs array");
    assert_eq!(jobs[0]["id"], 1);
    assert_eq!(jobs[0]["ranks"], "0-3");

    // play rank 2: report start, then the start frame finally converges
    tree.root()
        .handle
        .notify(Notice {
            kind: "start".to_string(),
            data: json!({ "id": 1, "ranks": "2" }),
            reply: None,
        })
        .await
        .expect("notify delivered");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");

    // finish everywhere
    for rank in [0u32, 1, 3] {
        tree.wait_spawned(rank, 1).await;
        tree.spawner(rank).exit(1, 0);
    }
    tree.root()
        .handle
        .notify(Notice {
            kind: "finish".to_string(),
            data: json!({ "id": 1, "ranks": "2", "status": 0 }),
            reply: None,
        })
        .await
        .expect("notify delivered");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    assert_eq!(frame.data["status"], json!(0));
}

/// A dropped hello stream marks the child disconnected; updates queue and
/// replay on the next attach.
#[tokio::test]
async fn test_updates_queue_across_reconnect() {
    let tree = TestTree::new_excluding(Topology::flat(2), &[1]).await;

    // connect rank 1, then sever it
    let frames = tree.root().handle.hello(1).await.expect("hello accepted");
    drop(frames);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0-1")
        .await
        .expect("start accepted");
    assert_no_frame(&mut stream, Duration::from_millis(300)).await;

    // reattach: the queued update is replayed before anything else
    let mut frames = tree.root().handle.hello(1).await.expect("hello accepted");
    let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("frame within timeout")
        .expect("stream open");
    assert_eq!(frame.kind, "state-update");
    assert_eq!(frame.idset.to_string(), "1");

    // converge
    tree.root()
        .handle
        .notify(Notice {
            kind: "start".to_string(),
            data: json!({ "id": 1, "ranks": "1" }),
            reply: None,
        })
        .await
        .expect("notify delivered");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");

    tree.spawner(0).exit(1, 0);
    tree.root()
        .handle
        .notify(Notice {
            kind: "finish".to_string(),
            data: json!({ "id": 1, "ranks": "1", "status": 0 }),
            reply: None,
        })
        .await
        .expect("notify delivered");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
}

/// A client that drops its start stream cancels the job: the root fans
/// out SIGTERM to every job rank.
#[tokio::test]
async fn test_client_abandon_terminates_job() {
    let tree = TestTree::new(Topology::single(0)).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0")
        .await
        .expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");

    drop(stream);
    let spawner = tree.spawner(0);
    test_harness::assert_eventually(
        || {
            let spawner = spawner.clone();
            async move { spawner.signals(1).contains(&libc::SIGTERM) }
        },
        Duration::from_secs(5),
        "abandoning the stream should SIGTERM the shell",
    )
    .await;
}

/// A hello from a rank that is not a child is rejected.
#[tokio::test]
async fn test_hello_from_unknown_peer() {
    let tree = TestTree::new(Topology::flat(2)).await;
    let err = tree
        .root()
        .handle
        .hello(9)
        .await
        .expect_err("unknown peer rejected");
    assert!(matches!(err, canopy::error::Error::UnknownPeer(9)));
}

/// Spawn failures map to the documented exit codes and finish the local
/// rank; the client never sees a start frame.
#[tokio::test]
async fn test_spawn_failure_not_found() {
    let config = NodeConfig::new(0, "127.0.0.1:0".parse().unwrap());
    let (engine, handle, events) = Engine::new(
        &config,
        Arc::new(FailingSpawner {
            errno: libc::ENOENT,
        }),
        None,
    )
    .expect("engine builds");
    tokio::spawn(engine.run(events, CancellationToken::new()));

    let mut stream = handle.start(1, 1000, "0").await.expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    assert_eq!(frame.data["status"], json!(exit_status(127)));
}

#[tokio::test]
async fn test_spawn_failure_permission_denied() {
    let config = NodeConfig::new(0, "127.0.0.1:0".parse().unwrap());
    let (engine, handle, events) = Engine::new(
        &config,
        Arc::new(FailingSpawner {
            errno: libc::EACCES,
        }),
        None,
    )
    .expect("engine builds");
    tokio::spawn(engine.run(events, CancellationToken::new()));

    let mut stream = handle.start(1, 1000, "0").await.expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    assert_eq!(frame.data["status"], json!(exit_status(126)));
}
