//! End-to-end job execution scenarios over in-process overlay trees.


use std::time::Duration;

use serde_json::json;

use canopy::engine::Notice;
use canopy::error::Error;
use canopy::shell::exit_status;
use canopy::topology::Topology;
use test_harness::{assert_no_frame, next_frame, TestTree};

/// A job on a one-rank system streams a start frame, then a finish frame
/// with the shell's exit status, then ends.
#[tokio::test]
async fn test_single_rank_run() {
    let tree = TestTree::new(Topology::single(0)).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0")
        .await
        .expect("start accepted");

    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");
    assert_eq!(frame.id, 1);

    tree.spawner(0).exit(1, 0);
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    assert_eq!(frame.data["status"], json!(0));

    // stream ends after finish
    assert!(tokio::time::timeout(Duration::from_secs(1), stream.recv())
        .await
        .expect("stream should close")
        .is_none());
}

/// A job targeting only rank 0 produces no downstream fan-out.
#[tokio::test]
async fn test_job_targeting_only_root() {
    let tree = TestTree::new(Topology::flat(2)).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0")
        .await
        .expect("start accepted");

    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");
    tree.spawner(0).exit(1, 0);
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");

    // rank 1 never saw the job
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!tree.spawner(1).spawned(1));
}

/// Start converges only after every target rank has started; one start
/// frame reaches the client.
#[tokio::test]
async fn test_start_aggregation_across_tree() {
    let tree = TestTree::new(Topology::flat(4)).await;
    let mut stream = tree
        .root()
        .handle
        .start(7, 1000, "0-3")
        .await
        .expect("start accepted");

    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");
    assert_eq!(frame.id, 7);

    for rank in 0..4 {
        tree.wait_spawned(rank, 7).await;
        tree.spawner(rank).exit(7, 0);
    }
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    assert_eq!(frame.data["status"], json!(0));
}

/// Duplicate exec.start for the same job id is rejected.
#[tokio::test]
async fn test_duplicate_start_rejected() {
    let tree = TestTree::new(Topology::single(0)).await;
    let _stream = tree
        .root()
        .handle
        .start(1, 1000, "0")
        .await
        .expect("first start accepted");
    let err = tree
        .root()
        .handle
        .start(1, 1000, "0")
        .await
        .expect_err("duplicate start rejected");
    assert!(matches!(err, Error::JobExists(1)));
}

/// A start addressing ranks outside the overlay is rejected.
#[tokio::test]
async fn test_start_unknown_ranks_rejected() {
    let tree = TestTree::new(Topology::flat(2)).await;
    let err = tree
        .root()
        .handle
        .start(1, 1000, "0-5")
        .await
        .expect_err("unreachable ranks rejected");
    assert!(matches!(err, Error::UnreachableRanks(_)));

    let err = tree
        .root()
        .handle
        .start(2, 1000, "not-an-idset")
        .await
        .expect_err("malformed idset rejected");
    assert!(matches!(err, Error::Protocol(_)));
}

/// The job status is the max of the statuses reported across ranks.
#[tokio::test]
async fn test_status_max_aggregation() {
    let tree = TestTree::new(Topology::flat(4)).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0-3")
        .await
        .expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");

    for (rank, code) in [(0u32, 0), (1, 3), (2, 1), (3, 2)] {
        tree.wait_spawned(rank, 1).await;
        tree.spawner(rank).exit(1, code);
    }
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    assert_eq!(frame.data["status"], json!(exit_status(3)));
}

/// Kill addressed at a rank subset reaches exactly those ranks.
#[tokio::test]
async fn test_kill_fanout_by_rank_set() {
    let tree = TestTree::new(Topology::flat(4)).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0-3")
        .await
        .expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");

    tree.root()
        .handle
        .kill(1, "1,3", 15)
        .await
        .expect("kill accepted");

    test_harness::assert_eventually(
        || {
            let s1 = tree.spawner(1);
            let s3 = tree.spawner(3);
            async move { s1.signals(1) == vec![15] && s3.signals(1) == vec![15] }
        },
        Duration::from_secs(5),
        "ranks 1 and 3 should receive the signal",
    )
    .await;
    assert!(tree.spawner(0).signals(1).is_empty());
    assert!(tree.spawner(2).signals(1).is_empty());

    // the signalled shells died; finish the rest
    tree.spawner(0).exit(1, 0);
    tree.spawner(2).exit(1, 0);
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    // signal deaths carry the raw signal number through the max reduction
    assert_eq!(frame.data["status"], json!(15));
}

/// Kill for an unknown job id fails with not-found.
#[tokio::test]
async fn test_kill_unknown_job() {
    let tree = TestTree::new(Topology::single(0)).await;
    let err = tree
        .root()
        .handle
        .kill(42, "0", 15)
        .await
        .expect_err("unknown job rejected");
    assert!(matches!(err, Error::JobNotFound(42)));
}

/// An exception notify reaches the client and severity 0 kills the whole
/// job.
#[tokio::test]
async fn test_exception_kills_job() {
    let tree = TestTree::new(Topology::flat(4)).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0-3")
        .await
        .expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");

    tree.root()
        .handle
        .notify(Notice {
            kind: "exception".to_string(),
            data: json!({ "id": 1, "severity": 0, "type": "exec", "note": "node failure" }),
            reply: None,
        })
        .await
        .expect("notify delivered");

    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "exception");
    assert_eq!(frame.data["severity"], json!(0));
    assert_eq!(frame.data["type"], json!("exec"));

    // SIGTERM fans out to every job rank; the shells die with it
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
    assert_eq!(frame.data["status"], json!(libc::SIGTERM));
    for rank in 0..4 {
        assert_eq!(tree.spawner(rank).signals(1), vec![libc::SIGTERM]);
    }
}

/// An exception raised below an internal rank is relayed up to the root.
#[tokio::test]
async fn test_exception_relayed_from_internal_rank() {
    // 0 -> 1 -> 2
    let topology = Topology {
        rank: 0,
        children: vec![Topology {
            rank: 1,
            children: vec![Topology::single(2)],
        }],
    };
    let tree = TestTree::new(topology).await;
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0-2")
        .await
        .expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");

    // deliver to rank 1, as if raised by rank 2
    tree.handle(1)
        .notify(Notice {
            kind: "exception".to_string(),
            data: json!({ "id": 1, "severity": 1, "type": "exec", "note": "transient" }),
            reply: None,
        })
        .await
        .expect("notify delivered");

    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "exception");
    assert_eq!(frame.data["severity"], json!(1));
    assert_eq!(frame.data["note"], json!("transient"));

    // severity 1 does not kill the job
    tokio::time::sleep(Duration::from_millis(100)).await;
    for rank in 0..3 {
        assert!(tree.spawner(rank).signals(1).is_empty());
    }
    for rank in 0..3 {
        tree.spawner(rank).exit(1, 0);
    }
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "finish");
}

/// Release is accepted as a notify type but not implemented.
#[tokio::test]
async fn test_release_unsupported() {
    let tree = TestTree::new(Topology::single(0)).await;
    let _stream = tree
        .root()
        .handle
        .start(1, 1000, "0")
        .await
        .expect("start accepted");
    let err = tree
        .root()
        .handle
        .notify_wait("release", json!({ "id": 1, "ranks": "0" }))
        .await
        .expect_err("release unsupported");
    assert!(matches!(err, Error::Unsupported("release")));
}

/// A notify with an unregistered type is rejected, not fatal.
#[tokio::test]
async fn test_unknown_notify_type() {
    let tree = TestTree::new(Topology::single(0)).await;
    let err = tree
        .root()
        .handle
        .notify_wait("bogus", json!({}))
        .await
        .expect_err("unknown type rejected");
    assert!(matches!(err, Error::Protocol(_)));

    // the engine keeps serving afterwards
    let mut stream = tree
        .root()
        .handle
        .start(1, 1000, "0")
        .await
        .expect("start accepted");
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.kind, "start");
}

/// Additions submitted within the coalescing window fan out as one batch.
#[tokio::test]
async fn test_state_update_batching() {
    let tree = TestTree::new_excluding(Topology::flat(2), &[1]).await;
    let mut stream_a = tree
        .root()
        .handle
        .start(1, 1000, "0-1")
        .await
        .expect("start accepted");
    let _stream_b = tree
        .root()
        .handle
        .start(2, 1000, "1")
        .await
        .expect("start accepted");

    // attach as rank 1: both additions arrive in one state-update, in
    // submission order
    let mut frames = tree.root().handle.hello(1).await.expect("hello accepted");
    let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("frame within timeout")
        .expect("stream open");
    assert_eq!(frame.kind, "state-update");
    let jobs = frame.data["jobs"].as_array().expect("jobs array").clone();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["id"], 1);
    assert_eq!(jobs[1]["id"], 2);

    assert_no_frame(&mut stream_a, Duration::from_millis(100)).await;
}
