mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use flotilla::RaftError;

/// A barrier proves that every apply accepted before it has reached the
/// state machine.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn barrier_waits_for_prior_applies() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(3).await?;
    let raft = router.node(&leader).await.raft;

    // Accept a pile of applies without awaiting their futures.
    let mut futures = Vec::new();
    for i in 0..30u32 {
        futures.push(raft.apply(format!("barrier-{}", i).as_bytes().to_vec(), Some(Duration::from_secs(5))).await);
    }

    // Once the barrier resolves, every accepted apply must be in the FSM.
    let barrier_index = raft.barrier(Some(Duration::from_secs(5))).await.await?;
    assert!(barrier_index > 0);
    let logs = router.node(&leader).await.fsm.logs().await;
    assert_eq!(logs.len(), 30, "barrier resolved before all prior applies reached the FSM");

    for future in futures {
        let res = future.await?;
        assert!(res.index < barrier_index);
    }

    Ok(())
}

/// Barriers are leader-only.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn barrier_on_follower_rejected() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(3).await?;
    let follower = ["0", "1", "2"].iter().find(|id| **id != leader).unwrap().to_string();

    let err = router.node(&follower).await.raft.barrier(None).await.await.expect_err("barrier on follower");
    assert!(matches!(err, RaftError::NotLeader { .. }));

    Ok(())
}

/// Verify-leader succeeds on a healthy leader, fails off-leader, and fails
/// on a leader which has lost its quorum.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn verify_leader() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(3).await?;

    // Healthy leader verifies.
    router.node(&leader).await.raft.verify_leader().await?;

    // A follower does not.
    let follower = ["0", "1", "2"].iter().find(|id| **id != leader).unwrap().to_string();
    let err = router.node(&follower).await.raft.verify_leader().await.expect_err("verify on follower");
    assert!(matches!(err, RaftError::NotLeader { .. }));

    // A partitioned leader cannot confirm a quorum.
    router.isolate_node(&leader).await;
    let deadline = tokio::time::Instant::now() + fixtures::longstop();
    loop {
        match router.node(&leader).await.raft.verify_leader().await {
            Err(RaftError::LeadershipLost) | Err(RaftError::NotLeader { .. }) => break,
            Ok(()) => {
                if tokio::time::Instant::now() > deadline {
                    panic!("partitioned leader kept verifying leadership");
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(err) => panic!("unexpected verify error: {:?}", err),
        }
    }

    Ok(())
}

/// Verify-leader on a single-node cluster needs no round trips.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn verify_leader_single_node() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    router.new_cluster(1).await?;
    router.node("0").await.raft.verify_leader().await?;

    Ok(())
}
