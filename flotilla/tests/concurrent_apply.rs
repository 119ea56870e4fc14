mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;

/// Concurrent applies preserve a single total order.
///
/// - fires 100 applies at the leader from parallel tasks.
/// - every future must succeed, and all three FSMs must end up with the same
///   100 payloads in the same order.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn concurrent_applies_preserve_order() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(3).await?;
    let raft = router.node(&leader).await.raft;

    let mut handles = Vec::with_capacity(100);
    for i in 0..100u32 {
        let raft = raft.clone();
        handles.push(tokio::spawn(async move {
            let future = raft.apply(format!("concurrent-{}", i).as_bytes().to_vec(), Some(Duration::from_secs(5))).await;
            future.await
        }));
    }

    let mut max_index = 0;
    for handle in handles {
        let res = handle.await?.expect("concurrent apply failed");
        assert!(res.index > 0);
        max_index = std::cmp::max(max_index, res.index);
    }

    // All three FSMs hold the same 100 entries in the same order.
    router.ensure_same(Some(100), fixtures::longstop()).await?;

    // Indexes were assigned from a single ordered log.
    let leader_applied = router.node(&leader).await.raft.stats().last_applied;
    assert!(leader_applied >= max_index);

    Ok(())
}

/// Applying through a follower is rejected with a leader hint rather than
/// being silently forwarded.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn apply_on_non_leader_is_rejected() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(3).await?;
    let follower = ["0", "1", "2"].iter().find(|id| **id != leader).unwrap().to_string();

    let err = router.try_client_request(&follower, b"test").await.expect_err("apply on follower must fail");
    match err {
        flotilla::RaftError::NotLeader { leader: hint } => {
            assert_eq!(hint.map(|server| server.id), Some(leader));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    Ok(())
}
