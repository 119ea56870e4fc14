mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use flotilla::RaftError;

/// Everything fails fast after shutdown, and shutdown itself is idempotent.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn after_shutdown_everything_fails_fast() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    router.new_cluster(1).await?;
    let raft = router.node("0").await.raft;

    raft.shutdown().await?;

    let err = raft.apply(b"test".to_vec(), None).await.await.expect_err("apply after shutdown");
    assert!(matches!(err, RaftError::Shutdown), "unexpected error: {:?}", err);

    let err = raft.add_voter("id".into(), "addr".into(), 0, None).await.await.expect_err("add_voter after shutdown");
    assert!(matches!(err, RaftError::Shutdown));

    let err = raft.add_nonvoter("id".into(), "addr".into(), 0, None).await.await.expect_err("add_nonvoter");
    assert!(matches!(err, RaftError::Shutdown));

    let err = raft.remove_server("id".into(), 0, None).await.await.expect_err("remove_server after shutdown");
    assert!(matches!(err, RaftError::Shutdown));

    let err = raft.demote_voter("id".into(), 0, None).await.await.expect_err("demote_voter after shutdown");
    assert!(matches!(err, RaftError::Shutdown));

    let err = raft.snapshot().await.await.expect_err("snapshot after shutdown");
    assert!(matches!(err, RaftError::Shutdown));

    let err = raft.barrier(None).await.await.expect_err("barrier after shutdown");
    assert!(matches!(err, RaftError::Shutdown));

    let err = raft.verify_leader().await.expect_err("verify_leader after shutdown");
    assert!(matches!(err, RaftError::Shutdown));

    let err = raft.get_membership().await.expect_err("get_membership after shutdown");
    assert!(matches!(err, RaftError::Shutdown));

    // Should be idempotent.
    raft.shutdown().await?;
    raft.shutdown().await?;

    Ok(())
}

/// In-flight applies resolve with `Shutdown` when the node stops before they
/// commit.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn pending_apply_resolves_on_shutdown() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(3).await?;

    // Partition the leader so new entries cannot commit, then shut it down
    // with an apply still pending.
    router.isolate_node(&leader).await;
    let raft = router.node(&leader).await.raft;
    let pending = raft.apply(b"never-commits".to_vec(), None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    raft.shutdown().await?;

    let err = pending.await.expect_err("pending apply must resolve once the node stops");
    assert!(
        matches!(err, RaftError::Shutdown | RaftError::LeadershipLost | RaftError::NotLeader { .. }),
        "unexpected error: {:?}",
        err
    );

    Ok(())
}
