mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;

/// Single-node cluster.
///
/// - brings one bootstrapped node online and waits for it to assume
///   leadership (observed through the leader watch channel).
/// - applies one payload and asserts the response, the assigned index and the
///   FSM contents.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn single_node() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(1).await?;
    assert_eq!(leader, "0");

    // The leader watch channel must signal leadership.
    let node = router.node("0").await;
    let mut leader_watch = node.raft.leader_watch();
    if !*leader_watch.borrow() {
        tokio::time::timeout(Duration::from_secs(1), leader_watch.changed()).await??;
    }
    assert!(*leader_watch.borrow(), "leader watch should read true");

    // Should be able to apply.
    let res = router.client_request("0", b"test").await;
    assert_eq!(res.data, 1, "first apply should yield a state machine count of 1");
    assert!(res.index >= 1, "applied index should be assigned");

    // Check that it reached the FSM.
    router
        .wait_for_metrics("0", |m| m.last_applied >= res.index, Some(Duration::from_secs(1)), "apply reaches fsm")
        .await?;
    assert_eq!(node.fsm.logs().await, vec![b"test".to_vec()]);

    Ok(())
}

/// A node which skips the follower state entirely when configured to start as
/// leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn start_as_leader() -> Result<()> {
    fixtures::init_tracing();

    let mut config = fixtures::test_config();
    config.start_as_leader = true;
    let router = Arc::new(RaftRouter::new(config));

    let log_store = Arc::new(memstore::MemLogStore::new());
    let stable_store = Arc::new(memstore::MemStableStore::new());
    let snapshot_store = Arc::new(memstore::MemSnapshotStore::new());
    let membership = flotilla::Membership::new_initial("0", "0");
    {
        let mut config = fixtures::test_config();
        config.local_id = "0".into();
        flotilla::recovery::bootstrap_cluster(
            &config,
            log_store.as_ref(),
            stable_store.as_ref(),
            snapshot_store.as_ref(),
            membership,
        )
        .await?;
    }
    let node = router
        .new_raft_node_with_stores("0", memstore::MemFsm::new(), log_store, stable_store, snapshot_store)
        .await;

    router
        .wait_for_metrics("0", |m| m.state == flotilla::State::Leader, Some(Duration::from_secs(1)), "start as leader")
        .await?;

    let res = router.client_request("0", b"immediate").await;
    assert_eq!(res.data, 1);
    router
        .wait_for_metrics("0", |m| m.last_applied >= res.index, Some(Duration::from_secs(1)), "apply reaches fsm")
        .await?;
    assert_eq!(node.fsm.logs().await, vec![b"immediate".to_vec()]);

    Ok(())
}
