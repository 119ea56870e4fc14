mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use fixtures::RaftRouter;
use flotilla::membership::Membership;
use flotilla::membership::Server;
use flotilla::membership::Suffrage;
use flotilla::RaftError;

fn membership_of(ids: &[&str]) -> Membership {
    Membership::new(ids.iter().map(|id| Server::new(*id, *id, Suffrage::Voter)).collect())
}

/// Live bootstrap of a three-node cluster.
///
/// - brings three pristine nodes online with wired transports but no
///   configuration.
/// - bootstraps one of them live; a leader arises and an apply replicates to
///   all three.
/// - bootstrapping again fails with `CantBootstrap` now that state exists.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn live_bootstrap() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    router.new_raft_node("0").await;
    router.new_raft_node("1").await;
    router.new_raft_node("2").await;

    // Nothing can elect yet: pristine nodes carry no voters.
    assert!(router.leader().await.is_none());

    let membership = membership_of(&["0", "1", "2"]);
    router.node("0").await.raft.bootstrap_cluster(membership.clone()).await?;

    let leader = router.wait_for_leader(fixtures::longstop()).await?;
    let res = router.client_request(&leader, b"test").await;
    assert!(res.index > 0);
    router.ensure_same(Some(1), fixtures::longstop()).await?;

    // The live bootstrap must fail now that things are started up.
    let err = router
        .node("0")
        .await
        .raft
        .bootstrap_cluster(membership)
        .await
        .expect_err("second bootstrap must fail");
    assert!(matches!(err, RaftError::CantBootstrap), "unexpected error: {:?}", err);

    Ok(())
}

/// The offline bootstrap refuses stores which already hold state.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn offline_bootstrap_requires_clean_state() -> Result<()> {
    fixtures::init_tracing();

    let log_store = memstore::MemLogStore::new();
    let stable_store = memstore::MemStableStore::new();
    let snapshot_store = memstore::MemSnapshotStore::new();
    let mut config = fixtures::test_config();
    config.local_id = "0".into();

    let membership = membership_of(&["0"]);
    flotilla::recovery::bootstrap_cluster(&config, &log_store, &stable_store, &snapshot_store, membership.clone())
        .await?;

    // Bootstrapping the same stores again must fail.
    let err = flotilla::recovery::bootstrap_cluster(&config, &log_store, &stable_store, &snapshot_store, membership)
        .await
        .expect_err("bootstrap over existing state must fail");
    assert!(matches!(err, RaftError::CantBootstrap));

    Ok(())
}

/// Manual recovery overrides the persisted membership with an operator
/// supplied voter set parsed from a peers file.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn recover_cluster_overrides_membership() -> Result<()> {
    fixtures::init_tracing();

    // Build a single-node cluster and shut it down with some state in place.
    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    router.new_cluster(1).await?;
    router.client_request_many("0", "test", 5).await;
    let node = router.node("0").await;
    node.raft.shutdown().await?;
    router.remove_node("0").await;

    // Recover with an operator-chosen voter set.
    let peers = br#"[
        {"id": "0", "address": "0"},
        {"id": "1", "address": "1"},
        {"id": "2", "address": "2"}
    ]"#;
    let membership = flotilla::recovery::read_peers_json(peers)?;
    let mut config = fixtures::test_config();
    config.local_id = "0".into();
    flotilla::recovery::recover_cluster(
        &config,
        node.log_store.as_ref(),
        node.stable_store.as_ref(),
        node.snapshot_store.as_ref(),
        membership.clone(),
    )
    .await?;

    // Restart; the node adopts the recovered membership from its log.
    router.new_raft_node("1").await;
    router.new_raft_node("2").await;
    let restarted = router
        .new_raft_node_with_stores(
            "0",
            memstore::MemFsm::new(),
            node.log_store.clone(),
            node.stable_store.clone(),
            node.snapshot_store.clone(),
        )
        .await;

    let leader = router.wait_for_leader(fixtures::longstop()).await?;
    assert_eq!(leader, "0", "only the recovered node has a log, it must win the election");
    let info = restarted.raft.get_membership().await?;
    assert_eq!(info.latest, membership);

    // The other two catch up and the cluster serves writes.
    let res = router.client_request(&leader, b"after-recovery").await;
    assert!(res.index > 0);
    router.ensure_same(None, fixtures::longstop()).await?;

    Ok(())
}
