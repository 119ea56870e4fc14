mod fixtures;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use flotilla::RaftError;
use flotilla::State;
use maplit::btreeset;

/// Behind-follower catch-up via InstallSnapshot.
///
/// - disconnects one follower of a three-node cluster, then applies 100
///   payloads and snapshots on every node. Snapshotting truncates the logs,
///   so the disconnected follower can no longer be served from the log; the
///   follower itself has nothing to snapshot and reports so.
/// - after reconnecting, the behind follower is brought up to speed with an
///   InstallSnapshot stream and all three FSMs converge.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn behind_follower_catches_up_via_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let mut config = fixtures::test_config();
    config.trailing_logs = 10;
    let router = Arc::new(RaftRouter::new(config));
    let leader = router.new_cluster(3).await?;

    // Pick a follower and disconnect it.
    let all: BTreeSet<String> = btreeset! {"0".into(), "1".into(), "2".into()};
    let behind = all.iter().find(|id| **id != leader).cloned().expect("no follower found");
    router.isolate_node(&behind).await;

    // Commit a lot of things without the behind follower.
    router.client_request_many(&leader, "test", 100).await;

    // Wait for the connected majority to apply everything.
    let applied = router.node(&leader).await.raft.stats().last_applied;
    let connected: BTreeSet<String> = all.iter().filter(|id| **id != behind).cloned().collect();
    router.wait_for_applied(&connected, applied, Some(fixtures::longstop()), "majority applied").await?;

    // Snapshot every node; this truncates the logs. The disconnected node has
    // nothing to snapshot, which is expected.
    for id in &all {
        let res = router.node(id).await.raft.snapshot().await.await;
        match res {
            Ok(_) => assert_ne!(id, &behind, "behind follower should have nothing to snapshot"),
            Err(RaftError::NothingNewToSnapshot) => {
                assert_eq!(id, &behind, "only the behind follower should report nothing new")
            }
            Err(err) => panic!("snapshot on {} failed: {:?}", id, err),
        }
    }

    // Reconnect the behind node; it must converge via a snapshot stream.
    router.fully_connect().await;
    router.ensure_same(Some(100), fixtures::longstop()).await?;

    // The behind follower restored from a snapshot rather than the log.
    router
        .wait_for_metrics(
            &behind,
            |m| m.snapshot.index > 0,
            Some(fixtures::longstop()),
            "behind follower installed a snapshot",
        )
        .await?;

    Ok(())
}

/// Same as above, but with further entries committed after the snapshot:
/// the follower needs the snapshot stream *and* a log tail to converge.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn behind_follower_snapshot_and_logs() -> Result<()> {
    fixtures::init_tracing();

    let mut config = fixtures::test_config();
    config.trailing_logs = 10;
    let router = Arc::new(RaftRouter::new(config));
    let leader = router.new_cluster(3).await?;

    let all: BTreeSet<String> = btreeset! {"0".into(), "1".into(), "2".into()};
    let behind = all.iter().find(|id| **id != leader).cloned().expect("no follower found");
    router.isolate_node(&behind).await;

    router.client_request_many(&leader, "first", 100).await;
    router.node(&leader).await.raft.snapshot().await.await?;

    // Commit more entries past the snapshot.
    router.client_request_many(&leader, "second", 100).await;

    router.fully_connect().await;
    router.ensure_same(Some(200), fixtures::longstop()).await?;

    // The cluster still has exactly one leader after convergence.
    let final_leader = router.wait_for_leader(fixtures::longstop()).await?;
    router
        .wait_for_metrics(
            &final_leader,
            |m| m.state == State::Leader,
            Some(Duration::from_secs(1)),
            "stable leader after catch-up",
        )
        .await?;

    Ok(())
}
