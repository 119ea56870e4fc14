mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;

/// Cluster total_order_apply test.
///
/// What does this test do?
///
/// - brings 2 nodes online: one leader and one non-voter.
/// - writes a stream of entries to the leader.
/// - asserts that the non-voter's state machine only ever observes its
///   applied index moving forward, i.e. entries apply in strictly increasing
///   order with no regressions, concurrently with the writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn total_order_apply() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(1).await?;

    router.new_raft_node("1").await;
    router.node(&leader).await.raft.add_nonvoter("1".into(), "1".into(), 0, None).await.await?;

    let follower_fsm = router.node("1").await.fsm.clone();
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let watcher = tokio::spawn(async move {
        let mut prev = flotilla::LogId::default();
        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }
            let last = follower_fsm.last_applied().await;
            if last < prev {
                return Err(format!("out of order apply: {} after {}", last, prev));
            }
            prev = last;
            tokio::time::sleep(Duration::from_micros(50)).await;
        }
    });

    let n = 1000usize;
    router.client_request_many(&leader, "total-order", n).await;

    let leader_applied = router.node(&leader).await.raft.stats().last_applied;
    router
        .wait_for_metrics(
            "1",
            |m| m.last_applied >= leader_applied,
            Some(fixtures::longstop()),
            "non-voter catches up",
        )
        .await?;

    stop_tx.send(true)?;
    watcher.await?.map_err(|violation| anyhow::anyhow!(violation))?;

    assert_eq!(router.node("1").await.fsm.logs().await.len(), n);

    Ok(())
}
