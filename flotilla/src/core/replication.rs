use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::fsm::Fsm;
use crate::membership::Server;
use crate::observer::Observation;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::replication::SnapshotSource;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::transport::RaftTransport;
use crate::LogId;
use crate::ServerId;

impl<'a, F, N, L, S, P> LeaderState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// Spawn a new replication stream returning its state handle.
    #[tracing::instrument(level = "debug", skip(self), fields(target=%target.id))]
    pub(super) fn spawn_replication_stream(&self, target: Server) -> ReplicationState {
        let repl = ReplicationStream::spawn(
            self.core.id.clone(),
            target.clone(),
            self.core.current_term,
            self.core.config.clone(),
            self.core.rpc_header(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.transport.clone(),
            self.core.log_store.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            server: target,
            matched: LogId::default(),
            remove_after_commit: None,
            last_contact: Instant::now(),
            repl,
        }
    }

    /// Notify every replication stream of the current log tail and commit
    /// index.
    pub(super) fn notify_replication(&mut self) {
        for node in self.nodes.values() {
            let _ = node.repl.repl_tx.send(RaftEvent::Replicate {
                last_log_index: self.core.last_log_id.index,
                commit_index: self.core.commit_index,
            });
        }
    }

    /// Handle an event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                self.handle_update_match_index(target, matched).await?;
            }
            ReplicaEvent::Contact { target } => {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.last_contact = Instant::now();
                }
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                self.handle_revert_to_follower(target, term).await?;
            }
            ReplicaEvent::NeedsSnapshot { target, tx } => {
                self.handle_needs_snapshot(target, tx).await?;
            }
            ReplicaEvent::Liveness { target, alive } => {
                self.core.observers.observe(Observation::PeerLiveness { id: target, alive });
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
        Ok(())
    }

    /// Handle an update to a peer's match index.
    async fn handle_update_match_index(&mut self, target: ServerId, matched: LogId) -> RaftResult<()> {
        let mut needs_removal = false;
        match self.nodes.get_mut(&target) {
            Some(node) => {
                node.matched = matched;
                node.last_contact = Instant::now();
                if let Some(threshold) = &node.remove_after_commit {
                    if &matched.index >= threshold {
                        needs_removal = true;
                    }
                }
            }
            None => return Ok(()),
        }

        if needs_removal {
            tracing::debug!(target=%target, "removing replicated-out peer from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.repl.repl_tx.send(RaftEvent::Terminate);
            }
        }

        self.advance_commit_state().await
    }

    /// Handle a higher term observed by a replication stream.
    async fn handle_revert_to_follower(&mut self, target: ServerId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            tracing::info!(%target, term, "replication stream observed a newer term, stepping down");
            self.core.update_current_term(term);
            self.core.save_current_term().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Serve a replication stream which needs a snapshot for its target.
    async fn handle_needs_snapshot(
        &mut self,
        target: ServerId,
        tx: oneshot::Sender<SnapshotSource>,
    ) -> RaftResult<()> {
        let snapshots =
            self.core.snapshot_store.list().await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        match snapshots.first() {
            Some(meta) => {
                let (meta, source) = self
                    .core
                    .snapshot_store
                    .open(&meta.id)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
                let _ = tx.send(SnapshotSource { meta, source });
            }
            None => {
                // No snapshot available; the log must have what the stream
                // needs once a snapshot exists. Kick one off and let the
                // stream retry.
                tracing::debug!(%target, "replication stream needs a snapshot but none exists yet");
                self.core.start_snapshot();
            }
        }
        Ok(())
    }

    /// Drive the commit pipeline to a fixed point.
    ///
    /// Each round derives the commit index from the voters' match indexes,
    /// then acts on any committed configuration; a follow-up may append a
    /// further configuration entry (staging promotion, un-parked change),
    /// which in turn may commit immediately on a small cluster, so the two
    /// steps loop until neither has anything left to do.
    pub(super) async fn advance_commit_state(&mut self) -> RaftResult<()> {
        loop {
            self.recompute_commit_index().await?;
            if !self.handle_config_commitment().await {
                return Ok(());
            }
        }
    }

    /// Derive the commit index from the voters' match indexes and act on any
    /// advance.
    async fn recompute_commit_index(&mut self) -> RaftResult<()> {
        let mut indexes: Vec<(u64, u64)> = Vec::with_capacity(self.core.membership.latest.voter_count());
        for voter in self.core.membership.latest.voters() {
            if voter.id == self.core.id {
                indexes.push((self.core.last_log_id.index, self.core.last_log_id.term));
            } else {
                let matched = self.nodes.get(&voter.id).map(|node| node.matched).unwrap_or_default();
                indexes.push((matched.index, matched.term));
            }
        }

        let new_commit =
            quorum::calculate_new_commit_index(&indexes, self.core.commit_index, self.core.current_term);
        if new_commit <= self.core.commit_index {
            return Ok(());
        }
        tracing::debug!(commit_index = new_commit, "commit index advanced");
        self.core.commit_index = new_commit;
        self.core.membership.commit(new_commit);
        self.core.report_metrics();

        // Let the streams propagate the new commit index.
        self.broadcast_commit_index();

        // Hand newly committed entries to the state machine.
        self.process_committed_entries().await?;

        // Resolve a committed configuration change future.
        if let Some((index, _)) = &self.pending_membership {
            if *index <= new_commit {
                let (index, tx) = self.pending_membership.take().expect("checked pending membership");
                let _ = tx.send(Ok(index));
            }
        }
        Ok(())
    }

    /// Act on the configuration state after a commit advance: retire streams
    /// for removed peers, step down if we removed ourselves, promote a caught
    /// up staging server, and un-park queued membership changes. Returns true
    /// when a new configuration entry was appended and the commit pipeline
    /// must run again.
    async fn handle_config_commitment(&mut self) -> bool {
        if !self.core.membership.is_stable() {
            return false;
        }
        let committed_index = self.core.membership.committed_index;

        // Retire replication streams for peers no longer in the membership,
        // once they have replicated the config which removes them.
        let latest = self.core.membership.latest.clone();
        let to_remove: Vec<ServerId> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !latest.contains(id))
            .filter_map(|(id, node)| {
                if node.matched.index >= committed_index {
                    Some(id.clone())
                } else {
                    node.remove_after_commit = Some(committed_index);
                    None
                }
            })
            .collect();
        for id in to_remove {
            tracing::debug!(target=%id, "removing peer from replication pool");
            if let Some(node) = self.nodes.remove(&id) {
                let _ = node.repl.repl_tx.send(RaftEvent::Terminate);
            }
        }

        // Spawn streams for peers which joined in this configuration.
        let to_add: Vec<Server> = latest
            .servers
            .iter()
            .filter(|server| server.id != self.core.id && !self.nodes.contains_key(&server.id))
            .cloned()
            .collect();
        for server in to_add {
            let state = self.spawn_replication_stream(server);
            self.nodes.insert(state.server.id.clone(), state);
        }

        // A leader which is no longer a member steps down once the removal
        // commits.
        if self.is_stepping_down && !latest.contains(&self.core.id) {
            if self.core.config.shutdown_on_remove {
                tracing::info!(id=%self.core.id, "removed from cluster, shutting down");
                self.core.set_target_state(State::Shutdown);
            } else {
                tracing::info!(id=%self.core.id, "removed from cluster, reverting to (non-voting) follower");
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.set_target_state(State::Follower);
            }
            return false;
        }

        if self.check_staging_promotion().await {
            return true;
        }
        self.process_queued_changes().await
    }

    /// Promote a staging server whose log has caught up with the leader's.
    /// Returns true when a promotion entry was appended.
    async fn check_staging_promotion(&mut self) -> bool {
        let staging = match self.core.membership.latest.staging() {
            Some(server) => server.id.clone(),
            None => return false,
        };
        let caught_up = self
            .nodes
            .get(&staging)
            .map(|node| node.matched.index >= self.core.membership.latest_index)
            .unwrap_or(false);
        if caught_up {
            tracing::info!(target=%staging, "staging server caught up, promoting to voter");
            self.append_membership_change(crate::membership::ConfigChange::Promote { id: staging }, None).await;
            return true;
        }
        false
    }

    /// Verify the leader lease: a quorum of voters must have answered within
    /// the lease window, else this leader may be partitioned away and must
    /// step down to bound stale reads.
    pub(super) fn check_leader_lease(&mut self) {
        let lease = Duration::from_millis(self.core.config.leader_lease_timeout);
        let mut contacted = 0;
        let mut voters = 0;
        for voter in self.core.membership.latest.voters() {
            voters += 1;
            if voter.id == self.core.id {
                contacted += 1;
                continue;
            }
            if let Some(node) = self.nodes.get(&voter.id) {
                if node.last_contact.elapsed() <= lease {
                    contacted += 1;
                }
            }
        }
        if voters == 0 {
            return;
        }
        if contacted >= quorum::majority_of(voters) {
            self.core.last_contact = Some(Instant::now());
            return;
        }
        tracing::warn!(id=%self.core.id, contacted, voters, "leader lease lost, stepping down");
        self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        self.core.set_target_state(State::Follower);
    }
}
