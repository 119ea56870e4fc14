use std::sync::Arc;

use tokio::sync::oneshot;

use crate::core::client::ClientRequestEntry;
use crate::core::FollowerState;
use crate::core::LeaderState;
use crate::core::QueuedChange;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::Fsm;
use crate::membership::ConfigChange;
use crate::membership::Membership;
use crate::raft::EntryPayload;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::transport::RaftTransport;
use crate::LogId;

impl<'a, F, N, L, S, P> FollowerState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// Handle a live bootstrap request.
    ///
    /// Valid only on a pristine node: no term, no log, no snapshot, and no
    /// observed leader. Writes the initial configuration entry and starts the
    /// first election (or assumes leadership directly when the local node is
    /// the only voter).
    #[tracing::instrument(level = "debug", skip(self, membership))]
    pub(super) async fn handle_bootstrap(&mut self, membership: Membership) -> RaftResult<()> {
        membership.validate().map_err(RaftError::Membership)?;
        let pristine = self.core.last_log_id.index == 0
            && self.core.current_term == 0
            && self.core.last_vote_term == 0
            && self.core.snapshot_last_log_id.index == 0
            && self.core.current_leader.is_none();
        if !pristine {
            return Err(RaftError::CantBootstrap);
        }

        self.core.update_current_term(1);
        self.core.save_current_term().await?;
        let id = self.core.id.clone();
        self.core.save_vote(1, &id).await?;

        let entry = crate::raft::Entry::<F::Data> {
            log_id: LogId::new(1, 1),
            payload: EntryPayload::Configuration {
                membership: membership.clone(),
            },
        };
        self.core
            .log_store
            .store_logs(std::slice::from_ref(&entry))
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;
        self.core.first_index = 1;
        self.core.membership.append(1, membership);

        let single_voter_self =
            self.core.membership.latest.voter_count() == 1 && self.core.membership.latest.is_voter(&self.core.id);
        if single_voter_self {
            self.core.set_target_state(State::Leader);
        } else {
            self.core.set_target_state(State::Candidate);
        }
        self.core.report_metrics();
        Ok(())
    }
}

impl<'a, F, N, L, S, P> LeaderState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// Handle a membership change request.
    ///
    /// Only one configuration entry may be uncommitted at a time; requests
    /// arriving while one is in flight are parked and processed in arrival
    /// order once it commits.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(change=?change, prev_index))]
    pub(super) async fn handle_change_membership(
        &mut self,
        change: ConfigChange,
        prev_index: u64,
        tx: oneshot::Sender<RaftResult<u64>>,
    ) {
        if self.is_stepping_down {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: self.core.leader_hint(),
            }));
            return;
        }
        if !self.core.membership.is_stable() || self.pending_membership.is_some() {
            tracing::debug!("parking membership change behind uncommitted configuration");
            self.queued_changes.push_back(QueuedChange { change, prev_index, tx });
            return;
        }
        self.append_membership_request(change, prev_index, tx).await;
        if let Err(err) = self.advance_commit_state().await {
            tracing::error!(error=?err, "error advancing commit state after membership change");
        }
    }

    /// Validate and append a single membership change.
    async fn append_membership_request(
        &mut self,
        change: ConfigChange,
        prev_index: u64,
        tx: oneshot::Sender<RaftResult<u64>>,
    ) {
        let latest_index = self.core.membership.latest_index;
        if prev_index != 0 && prev_index != latest_index {
            let _ = tx.send(Err(RaftError::ConfigurationChanged { prev_index, latest_index }));
            return;
        }

        // A voter whose log is far behind joins as staging first; the leader
        // promotes it with a second configuration entry once it catches up.
        let change = self.stage_if_behind(change);

        self.append_membership_change(change, Some(tx)).await;
    }

    fn stage_if_behind(&self, change: ConfigChange) -> ConfigChange {
        let (id, address) = match &change {
            ConfigChange::AddVoter { id, address } => (id.clone(), address.clone()),
            _ => return change,
        };
        // Already a caught-up member: no staging detour.
        let matched = self.nodes.get(&id).map(|node| node.matched.index).unwrap_or(0);
        let lag = self.core.last_log_id.index.saturating_sub(matched);
        if lag <= self.core.config.max_append_entries {
            return change;
        }
        tracing::info!(target=%id, lag, "adding voter as staging until its log catches up");
        ConfigChange::AddStaging { id, address }
    }

    /// Compute, append and begin replicating a new configuration.
    pub(super) async fn append_membership_change(
        &mut self,
        change: ConfigChange,
        tx: Option<oneshot::Sender<RaftResult<u64>>>,
    ) {
        let next = match self.core.membership.latest.next(&change) {
            Ok(next) => next,
            Err(err) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(RaftError::Membership(err)));
                }
                return;
            }
        };

        if !next.contains(&self.core.id) {
            self.is_stepping_down = true;
        }

        let entry = match self
            .append_payload_to_log(EntryPayload::Configuration {
                membership: next.clone(),
            })
            .await
        {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(err));
                }
                return;
            }
        };
        let index = entry.log_id.index;

        // The appended configuration governs immediately, before it commits.
        self.core.membership.append(index, next);
        self.core.report_metrics();
        self.sync_added_replication_streams();

        if let Some(tx) = tx {
            self.pending_membership = Some((index, tx));
        }
        self.awaiting_committed.push_back(ClientRequestEntry {
            entry: Arc::new(entry),
            responder: None,
        });
        self.notify_replication();
    }

    /// Spawn replication streams for servers newly present in the latest
    /// configuration. Removal of replicated-out peers waits for commitment.
    fn sync_added_replication_streams(&mut self) {
        let to_add: Vec<_> = self
            .core
            .membership
            .latest
            .servers
            .iter()
            .filter(|server| server.id != self.core.id && !self.nodes.contains_key(&server.id))
            .cloned()
            .collect();
        for server in to_add {
            tracing::debug!(target=%server.id, "spawning replication stream for new member");
            let state = self.spawn_replication_stream(server);
            self.nodes.insert(state.server.id.clone(), state);
        }
    }

    /// Un-park queued membership changes now that the configuration is
    /// stable again. Returns true once one of them has been appended.
    pub(super) async fn process_queued_changes(&mut self) -> bool {
        while self.core.membership.is_stable() && self.pending_membership.is_none() {
            let queued = match self.queued_changes.pop_front() {
                Some(queued) => queued,
                None => return false,
            };
            self.append_membership_request(queued.change, queued.prev_index, queued.tx).await;
        }
        true
    }
}
