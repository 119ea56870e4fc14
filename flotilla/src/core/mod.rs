//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio::time::Interval;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::SNAPSHOT_VERSION;
use crate::core::client::ClientRequestEntry;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::ApplyResponder;
use crate::fsm::Fsm;
use crate::fsm::FsmCapture;
use crate::fsm::FsmMsg;
use crate::fsm::FsmProgress;
use crate::fsm::FsmRunner;
use crate::membership::ConfigChange;
use crate::membership::Membership;
use crate::membership::MembershipState;
use crate::membership::Server;
use crate::metrics::RaftMetrics;
use crate::observer::Observation;
use crate::observer::ObserverRegistry;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::MembershipInfo;
use crate::raft::RaftMsg;
use crate::raft::RpcHeader;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::LogStore;
use crate::storage::SnapshotMeta;
use crate::storage::SnapshotSink;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::storage::KEY_CURRENT_TERM;
use crate::storage::KEY_LAST_VOTE_CAND;
use crate::storage::KEY_LAST_VOTE_TERM;
use crate::transport::RaftTransport;
use crate::LogId;
use crate::ServerId;
use crate::SnapshotId;

/// The core type implementing the Raft protocol.
///
/// A single task owns this value and with it every piece of mutable state
/// which affects correctness: role, term, vote, commit index and membership.
/// Auxiliary tasks (replication streams, the FSM runner, snapshot workers)
/// hold only channel endpoints.
pub(crate) struct RaftCore<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// This node's id.
    id: ServerId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The committed and latest cluster membership configurations.
    membership: MembershipState,
    log_store: Arc<L>,
    stable_store: Arc<S>,
    snapshot_store: Arc<P>,
    transport: Arc<N>,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    commit_index: u64,
    /// The log id of the highest entry applied to the state machine, as
    /// reported back by the FSM runner.
    last_applied: LogId,
    /// The highest index already handed to the FSM runner. Runs ahead of
    /// `last_applied` while the runner works through its queue.
    applying_index: u64,

    /// The current term. Increases monotonically within a process lifetime.
    current_term: u64,
    /// The id of the current cluster leader, as far as this node knows.
    current_leader: Option<ServerId>,
    /// The term in which this node last granted a vote.
    last_vote_term: u64,
    /// The candidate which received this node's vote in `last_vote_term`.
    last_vote_cand: Option<ServerId>,

    /// The last entry appended to the log.
    last_log_id: LogId,
    /// Cached first index of the log, 0 while the log is empty.
    first_index: u64,

    /// The log id covered by the most recent local snapshot.
    snapshot_last_log_id: LogId,
    /// The node's current snapshot activity, if any.
    snapshot_state: Option<SnapshotState>,
    /// Futures of manual snapshot requests awaiting the in-flight snapshot.
    pending_snapshot_txs: Vec<oneshot::Sender<RaftResult<SnapshotMeta>>>,

    tx_fsm: mpsc::UnboundedSender<FsmMsg<F>>,
    rx_fsm_progress: mpsc::UnboundedReceiver<FsmProgress>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::Receiver<RaftMsg<F::Data, F::Response>>,
    rx_rpc: mpsc::UnboundedReceiver<RaftMsg<F::Data, F::Response>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    tx_leader: watch::Sender<bool>,
    observers: ObserverRegistry,
    rx_shutdown: oneshot::Receiver<()>,

    /// The last time a heartbeat was received from a valid leader, or for a
    /// leader, the last time a lease quorum was confirmed.
    last_contact: Option<Instant>,
    /// The deadline of the running election timer.
    next_election_timeout: Option<Instant>,
    /// The periodic snapshot check.
    snapshot_tick: Interval,
}

impl<F, N, L, S, P> RaftCore<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: ServerId,
        config: Arc<Config>,
        fsm: F,
        log_store: Arc<L>,
        stable_store: Arc<S>,
        snapshot_store: Arc<P>,
        transport: Arc<N>,
        rx_api: mpsc::Receiver<RaftMsg<F::Data, F::Response>>,
        rx_rpc: mpsc::UnboundedReceiver<RaftMsg<F::Data, F::Response>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        tx_leader: watch::Sender<bool>,
        observers: ObserverRegistry,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_fsm, rx_fsm_progress, _fsm_handle) = FsmRunner::spawn(fsm, LogId::default());
        let (tx_compaction, rx_compaction) = mpsc::channel(8);
        let snapshot_tick = interval(Duration::from_millis(config.snapshot_interval.max(1)));
        let this = Self {
            id,
            config,
            membership: MembershipState::default(),
            log_store,
            stable_store,
            snapshot_store,
            transport,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            applying_index: 0,
            current_term: 0,
            current_leader: None,
            last_vote_term: 0,
            last_vote_cand: None,
            last_log_id: LogId::default(),
            first_index: 0,
            snapshot_last_log_id: LogId::default(),
            snapshot_state: None,
            pending_snapshot_txs: Vec::new(),
            tx_fsm,
            rx_fsm_progress,
            tx_compaction,
            rx_compaction,
            rx_api,
            rx_rpc,
            tx_metrics,
            tx_leader,
            observers,
            rx_shutdown,
            last_contact: None,
            next_election_timeout: None,
            snapshot_tick,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("raft-core")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");
        self.restore_initial_state().await?;

        if self.config.start_as_leader {
            self.target_state = State::Leader;
        }
        tracing::debug!(state=?self.target_state, "initial state resolved");

        // The Raft core assumes a few different roles based on cluster state.
        // Control is delegated to the state controllers below, each of which
        // returns only on a role change or fatal error.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!(id=%self.id, "node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Load persisted state and the latest snapshot, if any.
    async fn restore_initial_state(&mut self) -> RaftResult<()> {
        self.current_term = self
            .stable_store
            .get_u64(KEY_CURRENT_TERM)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?
            .unwrap_or(0);
        self.last_vote_term = self
            .stable_store
            .get_u64(KEY_LAST_VOTE_TERM)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?
            .unwrap_or(0);
        self.last_vote_cand = self
            .stable_store
            .get(KEY_LAST_VOTE_CAND)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());

        self.first_index = self.log_store.first_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let last_index = self.log_store.last_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        if last_index > 0 {
            let entry = self
                .log_store
                .get_log(last_index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?
                .ok_or(RaftError::LogNotFound { index: last_index })?;
            self.last_log_id = entry.log_id;
        }

        // Restore from the most recent snapshot before replaying the log tail.
        let snapshots = self.snapshot_store.list().await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(meta) = snapshots.first() {
            tracing::info!(snapshot=%meta.last_log_id, "restoring state machine from snapshot");
            let (_, source) =
                self.snapshot_store.open(&meta.id).await.map_err(|err| self.map_fatal_storage_error(err))?;
            let (tx, rx) = oneshot::channel();
            let _ = self.tx_fsm.send(FsmMsg::Restore {
                log_id: meta.last_log_id,
                source,
                tx,
            });
            rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)?;

            self.last_applied = meta.last_log_id;
            self.applying_index = meta.last_log_id.index;
            self.commit_index = meta.last_log_id.index;
            self.snapshot_last_log_id = meta.last_log_id;
            self.membership = MembershipState {
                committed: meta.membership.clone(),
                committed_index: meta.membership_index,
                latest: meta.membership.clone(),
                latest_index: meta.membership_index,
            };
            if self.last_log_id.index < meta.last_log_id.index {
                self.last_log_id = meta.last_log_id;
            }
            // The snapshot seeds the term when the stable store is behind it.
            if self.current_term < meta.last_log_id.term {
                self.current_term = meta.last_log_id.term;
                self.save_current_term().await?;
            }
        }

        // Adopt any membership appended after the snapshot boundary.
        let scan_from = std::cmp::max(self.first_index, self.snapshot_last_log_id.index + 1);
        if self.first_index > 0 && scan_from <= self.last_log_id.index {
            self.scan_membership_in_range(scan_from, self.last_log_id.index).await?;
        }
        self.membership.commit(self.commit_index);

        self.report_metrics();
        Ok(())
    }

    /// Scan the log range `[start, stop]` for configuration entries and adopt
    /// the latest.
    async fn scan_membership_in_range(&mut self, start: u64, stop: u64) -> RaftResult<()> {
        let mut at = start;
        while at <= stop {
            let batch_stop = std::cmp::min(stop, at + 1024);
            let entries = self
                .log_store
                .get_log_range(at, batch_stop + 1)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            for entry in entries.iter() {
                self.adopt_membership_from_entry(entry);
            }
            at = batch_stop + 1;
        }
        Ok(())
    }

    /// Record a configuration carried by the given entry, translating the
    /// legacy address-keyed entry types.
    pub(self) fn adopt_membership_from_entry(&mut self, entry: &Entry<F::Data>) {
        let next = match &entry.payload {
            EntryPayload::Configuration { membership } => Some(membership.clone()),
            EntryPayload::AddPeer { address } => self
                .membership
                .latest
                .next(&ConfigChange::AddVoter {
                    id: address.clone(),
                    address: address.clone(),
                })
                .map_err(|err| tracing::warn!(error=%err, "ignoring invalid legacy add-peer entry"))
                .ok(),
            EntryPayload::RemovePeer { address } => self
                .membership
                .latest
                .next(&ConfigChange::RemoveServer { id: address.clone() })
                .map_err(|err| tracing::warn!(error=%err, "ignoring invalid legacy remove-peer entry"))
                .ok(),
            _ => None,
        };
        if let Some(membership) = next {
            self.membership.append(entry.log_id.index, membership);
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    pub(self) fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id.clone(),
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            commit_index: self.commit_index,
            current_leader: self.current_leader.clone(),
            membership: self.membership.latest.clone(),
            membership_index: self.membership.latest_index,
            snapshot: self.snapshot_last_log_id,
            last_contact: self.last_contact.map(|i| i.into_std()),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=%self.id, "error reporting metrics");
        }
    }

    /// Persist the current term.
    pub(self) async fn save_current_term(&mut self) -> RaftResult<()> {
        self.stable_store
            .set_u64(KEY_CURRENT_TERM, self.current_term)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Persist a granted vote. Must complete before the vote is released to
    /// the candidate.
    pub(self) async fn save_vote(&mut self, term: u64, candidate: &str) -> RaftResult<()> {
        self.last_vote_term = term;
        self.last_vote_cand = Some(candidate.to_string());
        self.stable_store
            .set_u64(KEY_LAST_VOTE_TERM, term)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.stable_store
            .set(KEY_LAST_VOTE_CAND, candidate.as_bytes())
            .await
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the core's target state, upholding the role invariants.
    pub(self) fn set_target_state(&mut self, target_state: State) {
        if target_state == self.target_state {
            return;
        }
        tracing::debug!(id=%self.id, from=?self.target_state, to=?target_state, "state transition");
        self.target_state = target_state;
        self.observers.observe(Observation::State {
            id: self.id.clone(),
            state: target_state,
        });
        self.report_metrics();
    }

    /// Get the next election timeout, generating a new value if not set.
    pub(self) fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a new randomized deadline for the next election timeout.
    ///
    /// If `heartbeat` is true, the call records contact from a valid leader.
    pub(self) fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_contact = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    pub(self) fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        let new = match update {
            UpdateCurrentLeader::ThisNode => Some(self.id.clone()),
            UpdateCurrentLeader::OtherNode(target) => Some(target),
            UpdateCurrentLeader::Unknown => None,
        };
        if new != self.current_leader {
            self.current_leader = new;
            self.observers.observe(Observation::Leader {
                leader: self.current_leader.clone(),
            });
            self.report_metrics();
        }
    }

    /// Adopt a newer term, clearing the in-memory vote tracking.
    pub(self) fn update_current_term(&mut self, new_term: u64) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.observers.observe(Observation::Term { term: new_term });
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage error.
    pub(self) fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error=?err, id=%self.id, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Storage(err)
    }

    /// The last observed leader as a server record, for `NotLeader` hints.
    pub(self) fn leader_hint(&self) -> Option<Server> {
        let leader = self.current_leader.as_ref()?;
        self.membership.latest.server(leader).cloned()
    }

    /// Validate an inbound RPC header.
    ///
    /// The version must be within the window this build can speak, and no
    /// more than one version behind the locally configured protocol.
    pub(self) fn check_rpc_header(&self, header: &RpcHeader) -> RaftResult<()> {
        let got = header.protocol_version;
        if got < crate::config::PROTOCOL_VERSION_MIN || got > crate::config::PROTOCOL_VERSION_MAX {
            return Err(RaftError::ProtocolVersion {
                got,
                min: crate::config::PROTOCOL_VERSION_MIN,
                max: crate::config::PROTOCOL_VERSION_MAX,
            });
        }
        if got + 1 < self.config.protocol_version {
            return Err(RaftError::ProtocolVersion {
                got,
                min: self.config.protocol_version - 1,
                max: crate::config::PROTOCOL_VERSION_MAX,
            });
        }
        Ok(())
    }

    /// The header to stamp on outbound RPCs.
    pub(crate) fn rpc_header(&self) -> RpcHeader {
        RpcHeader::new(self.config.protocol_version)
    }

    /// Handle a progress report from the FSM runner.
    pub(self) fn handle_fsm_progress(&mut self, progress: FsmProgress) {
        match progress {
            FsmProgress::Applied(log_id) => {
                self.last_applied = log_id;
                self.report_metrics();
            }
            FsmProgress::Fatal(reason) => {
                tracing::error!(%reason, "state machine reported a fatal error, shutting down");
                self.set_target_state(State::Shutdown);
            }
        }
    }

    /// Reply to a membership info request. Served from any role.
    pub(self) fn handle_get_membership(&self, tx: oneshot::Sender<RaftResult<MembershipInfo>>) {
        let _ = tx.send(Ok(MembershipInfo {
            committed: self.membership.committed.clone(),
            committed_index: self.membership.committed_index,
            latest: self.membership.latest.clone(),
            latest_index: self.membership.latest_index,
        }));
    }

    /// Hand every committed-but-not-yet-enqueued entry to the FSM runner.
    ///
    /// This is the apply path for entries this node did not append itself as
    /// leader: replicated entries on followers and pre-term entries on a new
    /// leader.
    pub(self) async fn apply_committed_entries(&mut self) -> RaftResult<()> {
        let stop = std::cmp::min(self.commit_index, self.last_log_id.index);
        if stop <= self.applying_index {
            return Ok(());
        }
        let entries = self
            .log_store
            .get_log_range(self.applying_index + 1, stop + 1)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if entries.is_empty() {
            return Ok(());
        }
        let batch: Vec<(Arc<Entry<F::Data>>, Option<ApplyResponder<F::Response>>)> =
            entries.into_iter().map(|entry| (Arc::new(entry), None)).collect();
        self.applying_index = batch.last().map(|(e, _)| e.log_id.index).unwrap_or(self.applying_index);
        let _ = self.tx_fsm.send(FsmMsg::Apply { batch });
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Snapshots /////////////////////////////////////////////////////////////

    /// Handle a manual snapshot request, from any role.
    pub(self) fn handle_take_snapshot(&mut self, tx: oneshot::Sender<RaftResult<SnapshotMeta>>) {
        self.pending_snapshot_txs.push(tx);
        self.start_snapshot();
    }

    /// Run the automatic snapshot check.
    pub(self) fn trigger_snapshot_if_needed(&mut self) {
        if self.pending_snapshot_txs.is_empty() {
            let uncompacted = self.last_applied.index.saturating_sub(std::cmp::max(self.first_index, 1) - 1);
            if self.last_applied.index == 0 || uncompacted < self.config.snapshot_threshold {
                return;
            }
        }
        self.start_snapshot();
    }

    /// Kick off a snapshot worker unless one is already running.
    fn start_snapshot(&mut self) {
        match self.snapshot_state {
            // The pending txs will be resolved when the running worker
            // finishes.
            Some(SnapshotState::Snapshotting) => return,
            // Streaming in a snapshot from the leader supersedes local
            // snapshotting entirely.
            Some(SnapshotState::Streaming { .. }) => {
                for tx in self.pending_snapshot_txs.drain(..) {
                    let _ = tx.send(Err(RaftError::NothingNewToSnapshot));
                }
                return;
            }
            None => {}
        }

        self.snapshot_state = Some(SnapshotState::Snapshotting);
        let (capture_tx, capture_rx) = oneshot::channel();
        let _ = self.tx_fsm.send(FsmMsg::Snapshot {
            min_index: self.snapshot_last_log_id.index,
            tx: capture_tx,
        });

        let snapshot_store = self.snapshot_store.clone();
        let membership = self.membership.committed.clone();
        let membership_index = self.membership.committed_index;
        let tx_compaction = self.tx_compaction.clone();
        tokio::spawn(
            async move {
                let update = match build_snapshot::<F, P>(capture_rx, snapshot_store, membership, membership_index).await {
                    Ok(meta) => SnapshotUpdate::Complete(meta),
                    Err(SnapshotFailure::NothingNew) => SnapshotUpdate::Failed(SnapshotFailure::NothingNew),
                    Err(err) => {
                        tracing::error!(error=?err, "error while creating snapshot");
                        SnapshotUpdate::Failed(err)
                    }
                };
                let _ = tx_compaction.send(update).await;
            }
            .instrument(tracing::debug_span!("snapshot-worker")),
        );
    }

    /// Apply the outcome of a snapshot worker.
    pub(self) async fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let Some(SnapshotState::Snapshotting) = &self.snapshot_state {
            self.snapshot_state = None;
        }
        match update {
            SnapshotUpdate::Complete(meta) => {
                self.snapshot_last_log_id = meta.last_log_id;
                for tx in self.pending_snapshot_txs.drain(..) {
                    let _ = tx.send(Ok(meta.clone()));
                }
                if let Err(err) = self.compact_log(meta.last_log_id.index).await {
                    tracing::error!(error=?err, "error compacting log after snapshot");
                }
                self.report_metrics();
            }
            SnapshotUpdate::Failed(failure) => {
                for tx in self.pending_snapshot_txs.drain(..) {
                    let _ = tx.send(Err(failure.clone().into_raft_error()));
                }
            }
        }
    }

    /// Delete log entries covered by the snapshot at `snapshot_index`,
    /// retaining the configured number of trailing entries.
    async fn compact_log(&mut self, snapshot_index: u64) -> RaftResult<()> {
        let cutoff = snapshot_index.saturating_sub(self.config.trailing_logs);
        if cutoff == 0 || self.first_index == 0 || self.first_index > cutoff {
            return Ok(());
        }
        tracing::debug!(from = self.first_index, to = cutoff, "compacting log");
        self.log_store
            .delete_range(self.first_index, cutoff)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.first_index = if self.last_log_id.index > cutoff { cutoff + 1 } else { 0 };
        Ok(())
    }
}

/// Build a snapshot from a pending FSM capture and persist it to the store.
async fn build_snapshot<F, P>(
    capture_rx: oneshot::Receiver<RaftResult<FsmCapture<F>>>,
    snapshot_store: Arc<P>,
    membership: Membership,
    membership_index: u64,
) -> Result<SnapshotMeta, SnapshotFailure>
where
    F: Fsm,
    P: SnapshotStore,
{
    use crate::fsm::FsmSnapshot;

    let capture = match capture_rx.await {
        Ok(Ok(capture)) => capture,
        Ok(Err(RaftError::NothingNewToSnapshot)) => return Err(SnapshotFailure::NothingNew),
        Ok(Err(err)) => return Err(SnapshotFailure::Other(err.to_string())),
        Err(_) => return Err(SnapshotFailure::Other("state machine runner stopped".into())),
    };

    let mut sink: Box<dyn SnapshotSink> = snapshot_store
        .create(SNAPSHOT_VERSION, capture.log_id, membership, membership_index)
        .await
        .map_err(|err| SnapshotFailure::Other(err.to_string()))?;
    let id: SnapshotId = sink.id();

    let mut snapshot = capture.snapshot;
    let persist_res = snapshot.persist(sink.as_mut()).await;
    snapshot.release().await;
    match persist_res {
        Ok(()) => {
            use tokio::io::AsyncWriteExt;
            sink.shutdown().await.map_err(|err| SnapshotFailure::Other(err.to_string()))?;
        }
        Err(err) => {
            let _ = sink.cancel().await;
            return Err(SnapshotFailure::Other(err.to_string()));
        }
    }

    let (meta, _) = snapshot_store.open(&id).await.map_err(|err| SnapshotFailure::Other(err.to_string()))?;
    Ok(meta)
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(ServerId),
    ThisNode,
}

/// The current snapshot activity of the Raft node.
pub(self) enum SnapshotState {
    /// A local snapshot worker is running.
    Snapshotting,
    /// A snapshot is streaming in from the leader.
    Streaming {
        /// The offset of the next byte expected by the sink.
        offset: u64,
        /// The leader-side id of the stream, used to detect restarts.
        stream_id: SnapshotId,
        /// The open sink in the local snapshot store.
        sink: Box<dyn SnapshotSink>,
    },
}

/// The outcome of a snapshot worker.
pub(self) enum SnapshotUpdate {
    Complete(SnapshotMeta),
    Failed(SnapshotFailure),
}

#[derive(Clone, Debug)]
pub(self) enum SnapshotFailure {
    NothingNew,
    Other(String),
}

impl SnapshotFailure {
    fn into_raft_error(self) -> RaftError {
        match self {
            SnapshotFailure::NothingNew => RaftError::NothingNewToSnapshot,
            SnapshotFailure::Other(reason) => RaftError::Storage(anyhow::anyhow!(reason)),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader, or passively waiting to
    /// be added to a cluster.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
pub(self) struct LeaderState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    pub(super) core: &'a mut RaftCore<F, N, L, S, P>,
    /// The replication state of every peer in the latest membership.
    pub(super) nodes: BTreeMap<ServerId, ReplicationState>,
    /// Client requests appended locally, awaiting cluster commitment.
    pub(super) awaiting_committed: VecDeque<ClientRequestEntry<F::Data, F::Response>>,
    /// The in-flight membership change future, resolved when its entry
    /// commits.
    pub(super) pending_membership: Option<(u64, oneshot::Sender<RaftResult<u64>>)>,
    /// Membership change requests parked until the latest config commits.
    pub(super) queued_changes: VecDeque<QueuedChange>,
    /// Set once this leader has appended a config which removes itself.
    pub(super) is_stepping_down: bool,

    /// The stream of events coming from the replication tasks.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    /// The cloneable sender handed to each replication task.
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,
}

/// A membership change request parked behind an uncommitted configuration.
pub(self) struct QueuedChange {
    pub change: ConfigChange,
    pub prev_index: u64,
    pub tx: oneshot::Sender<RaftResult<u64>>,
}

/// The state of one replication stream from the leader's perspective.
pub(self) struct ReplicationState {
    pub server: Server,
    pub matched: LogId,
    /// Remove this stream once the config entry at the given index commits
    /// and the peer has replicated it.
    pub remove_after_commit: Option<u64>,
    /// The last time this peer answered any RPC, for the leader lease.
    pub last_contact: Instant,
    pub repl: ReplicationStream,
}

impl<'a, F, N, L, S, P> LeaderState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    pub(self) fn new(core: &'a mut RaftCore<F, N, L, S, P>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            awaiting_committed: VecDeque::new(),
            pending_membership: None,
            queued_changes: VecDeque::new(),
            is_stepping_down: false,
            replication_rx,
            replication_tx,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams for every known peer.
        let targets: Vec<Server> = self
            .core
            .membership
            .latest
            .servers
            .iter()
            .filter(|server| server.id != self.core.id)
            .cloned()
            .collect();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(state.server.id.clone(), state);
        }

        // Setup state as leader.
        self.core.next_election_timeout = None;
        self.core.last_contact = Some(Instant::now());
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        let _ = self.core.tx_leader.send(true);
        self.core.report_metrics();

        // Per §8, commit an initial entry as part of becoming the leader.
        self.commit_initial_leader_entry().await?;

        let mut lease_tick = interval(Duration::from_millis(self.core.config.leader_lease_timeout.max(1)));
        let mut commit_tick = interval(Duration::from_millis(self.core.config.commit_timeout.max(1)));

        loop {
            if !self.core.target_state.is_leader() {
                self.abandon_leadership();
                return Ok(());
            }

            tokio::select! {
                Some(msg) = self.core.rx_rpc.recv() => self.handle_rpc_msg(msg).await,
                Some(msg) = self.core.rx_api.recv() => self.handle_api_msg(msg).await,
                Some(event) = self.replication_rx.recv() => self.handle_replica_event(event).await?,
                Some(progress) = self.core.rx_fsm_progress.recv() => self.core.handle_fsm_progress(progress),
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                _ = lease_tick.tick() => self.check_leader_lease(),
                _ = commit_tick.tick() => self.broadcast_commit_index(),
                _ = self.core.snapshot_tick.tick() => self.core.trigger_snapshot_if_needed(),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    /// Handle an inbound RPC while leader.
    async fn handle_rpc_msg(&mut self, msg: RaftMsg<F::Data, F::Response>) {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc).await);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
            }
            _ => unreachable!("client message on the rpc queue"),
        }
    }

    /// Handle a client operation while leader.
    async fn handle_api_msg(&mut self, msg: RaftMsg<F::Data, F::Response>) {
        match msg {
            RaftMsg::Apply { data, extensions, tx } => self.handle_apply(data, extensions, tx).await,
            RaftMsg::Barrier { tx } => self.handle_barrier(tx).await,
            RaftMsg::VerifyLeader { tx } => self.handle_verify_leader(tx).await,
            RaftMsg::ChangeMembership { change, prev_index, tx } => {
                self.handle_change_membership(change, prev_index, tx).await
            }
            RaftMsg::TakeSnapshot { tx } => self.core.handle_take_snapshot(tx),
            RaftMsg::GetMembership { tx } => self.core.handle_get_membership(tx),
            RaftMsg::Bootstrap { tx, .. } => {
                let _ = tx.send(Err(RaftError::CantBootstrap));
            }
            _ => unreachable!("rpc message on the client queue"),
        }
    }

    /// Re-broadcast the commit index so idle followers converge without
    /// waiting for the next appended entry.
    fn broadcast_commit_index(&mut self) {
        for node in self.nodes.values() {
            let _ = node.repl.repl_tx.send(RaftEvent::UpdateCommitIndex {
                commit_index: self.core.commit_index,
            });
        }
    }

    /// Fail everything which only a leader can finish, then stop replication.
    fn abandon_leadership(&mut self) {
        tracing::info!(id=%self.core.id, state=?self.core.target_state, "leadership abandoned");
        for node in self.nodes.values() {
            let _ = node.repl.repl_tx.send(RaftEvent::Terminate);
        }
        for req in self.awaiting_committed.drain(..) {
            if let Some(responder) = req.responder {
                responder.reject(RaftError::LeadershipLost);
            }
        }
        if let Some((_, tx)) = self.pending_membership.take() {
            let _ = tx.send(Err(RaftError::LeadershipLost));
        }
        for queued in self.queued_changes.drain(..) {
            let _ = queued.tx.send(Err(RaftError::LeadershipLost));
        }
        let _ = self.core.tx_leader.send(false);
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
pub(self) struct CandidateState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    core: &'a mut RaftCore<F, N, L, S, P>,
    /// The number of votes granted so far this term, self included.
    votes_granted: usize,
    /// The number of votes needed to win the election.
    votes_needed: usize,
}

impl<'a, F, N, L, S, P> CandidateState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    pub(self) fn new(core: &'a mut RaftCore<F, N, L, S, P>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup a new term: bump, vote for self, reset the timer.
            self.votes_granted = 1;
            self.votes_needed = crate::quorum::majority_of(self.core.membership.latest.voter_count());
            self.core.update_current_term(self.core.current_term + 1);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_current_term().await?;
            let term = self.core.current_term;
            let id = self.core.id.clone();
            self.core.save_vote(term, &id).await?;
            self.core.update_next_election_timeout(false);
            self.core.report_metrics();
            tracing::info!(id=%self.core.id, term=self.core.current_term, "campaigning for leadership");

            let mut pending_votes = self.spawn_parallel_vote_requests();

            // A cluster whose only voter is this node wins instantly.
            if self.votes_granted >= self.votes_needed {
                self.core.set_target_state(State::Leader);
                continue;
            }

            // Inner processing loop for this term.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // The election timed out; start over with a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some(msg) = self.core.rx_rpc.recv() => {
                        match msg {
                            RaftMsg::AppendEntries { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::InstallSnapshot { rpc, tx } => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            _ => unreachable!("client message on the rpc queue"),
                        }
                    },
                    Some(msg) = self.core.rx_api.recv() => self.core.reject_api_msg(msg),
                    Some(progress) = self.core.rx_fsm_progress.recv() => self.core.handle_fsm_progress(progress),
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                    _ = self.core.snapshot_tick.tick() => self.core.trigger_snapshot_if_needed(),
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub(self) struct FollowerState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    core: &'a mut RaftCore<F, N, L, S, P>,
}

impl<'a, F, N, L, S, P> FollowerState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    pub(self) fn new(core: &'a mut RaftCore<F, N, L, S, P>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    ///
    /// A follower whose id carries no vote in the latest membership never
    /// times out into candidacy; it replicates passively until promoted.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let can_vote = self.core.membership.latest.is_voter(&self.core.id);
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout, if can_vote => {
                    tracing::info!(id=%self.core.id, "election timeout with no leader contact, becoming candidate");
                    self.core.set_target_state(State::Candidate);
                }
                Some(msg) = self.core.rx_rpc.recv() => {
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        _ => unreachable!("client message on the rpc queue"),
                    }
                },
                Some(msg) = self.core.rx_api.recv() => {
                    match msg {
                        RaftMsg::Bootstrap { membership, tx } => {
                            let _ = tx.send(self.handle_bootstrap(membership).await);
                        }
                        other => self.core.reject_api_msg(other),
                    }
                },
                Some(progress) = self.core.rx_fsm_progress.recv() => self.core.handle_fsm_progress(progress),
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update).await,
                _ = self.core.snapshot_tick.tick() => self.core.trigger_snapshot_if_needed(),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

impl<F, N, L, S, P> RaftCore<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// Reject a client operation which only a leader can serve, answering the
    /// role-independent requests inline.
    pub(self) fn reject_api_msg(&mut self, msg: RaftMsg<F::Data, F::Response>) {
        match msg {
            RaftMsg::Apply { tx, .. } => {
                let _ = tx.send(Err(RaftError::NotLeader {
                    leader: self.leader_hint(),
                }));
            }
            RaftMsg::Barrier { tx } => {
                let _ = tx.send(Err(RaftError::NotLeader {
                    leader: self.leader_hint(),
                }));
            }
            RaftMsg::VerifyLeader { tx } => {
                let _ = tx.send(Err(RaftError::NotLeader {
                    leader: self.leader_hint(),
                }));
            }
            RaftMsg::ChangeMembership { tx, .. } => {
                let _ = tx.send(Err(RaftError::NotLeader {
                    leader: self.leader_hint(),
                }));
            }
            RaftMsg::TakeSnapshot { tx } => self.handle_take_snapshot(tx),
            RaftMsg::GetMembership { tx } => self.handle_get_membership(tx),
            RaftMsg::Bootstrap { tx, .. } => {
                let _ = tx.send(Err(RaftError::CantBootstrap));
            }
            RaftMsg::AppendEntries { .. } | RaftMsg::RequestVote { .. } | RaftMsg::InstallSnapshot { .. } => {
                unreachable!("rpc message on the client queue")
            }
        }
    }
}
