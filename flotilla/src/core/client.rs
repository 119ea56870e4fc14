use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::ApplyResponder;
use crate::fsm::Fsm;
use crate::fsm::FsmMsg;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::ApplyResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::transport::RaftTransport;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;

/// A client request which has been appended to the log, awaiting commitment.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The appended entry, shared with the state machine runner.
    pub entry: Arc<Entry<D>>,
    /// The response channel, if a client is waiting on this entry.
    pub responder: Option<ApplyResponder<R>>,
}

impl<'a, F, N, L, S, P> LeaderState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// Commit the initial entry which new leaders are obligated to create
    /// when first coming to power, per §8. Entries from prior terms commit
    /// only transitively through this one.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        self.append_and_replicate(EntryPayload::Noop, None).await;
        Ok(())
    }

    /// Handle a client apply request.
    #[tracing::instrument(level = "debug", skip(self, data, extensions, tx))]
    pub(super) async fn handle_apply(
        &mut self,
        data: F::Data,
        extensions: Vec<u8>,
        tx: oneshot::Sender<RaftResult<ApplyResponse<F::Response>>>,
    ) {
        self.append_and_replicate(EntryPayload::Command { data, extensions }, Some(ApplyResponder::Command(tx)))
            .await;
    }

    /// Handle a barrier request: an empty entry whose application proves that
    /// every apply accepted before it has reached the state machine.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_barrier(&mut self, tx: oneshot::Sender<RaftResult<u64>>) {
        self.append_and_replicate(EntryPayload::Noop, Some(ApplyResponder::Index(tx))).await;
    }

    /// Append a payload locally and start replicating it.
    pub(super) async fn append_and_replicate(
        &mut self,
        payload: EntryPayload<F::Data>,
        responder: Option<ApplyResponder<F::Response>>,
    ) {
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(responder) = responder {
                    responder.reject(err);
                }
                return;
            }
        };
        let entry = Arc::new(entry);
        self.awaiting_committed.push_back(ClientRequestEntry {
            entry: entry.clone(),
            responder,
        });
        self.notify_replication();
        // A quorum of one (or zero peers at all) commits immediately.
        if let Err(err) = self.advance_commit_state().await {
            tracing::error!(error=?err, "error advancing commit index");
        }
    }

    /// Transform the given payload into an entry, assign an index and term,
    /// and append it to the log.
    ///
    /// A write failure here does not take the node down: the leader bumps its
    /// term and steps down instead, letting a healthy peer take over (§5.5
    /// style availability; the local store may recover later).
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<F::Data>) -> RaftResult<Entry<F::Data>> {
        let entry = Entry {
            log_id: LogId {
                term: self.core.current_term,
                index: self.core.last_log_id.index + 1,
            },
            payload,
        };
        if let Err(err) = self.core.log_store.store_logs(std::slice::from_ref(&entry)).await {
            tracing::error!(error=?err, "log store write failed on leader, stepping down");
            self.core.update_current_term(self.core.current_term + 1);
            let _ = self.core.save_current_term().await;
            self.core.set_target_state(State::Follower);
            return Err(RaftError::LeadershipLost);
        }
        self.core.last_log_id = entry.log_id;
        if self.core.first_index == 0 {
            self.core.first_index = entry.log_id.index;
        }
        self.core.report_metrics();
        Ok(entry)
    }

    /// Drain every awaiting request at or below the commit index into the
    /// state machine runner, gap-filling from storage for entries this leader
    /// did not append itself.
    pub(super) async fn process_committed_entries(&mut self) -> RaftResult<()> {
        let commit = self.core.commit_index;

        let mut batch: Vec<(Arc<Entry<F::Data>>, Option<ApplyResponder<F::Response>>)> = Vec::new();
        while let Some(front) = self.awaiting_committed.front() {
            if front.entry.log_id.index > commit {
                break;
            }
            let req = self.awaiting_committed.pop_front().expect("checked front");
            batch.push((req.entry, req.responder));
        }

        // Entries committed from before this leader's tenure are not in the
        // awaiting queue; fetch them from storage.
        let fill_stop = match batch.first() {
            Some((entry, _)) => entry.log_id.index,
            None => std::cmp::min(commit, self.core.last_log_id.index) + 1,
        };
        if self.core.applying_index + 1 < fill_stop {
            let entries = self
                .core
                .log_store
                .get_log_range(self.core.applying_index + 1, fill_stop)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            let mut fill: Vec<_> = entries.into_iter().map(|entry| (Arc::new(entry), None)).collect();
            fill.extend(batch);
            batch = fill;
        }

        // Skip anything already handed to the runner.
        batch.retain(|(entry, _)| entry.log_id.index > self.core.applying_index);
        if batch.is_empty() {
            return Ok(());
        }
        self.core.applying_index = batch.last().map(|(e, _)| e.log_id.index).expect("non-empty batch");
        let _ = self.core.tx_fsm.send(FsmMsg::Apply { batch });
        Ok(())
    }

    /// Confirm leadership with a quorum heartbeat round, guarding reads
    /// against staleness (§8).
    ///
    /// A leader must check whether it has been deposed before serving a
    /// read-only request; it does so by exchanging heartbeats with a majority
    /// of the cluster.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_verify_leader(&mut self, tx: oneshot::Sender<RaftResult<()>>) {
        let voter_count = self.core.membership.latest.voter_count();
        let needed = quorum::majority_of(voter_count);
        let mut confirmed = if self.core.membership.latest.is_voter(&self.core.id) { 1 } else { 0 };

        // A single-voter cluster needs no round trip.
        if confirmed >= needed {
            let _ = tx.send(Ok(()));
            return;
        }

        let mut pending = FuturesUnordered::new();
        for node in self.nodes.values() {
            if !self.core.membership.latest.is_voter(&node.server.id) {
                continue;
            }
            let rpc = AppendEntriesRequest {
                header: self.core.rpc_header(),
                term: self.core.current_term,
                leader: self.core.id.clone(),
                prev_log_id: node.matched,
                entries: vec![],
                leader_commit: self.core.commit_index,
            };
            let target = node.server.clone();
            let transport = self.core.transport.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_timeout);
            pending.push(
                tokio::spawn(
                    async move {
                        match timeout(ttl, transport.append_entries(&target, rpc)).await {
                            Ok(Ok(res)) => Some(res),
                            Ok(Err(err)) => {
                                tracing::warn!(target=%target.id, error=%err, "error confirming leadership");
                                None
                            }
                            Err(_) => {
                                tracing::warn!(target=%target.id, "timeout confirming leadership");
                                None
                            }
                        }
                    }
                    .instrument(tracing::debug_span!("verify-leader")),
                ),
            );
        }

        while let Some(joined) = pending.next().await {
            let res = match joined {
                Ok(Some(res)) => res,
                _ => continue,
            };
            // A higher term in any response means we have been deposed.
            if res.term > self.core.current_term {
                self.core.update_current_term(res.term);
                let _ = self.core.save_current_term().await;
                self.core.set_target_state(State::Follower);
                let _ = tx.send(Err(RaftError::LeadershipLost));
                return;
            }
            // Any same-term response counts as a leadership ack, whether or
            // not the log probe matched.
            confirmed += 1;
            if confirmed >= needed {
                let _ = tx.send(Ok(()));
                return;
            }
        }

        tracing::warn!("could not confirm leadership with a quorum");
        let _ = tx.send(Err(RaftError::LeadershipLost));
    }
}
