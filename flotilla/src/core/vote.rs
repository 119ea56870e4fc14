use std::time::Duration;

use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::fsm::Fsm;
use crate::membership::Server;
use crate::observer::Observation;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::transport::RaftTransport;
use crate::ServerId;

impl<F, N, L, S, P> RaftCore<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level="debug", skip(self, msg), fields(candidate=%msg.candidate, term=msg.term))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        self.check_rpc_header(&msg.header)?;

        // Do not honor requests from a stale term.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(self.vote_response(&msg, false));
        }

        // A node which heard from a valid leader within the lease window
        // denies the vote, keeping a connected cluster stable against a
        // partitioned peer campaigning its term up. The known leader itself,
        // and a candidate performing a leadership transfer, bypass this.
        let lease = Duration::from_millis(self.config.leader_lease_timeout);
        let leader_is_candidate = self.current_leader.as_deref() == Some(msg.candidate.as_str());
        let contact_is_fresh = self.last_contact.map(|inst| inst.elapsed() < lease).unwrap_or(false);
        if self.current_leader.is_some() && contact_is_fresh && !leader_is_candidate && !msg.leadership_transfer {
            tracing::debug!(candidate=%msg.candidate, "rejecting vote request, we have a current leader");
            return Ok(self.vote_response(&msg, false));
        }

        // Adopt a newer term, reverting to follower.
        if msg.term > self.current_term {
            self.update_current_term(msg.term);
            self.update_next_election_timeout(false);
            self.set_target_state(State::Follower);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.save_current_term().await?;
        }

        // At most one vote per term, first-come-first-served (§5.4.1).
        if self.last_vote_term == msg.term {
            match &self.last_vote_cand {
                Some(cand) if cand == &msg.candidate => {
                    tracing::debug!(candidate=%msg.candidate, "duplicate vote request for already granted candidate");
                    return Ok(self.vote_response(&msg, true));
                }
                Some(_) => {
                    tracing::debug!(candidate=%msg.candidate, "rejecting vote request, already voted this term");
                    return Ok(self.vote_response(&msg, false));
                }
                None => {}
            }
        }

        // The candidate's log must be at least as up-to-date as ours (§5.4.1):
        // compare last terms first, then last indexes.
        let local = self.last_log_id;
        if msg.last_log_term < local.term || (msg.last_log_term == local.term && msg.last_log_index < local.index) {
            tracing::debug!(candidate=%msg.candidate, "rejecting vote request, candidate log is not up-to-date");
            return Ok(self.vote_response(&msg, false));
        }

        // Persist the vote before releasing it.
        self.save_vote(msg.term, &msg.candidate).await?;
        self.update_next_election_timeout(false);
        Ok(self.vote_response(&msg, true))
    }

    fn vote_response(&self, msg: &VoteRequest, vote_granted: bool) -> VoteResponse {
        self.observers.observe(Observation::RequestVote {
            candidate: msg.candidate.clone(),
            term: msg.term,
            granted: vote_granted,
        });
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }
}

impl<'a, F, N, L, S, P> CandidateState<'a, F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// Spawn a parallel vote request to every other voter of the latest
    /// membership, returning the channel on which responses arrive.
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, ServerId)> {
        let peers: Vec<Server> = self
            .core
            .membership
            .latest
            .voters()
            .filter(|server| server.id != self.core.id)
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));

        for peer in peers {
            let rpc = VoteRequest {
                header: self.core.rpc_header(),
                term: self.core.current_term,
                candidate: self.core.id.clone(),
                last_log_index: self.core.last_log_id.index,
                last_log_term: self.core.last_log_id.term,
                leadership_transfer: false,
            };
            let transport = self.core.transport.clone();
            let tx = tx.clone();
            let _ = tokio::spawn(
                async move {
                    let res = transport.vote(&peer, rpc).await;
                    match res {
                        Ok(response) => {
                            let _ = tx.send((response, peer.id)).await;
                        }
                        Err(err) => {
                            tracing::warn!(target=%peer.id, error=%err, "error sending RequestVote RPC to target");
                        }
                    }
                }
                .instrument(tracing::debug_span!("request-vote")),
            );
        }
        rx
    }

    /// Handle a vote response from a peer.
    #[tracing::instrument(level = "debug", skip(self, res), fields(peer=%peer))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, peer: ServerId) -> RaftResult<()> {
        // A newer term ends the campaign.
        if res.term > self.core.current_term {
            tracing::debug!({ res.term }, "RequestVote RPC response carries a newer term, reverting to follower");
            self.core.update_current_term(res.term);
            self.core.save_current_term().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::info!(
                    id=%self.core.id,
                    term=self.core.current_term,
                    granted=self.votes_granted,
                    "won election, becoming leader"
                );
                self.core.set_target_state(State::Leader);
            }
        }
        Ok(())
    }
}

