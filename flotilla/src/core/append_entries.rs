use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::fsm::Fsm;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::transport::RaftTransport;

impl<F, N, L, S, P> RaftCore<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// An RPC invoked by the leader to replicate log entries (§5.3); also
    /// used as a heartbeat (§5.2).
    #[tracing::instrument(level="debug", skip(self, msg), fields(leader=%msg.leader, term=msg.term, prev=%msg.prev_log_id, n=msg.entries.len()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<F::Data>,
    ) -> RaftResult<AppendEntriesResponse> {
        self.check_rpc_header(&msg.header)?;

        // Do not honor requests from a stale term.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(self.append_response(false, false));
        }

        // A valid leader is talking to us: record the contact and reset the
        // election timer.
        self.update_next_election_timeout(true);

        if msg.term > self.current_term {
            self.update_current_term(msg.term);
            self.save_current_term().await?;
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        if self.current_leader.as_ref() != Some(&msg.leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader.clone()));
        }

        // Log consistency check (§5.3). A previous entry at or before the
        // snapshot boundary is an implicit match: everything covered by the
        // snapshot is committed, hence identical on every log.
        if msg.prev_log_id.index > 0 && msg.prev_log_id.index > self.snapshot_last_log_id.index {
            let prev_term = if msg.prev_log_id.index == self.last_log_id.index {
                Some(self.last_log_id.term)
            } else {
                self.log_store
                    .get_log(msg.prev_log_id.index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?
                    .map(|entry| entry.log_id.term)
            };
            match prev_term {
                // Missing previous entry: the rejection is deterministic, the
                // leader should jump straight to our last log.
                None => {
                    tracing::debug!(prev=%msg.prev_log_id, "rejecting AppendEntries, previous entry not present");
                    return Ok(self.append_response(false, true));
                }
                Some(term) if term != msg.prev_log_id.term => {
                    tracing::debug!(prev=%msg.prev_log_id, local_term=term, "rejecting AppendEntries, previous term conflicts");
                    return Ok(self.append_response(false, true));
                }
                Some(_) => {}
            }
        } else if msg.prev_log_id.index > 0
            && msg.prev_log_id.index == self.snapshot_last_log_id.index
            && msg.prev_log_id.term != self.snapshot_last_log_id.term
        {
            // Should be impossible for a correct leader: the snapshot covers
            // committed entries only.
            tracing::error!(prev=%msg.prev_log_id, snapshot=%self.snapshot_last_log_id, "prev entry conflicts with snapshot boundary");
            return Ok(self.append_response(false, true));
        }

        // Append any entries we do not already hold, deleting a conflicting
        // suffix first (§5.3).
        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
        }

        // Advance the commit index and hand newly committed entries to the
        // state machine runner.
        let new_commit = std::cmp::min(msg.leader_commit, self.last_log_id.index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.membership.commit(self.commit_index);
            self.apply_committed_entries().await?;
            self.report_metrics();
        }

        Ok(self.append_response(true, false))
    }

    fn append_response(&self, success: bool, no_retry_backoff: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            last_log: self.last_log_id.index,
            success,
            no_retry_backoff,
        }
    }

    /// Append replicated entries, skipping those already present and deleting
    /// any conflicting suffix.
    async fn append_log_entries(&mut self, entries: &[Entry<F::Data>]) -> RaftResult<()> {
        // Find the first entry which is actually new to this log. Anything at
        // or below the snapshot boundary is committed and identical already.
        let mut new_start = 0;
        for entry in entries.iter() {
            if entry.log_id.index > self.last_log_id.index {
                break;
            }
            if entry.log_id.index <= self.snapshot_last_log_id.index {
                new_start += 1;
                continue;
            }
            let existing = self
                .log_store
                .get_log(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                Some(local) if local.log_id.term == entry.log_id.term => {
                    new_start += 1;
                    continue;
                }
                // Conflict: delete this entry and everything after it.
                _ => {
                    tracing::debug!(from=entry.log_id.index, "clearing conflicting log suffix");
                    self.log_store
                        .delete_range(entry.log_id.index, self.last_log_id.index)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    self.last_log_id = if entry.log_id.index > 1 {
                        match self
                            .log_store
                            .get_log(entry.log_id.index - 1)
                            .await
                            .map_err(|err| self.map_fatal_storage_error(err))?
                        {
                            Some(prev) => prev.log_id,
                            None => self.snapshot_last_log_id,
                        }
                    } else {
                        Default::default()
                    };
                    self.rebuild_membership_after_truncate().await?;
                    break;
                }
            }
        }

        let to_append = &entries[new_start..];
        if to_append.is_empty() {
            return Ok(());
        }
        self.log_store.store_logs(to_append).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = to_append.last() {
            self.last_log_id = entry.log_id;
        }
        if self.first_index == 0 {
            self.first_index = to_append.first().map(|e| e.log_id.index).unwrap_or(0);
        }

        // Adopt any membership carried in the batch.
        for entry in to_append.iter() {
            self.adopt_membership_from_entry(entry);
        }
        self.report_metrics();
        Ok(())
    }

    /// Re-derive the latest membership after a conflicting suffix was
    /// deleted. Committed configurations can never be truncated, so restart
    /// from the committed one and replay whatever uncommitted configuration
    /// entries survive in the log.
    async fn rebuild_membership_after_truncate(&mut self) -> RaftResult<()> {
        if self.membership.latest_index <= self.last_log_id.index {
            return Ok(());
        }
        self.membership.latest = self.membership.committed.clone();
        self.membership.latest_index = self.membership.committed_index;
        let start = std::cmp::max(self.first_index, self.membership.committed_index + 1);
        if self.first_index > 0 && start <= self.last_log_id.index {
            self.scan_membership_in_range(start, self.last_log_id.index).await?;
        }
        Ok(())
    }
}
