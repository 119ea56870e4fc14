use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::SnapshotSegmentId;
use crate::fsm::Fsm;
use crate::fsm::FsmMsg;
use crate::membership::MembershipState;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::storage::LogStore;
use crate::storage::SnapshotSink;
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
    /// Invoked by the leader to send chunks of a snapshot to a follower (§7).
    ///
    /// Leaders always send chunks in order. A chunk stream restarting at
    /// offset 0 supersedes whatever partial stream was in flight; any other
    /// out-of-order segment is rejected with a mismatch error so the leader
    /// restarts the stream.
    #[tracing::instrument(level="debug", skip(self, req), fields(leader=%req.leader, term=req.term, snapshot=%req.meta.last_log_id, offset=req.offset, done=req.done))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        self.check_rpc_header(&req.header)?;

        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            });
        }

        // A valid leader is talking to us.
        self.update_next_election_timeout(true);
        if req.term > self.current_term {
            self.update_current_term(req.term);
            self.save_current_term().await?;
        }
        if self.current_leader.as_ref() != Some(&req.leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader.clone()));
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            // Streaming from the leader supersedes a local snapshot attempt;
            // the local worker's eventual outcome is handled idempotently.
            Some(SnapshotState::Snapshotting) => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Streaming { offset, stream_id, sink }) => {
                if req.meta.id == stream_id {
                    return self.continue_installing_snapshot(req, offset, stream_id, sink).await;
                }
                if req.offset == 0 {
                    return self.begin_installing_snapshot(req).await;
                }
                Err(RaftError::SnapshotMismatch {
                    expect: SnapshotSegmentId {
                        id: stream_id.clone(),
                        offset,
                    },
                    got: SnapshotSegmentId {
                        id: req.meta.id.clone(),
                        offset: req.offset,
                    },
                })
            }
        }
    }

    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        if req.offset > 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: SnapshotSegmentId {
                    id: req.meta.id.clone(),
                    offset: 0,
                },
                got: SnapshotSegmentId {
                    id: req.meta.id.clone(),
                    offset: req.offset,
                },
            });
        }

        let mut sink = self
            .snapshot_store
            .create(req.meta.version, req.meta.last_log_id, req.meta.membership.clone(), req.meta.membership_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        sink.write_all(&req.data).await?;

        if req.done {
            self.finalize_snapshot_installation(&req, sink).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming {
                offset: req.data.len() as u64,
                stream_id: req.meta.id.clone(),
                sink,
            });
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    async fn continue_installing_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        offset: u64,
        stream_id: crate::SnapshotId,
        mut sink: Box<dyn SnapshotSink>,
    ) -> RaftResult<InstallSnapshotResponse> {
        // The sink is strictly sequential; an out-of-place segment aborts the
        // stream so the leader restarts it from the beginning.
        if req.offset != offset {
            let expect = SnapshotSegmentId { id: stream_id, offset };
            let _ = sink.cancel().await;
            return Err(RaftError::SnapshotMismatch {
                expect,
                got: SnapshotSegmentId {
                    id: req.meta.id.clone(),
                    offset: req.offset,
                },
            });
        }

        sink.write_all(&req.data).await?;
        let offset = offset + req.data.len() as u64;

        if req.done {
            self.finalize_snapshot_installation(&req, sink).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming {
                offset,
                stream_id,
                sink,
            });
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    /// Finalize the installation of a fully received snapshot: close the
    /// sink, restore the state machine from it, truncate the covered log
    /// prefix and adopt the snapshot's membership.
    async fn finalize_snapshot_installation(
        &mut self,
        req: &InstallSnapshotRequest,
        mut sink: Box<dyn SnapshotSink>,
    ) -> RaftResult<()> {
        sink.shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
        let sink_id = sink.id();
        drop(sink);

        let (meta, source) =
            self.snapshot_store.open(&sink_id).await.map_err(|err| self.map_fatal_storage_error(err))?;

        // The runner is serial, so the restore runs with the applier
        // quiesced by construction.
        let (tx, rx) = oneshot::channel();
        let _ = self.tx_fsm.send(FsmMsg::Restore {
            log_id: meta.last_log_id,
            source,
            tx,
        });
        rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)?;

        // Truncate the log prefix the snapshot covers.
        let snap = meta.last_log_id;
        if self.first_index > 0 && self.first_index <= snap.index {
            let stop = std::cmp::min(snap.index, self.last_log_id.index);
            self.log_store
                .delete_range(self.first_index, stop)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            if self.last_log_id.index > snap.index {
                self.first_index = snap.index + 1;
            } else {
                self.first_index = 0;
            }
        }
        if self.last_log_id.index < snap.index {
            self.last_log_id = snap;
        }

        self.commit_index = snap.index;
        self.applying_index = snap.index;
        self.last_applied = snap;
        self.snapshot_last_log_id = snap;
        self.membership = MembershipState {
            committed: meta.membership.clone(),
            committed_index: meta.membership_index,
            latest: meta.membership.clone(),
            latest_index: meta.membership_index,
        };
        tracing::info!(snapshot=%snap, "snapshot installed from leader");
        self.report_metrics();
        Ok(())
    }
}
