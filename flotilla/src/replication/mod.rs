//! Replication stream.
//!
//! One task per peer, owned by the leader for the duration of its term. The
//! task keeps its target's log caught up with the leader's, sends the
//! periodic heartbeats which maintain the leader's lease, and falls back to
//! streaming a snapshot when the target is so far behind that the entries it
//! needs have been compacted away.
//!
//! Requests are strictly single-in-flight per peer: a payload is sent and its
//! response handled before the next one goes out, which keeps delivery
//! ordered without a drain protocol.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Interval;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::membership::Server;
use crate::raft::AppendEntriesRequest;
use crate::raft::InstallSnapshotRequest;
use crate::raft::RpcHeader;
use crate::storage::LogStore;
use crate::storage::SnapshotMeta;
use crate::transport::RaftTransport;
use crate::util::backoff;
use crate::AppData;
use crate::LogId;
use crate::ServerId;

/// The base wait applied to a failing peer before the next attempt.
const FAILURE_BACKOFF_BASE: Duration = Duration::from_millis(10);

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
}

impl ReplicationStream {
    /// Spawn a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<D, N, L>(
        id: ServerId,
        target: Server,
        term: u64,
        config: Arc<Config>,
        header: RpcHeader,
        last_log: LogId,
        commit_index: u64,
        transport: Arc<N>,
        log_store: Arc<L>,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self
    where
        D: AppData,
        N: RaftTransport<D>,
        L: LogStore<D>,
    {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_timeout);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let max_append_entries = config.max_append_entries;
        let snapshot_max_chunk_size = config.snapshot_max_chunk_size as usize;
        let heartbeat = interval(Duration::from_millis(config.heartbeat_interval()));

        let this = ReplicationCore {
            id,
            target,
            term,
            header,
            transport,
            log_store,
            raft_core_tx,
            repl_rx,
            state: TargetReplState::Replicate,
            next_index: last_log.index + 1,
            matched: last_log,
            last_log_index: last_log.index,
            commit_index,
            failures: 0,
            peer_down: false,
            heartbeat,
            heartbeat_timeout,
            install_snapshot_timeout,
            max_append_entries,
            snapshot_max_chunk_size,
            marker: PhantomData::<D>,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("replication")));

        Self { repl_tx }
    }
}

/// A task responsible for replicating the log to one target peer.
struct ReplicationCore<D, N, L>
where
    D: AppData,
    N: RaftTransport<D>,
    L: LogStore<D>,
{
    /// The id of this Raft node, the leader.
    id: ServerId,
    /// The target peer.
    target: Server,
    /// The leader's term, which never changes for the lifetime of this task.
    term: u64,
    /// The header stamped on every outbound RPC.
    header: RpcHeader,

    transport: Arc<N>,
    log_store: Arc<L>,

    /// Events to the leader.
    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    /// Events from the leader.
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,

    state: TargetReplState,

    /// The index of the next entry to send to the target.
    ///
    /// Initialized to the leader's last log index + 1 and walked backwards by
    /// rejections until the logs agree (§5.3).
    next_index: u64,
    /// The last log id known to be replicated on the target.
    matched: LogId,

    /// The leader's last appended index, as most recently notified.
    last_log_index: u64,
    /// The leader's commit index, as most recently notified.
    commit_index: u64,

    /// Consecutive failed attempts, driving the backoff wait.
    failures: u64,
    /// Whether the peer is currently considered unresponsive.
    peer_down: bool,

    heartbeat: Interval,
    heartbeat_timeout: Duration,
    install_snapshot_timeout: Duration,
    max_append_entries: u64,
    snapshot_max_chunk_size: usize,
    marker: PhantomData<D>,
}

/// The state of the replication stream.
#[derive(Debug, PartialEq, Eq)]
enum TargetReplState {
    /// Shipping entries from the log, or idling at line rate on heartbeats.
    Replicate,
    /// The target needs entries which have been compacted away; stream the
    /// current snapshot instead.
    Snapshotting,
    /// The stream is shutting down.
    Shutdown,
}

/// An event from the leader to a replication stream.
pub(crate) enum RaftEvent {
    /// New entries have been appended; ship everything up to `last_log_index`.
    Replicate { last_log_index: u64, commit_index: u64 },
    /// The commit index moved without new entries.
    UpdateCommitIndex { commit_index: u64 },
    /// The leader is stepping down; stop replicating.
    Terminate,
}

/// An event from a replication stream to the leader.
pub(crate) enum ReplicaEvent {
    /// The target acknowledged entries up to `matched`.
    UpdateMatchIndex { target: ServerId, matched: LogId },
    /// The target answered an RPC; refreshes the leader lease.
    Contact { target: ServerId },
    /// The target reported a newer term; the leader must step down.
    RevertToFollower { target: ServerId, term: u64 },
    /// The stream needs the current snapshot to bring its target up to speed.
    NeedsSnapshot {
        target: ServerId,
        tx: oneshot::Sender<SnapshotSource>,
    },
    /// The target stopped answering, or resumed answering.
    Liveness { target: ServerId, alive: bool },
    /// A critical storage error was hit; the node must shut down.
    Shutdown,
}

/// A readable snapshot handed to a replication stream for transmission.
pub(crate) struct SnapshotSource {
    pub meta: SnapshotMeta,
    pub source: Box<dyn AsyncRead + Send + Unpin>,
}

impl<D, N, L> ReplicationCore<D, N, L>
where
    D: AppData,
    N: RaftTransport<D>,
    L: LogStore<D>,
{
    #[tracing::instrument(level="debug", skip(self), fields(leader=%self.id, target=%self.target.id))]
    async fn main(mut self) {
        // Perform an initial heartbeat to announce the new term.
        self.send_append_entries().await;

        loop {
            match &self.state {
                TargetReplState::Replicate => self.replicate().await,
                TargetReplState::Snapshotting => self.stream_snapshot().await,
                TargetReplState::Shutdown => {
                    tracing::debug!(target=%self.target.id, "replication stream shutting down");
                    return;
                }
            }
        }
    }

    /// Ship entries while the target is behind; idle on heartbeats at line
    /// rate.
    async fn replicate(&mut self) {
        loop {
            if self.state != TargetReplState::Replicate {
                return;
            }
            self.drain_events();
            if self.state != TargetReplState::Replicate {
                return;
            }

            if self.next_index <= self.last_log_index {
                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,
                event = self.repl_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => self.state = TargetReplState::Shutdown,
                },
            }
        }
    }

    /// Process all control events which are already queued, without blocking.
    fn drain_events(&mut self) {
        loop {
            match self.repl_rx.recv().now_or_never() {
                Some(Some(event)) => self.handle_event(event),
                Some(None) => {
                    self.state = TargetReplState::Shutdown;
                    return;
                }
                None => return,
            }
            if self.state == TargetReplState::Shutdown {
                return;
            }
        }
    }

    fn handle_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Replicate {
                last_log_index,
                commit_index,
            } => {
                self.last_log_index = last_log_index;
                self.commit_index = commit_index;
            }
            RaftEvent::UpdateCommitIndex { commit_index } => {
                self.commit_index = commit_index;
            }
            RaftEvent::Terminate => {
                self.state = TargetReplState::Shutdown;
            }
        }
    }

    /// The log id immediately preceding `next_index`, or `None` when it has
    /// been compacted away (switches the stream to snapshotting) or a fatal
    /// error occurred.
    async fn prev_log_id(&mut self) -> Option<LogId> {
        if self.next_index <= 1 {
            return Some(LogId::default());
        }
        if self.next_index == self.matched.index + 1 {
            return Some(self.matched);
        }
        match self.log_store.get_log(self.next_index - 1).await {
            Ok(Some(entry)) => Some(entry.log_id),
            Ok(None) => {
                tracing::debug!(index = self.next_index - 1, "previous entry compacted, switching to snapshot");
                self.state = TargetReplState::Snapshotting;
                None
            }
            Err(err) => {
                tracing::error!(error=%err, "error reading previous log entry");
                let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                self.state = TargetReplState::Shutdown;
                None
            }
        }
    }

    /// Send one AppendEntries RPC carrying as many entries as the payload cap
    /// allows (none when the target is caught up) and handle its response.
    async fn send_append_entries(&mut self) {
        let prev_log_id = match self.prev_log_id().await {
            Some(prev) => prev,
            None => return,
        };

        let stop = std::cmp::min(self.last_log_index, self.next_index + self.max_append_entries - 1);
        let mut entries = Vec::new();
        if self.next_index <= stop {
            match self.log_store.get_log_range(self.next_index, stop + 1).await {
                Ok(batch) => {
                    let contiguous = batch.first().map(|e| e.log_id.index) == Some(self.next_index)
                        && batch.len() as u64 == stop - self.next_index + 1;
                    if !contiguous {
                        tracing::debug!(from = self.next_index, "log range gap, switching to snapshot");
                        self.state = TargetReplState::Snapshotting;
                        return;
                    }
                    entries = batch;
                }
                Err(err) => {
                    tracing::error!(error=%err, "error fetching entries for replication");
                    let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
                    self.state = TargetReplState::Shutdown;
                    return;
                }
            }
        }
        let sent = entries.last().map(|entry| entry.log_id);

        let rpc = AppendEntriesRequest {
            header: self.header,
            term: self.term,
            leader: self.id.clone(),
            prev_log_id,
            entries,
            leader_commit: self.commit_index,
        };
        let res = timeout(self.heartbeat_timeout, self.transport.append_entries(&self.target, rpc)).await;
        let res = match res {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(target=%self.target.id, error=%err, "error sending AppendEntries RPC to target");
                self.handle_send_failure().await;
                return;
            }
            Err(_) => {
                tracing::warn!(target=%self.target.id, "timeout while sending AppendEntries RPC to target");
                self.handle_send_failure().await;
                return;
            }
        };

        self.handle_peer_response();

        // A newer term deposes this leader.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target.id.clone(),
                term: res.term,
            });
            self.state = TargetReplState::Shutdown;
            return;
        }

        if res.success {
            self.failures = 0;
            if let Some(matched) = sent {
                self.next_index = matched.index + 1;
                self.matched = matched;
                let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatchIndex {
                    target: self.target.id.clone(),
                    matched,
                });
            }
            return;
        }

        // The target rejected the previous-entry probe. Walk backwards,
        // jumping straight to the target's last log where possible.
        let probe = std::cmp::min(self.next_index.saturating_sub(1), res.last_log + 1);
        self.next_index = std::cmp::max(probe, 1);
        tracing::debug!(target=%self.target.id, next_index=self.next_index, "append entries rejected, probing earlier");
        if res.no_retry_backoff {
            self.failures = 0;
        } else {
            self.failures += 1;
            sleep(backoff(self.failures, FAILURE_BACKOFF_BASE, self.heartbeat_timeout)).await;
        }
    }

    /// Record a transport-level failure and wait out the backoff.
    async fn handle_send_failure(&mut self) {
        self.failures += 1;
        if !self.peer_down {
            self.peer_down = true;
            let _ = self.raft_core_tx.send(ReplicaEvent::Liveness {
                target: self.target.id.clone(),
                alive: false,
            });
        }
        sleep(backoff(self.failures, FAILURE_BACKOFF_BASE, self.heartbeat_timeout)).await;
    }

    /// Record that the peer answered an RPC.
    fn handle_peer_response(&mut self) {
        if self.peer_down {
            self.peer_down = false;
            let _ = self.raft_core_tx.send(ReplicaEvent::Liveness {
                target: self.target.id.clone(),
                alive: true,
            });
        }
        let _ = self.raft_core_tx.send(ReplicaEvent::Contact {
            target: self.target.id.clone(),
        });
    }

    //////////////////////////////////////////////////////////////////////////
    // Snapshot transmission /////////////////////////////////////////////////

    /// Fetch the current snapshot from the leader and stream it to the
    /// target.
    async fn stream_snapshot(&mut self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.raft_core_tx.send(ReplicaEvent::NeedsSnapshot {
            target: self.target.id.clone(),
            tx,
        });

        let snapshot = match self.wait_for_snapshot(rx).await {
            Some(snapshot) => snapshot,
            None => {
                if self.state == TargetReplState::Snapshotting {
                    // No snapshot was available yet; give the leader a moment
                    // to produce one, then ask again.
                    sleep(self.heartbeat_timeout).await;
                }
                return;
            }
        };

        if let Err(err) = self.send_snapshot(snapshot).await {
            tracing::warn!(target=%self.target.id, error=%err, "error streaming snapshot to target, will retry");
            self.handle_send_failure().await;
        }
    }

    /// Wait for the snapshot response, keeping heartbeats flowing so the
    /// target does not time out in the meantime.
    async fn wait_for_snapshot(&mut self, mut rx: oneshot::Receiver<SnapshotSource>) -> Option<SnapshotSource> {
        loop {
            tokio::select! {
                _ = self.heartbeat.tick() => self.send_heartbeat().await,
                event = self.repl_rx.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                        if self.state == TargetReplState::Shutdown {
                            return None;
                        }
                    }
                    None => {
                        self.state = TargetReplState::Shutdown;
                        return None;
                    }
                },
                res = &mut rx => return res.ok(),
            }
        }
    }

    /// A bare heartbeat which does not touch the probing state.
    async fn send_heartbeat(&mut self) {
        let rpc = AppendEntriesRequest {
            header: self.header,
            term: self.term,
            leader: self.id.clone(),
            prev_log_id: self.matched,
            entries: Vec::new(),
            leader_commit: self.commit_index,
        };
        match timeout(self.heartbeat_timeout, self.transport.append_entries(&self.target, rpc)).await {
            Ok(Ok(res)) => {
                self.handle_peer_response();
                if res.term > self.term {
                    let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                        target: self.target.id.clone(),
                        term: res.term,
                    });
                    self.state = TargetReplState::Shutdown;
                }
            }
            _ => {
                if !self.peer_down {
                    self.peer_down = true;
                    let _ = self.raft_core_tx.send(ReplicaEvent::Liveness {
                        target: self.target.id.clone(),
                        alive: false,
                    });
                }
            }
        }
    }

    /// Stream the snapshot to the target in ordered segments.
    async fn send_snapshot(&mut self, snapshot: SnapshotSource) -> anyhow::Result<()> {
        let SnapshotSource { meta, mut source } = snapshot;
        let mut buf = vec![0u8; self.snapshot_max_chunk_size.max(1)];
        let mut offset = 0u64;

        loop {
            let n = source.read(&mut buf).await?;
            let done = n == 0 || offset + n as u64 >= meta.size;
            let rpc = InstallSnapshotRequest {
                header: self.header,
                term: self.term,
                leader: self.id.clone(),
                meta: meta.clone(),
                offset,
                data: buf[..n].to_vec(),
                done,
            };
            tracing::debug!(target=%self.target.id, offset, len = n, done, "sending snapshot segment");

            let res =
                timeout(self.install_snapshot_timeout, self.transport.install_snapshot(&self.target, rpc)).await??;
            self.handle_peer_response();

            if res.term > self.term {
                let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
                    target: self.target.id.clone(),
                    term: res.term,
                });
                self.state = TargetReplState::Shutdown;
                return Ok(());
            }
            if !res.success {
                anyhow::bail!("snapshot segment at offset {} rejected by target", offset);
            }

            if done {
                self.matched = meta.last_log_id;
                self.next_index = meta.last_log_id.index + 1;
                self.failures = 0;
                let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatchIndex {
                    target: self.target.id.clone(),
                    matched: self.matched,
                });
                self.state = TargetReplState::Replicate;
                tracing::info!(target=%self.target.id, snapshot=%meta.last_log_id, "snapshot streamed to target");
                return Ok(());
            }
            offset += n as u64;

            // Stay responsive to leadership changes mid-stream.
            self.drain_events();
            if self.state != TargetReplState::Snapshotting {
                return Ok(());
            }
        }
    }
}
