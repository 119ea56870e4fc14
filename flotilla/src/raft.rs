//! Public Raft interface and data types.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::Fsm;
use crate::membership::ConfigChange;
use crate::membership::Membership;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::observer::Observation;
use crate::observer::ObserverRegistry;
use crate::storage::LogStore;
use crate::storage::SnapshotMeta;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::transport::RaftTransport;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::ServerAddress;
use crate::ServerId;

/// The size of the bounded client operation queue. `apply`'s enqueue timeout
/// runs against this queue filling up.
pub(crate) const CLIENT_QUEUE_DEPTH: usize = 64;

struct RaftInner<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    id: ServerId,
    config: Arc<Config>,
    tx_api: mpsc::Sender<RaftMsg<F::Data, F::Response>>,
    tx_rpc: mpsc::UnboundedSender<RaftMsg<F::Data, F::Response>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    rx_leader: watch::Receiver<bool>,
    observers: ObserverRegistry,
    core_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker: PhantomData<(N, L, S, P)>,
}

/// The Raft API.
///
/// This type is the handle to a running Raft node. Applications spawn a node
/// with [`Raft::new`] and interact with it through this handle.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any interface resolves with [`RaftError::Shutdown`], the node is
/// stopping (possibly for data safety reasons after a storage error) and
/// [`Raft::shutdown`] should be called to await it. Shutdown is idempotent.
pub struct Raft<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    inner: Arc<RaftInner<F, N, L, S, P>>,
}

impl<F, N, L, S, P> Raft<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    /// Create and spawn a new Raft node.
    ///
    /// The node identifies itself by `config.local_id` at protocol version 3
    /// and above; below that, the transport's local address doubles as the
    /// id, which is the legacy address-keyed mode of operation.
    ///
    /// The state machine is owned by the spawned node; keep an application
    /// side handle to its state if you need to read it directly.
    pub fn new(config: Arc<Config>, fsm: F, log_store: Arc<L>, stable_store: Arc<S>, snapshot_store: Arc<P>, transport: Arc<N>) -> Self {
        let id = if config.protocol_version >= 3 {
            config.local_id.clone()
        } else {
            transport.local_addr()
        };
        let (tx_api, rx_api) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let (tx_rpc, rx_rpc) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id.clone()));
        let (tx_leader, rx_leader) = watch::channel(false);
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let observers = ObserverRegistry::new();
        let core_handle = RaftCore::spawn(
            id.clone(),
            config.clone(),
            fsm,
            log_store,
            stable_store,
            snapshot_store,
            transport,
            rx_api,
            rx_rpc,
            tx_metrics,
            tx_leader,
            observers.clone(),
            rx_shutdown,
        );
        let inner = RaftInner {
            id,
            config,
            tx_api,
            tx_rpc,
            rx_metrics,
            rx_leader,
            observers,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker: PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// The id of the local server.
    pub fn id(&self) -> &ServerId {
        &self.inner.id
    }

    //////////////////////////////////////////////////////////////////////////
    // Inbound RPCs //////////////////////////////////////////////////////////

    /// Submit an AppendEntries RPC to this node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries
    /// (§5.3), and are also used as heartbeats (§5.2).
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<F::Data>) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_rpc
            .send(RaftMsg::AppendEntries { rpc, tx })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)
    }

    /// Submit a RequestVote RPC to this node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state
    /// attempting to gather votes (§5.2).
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_rpc.send(RaftMsg::RequestVote { rpc, tx }).map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC segment to this node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node
    /// or a slow node up-to-speed with the leader (§7).
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_rpc
            .send(RaftMsg::InstallSnapshot { rpc, tx })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)
    }

    //////////////////////////////////////////////////////////////////////////
    // Client operations /////////////////////////////////////////////////////

    /// Apply a command to the replicated state machine (§5.1).
    ///
    /// The command is appended to the log, committed to the cluster, and then
    /// applied to the state machine; the returned future resolves with the
    /// state machine's response and the entry's index once that has happened.
    ///
    /// `timeout` bounds only the time spent waiting for a slot in the node's
    /// client queue; once accepted, the operation cannot be cancelled and
    /// resolves on commit, on loss of leadership, or on shutdown.
    pub async fn apply(&self, data: F::Data, timeout: Option<Duration>) -> ApplyFuture<F::Response> {
        let (tx, rx) = oneshot::channel();
        match self.enqueue(RaftMsg::Apply { data, extensions: Vec::new(), tx }, timeout).await {
            Ok(()) => ResponseFuture::new(rx),
            Err(err) => ResponseFuture::err(err),
        }
    }

    /// Issue a barrier, proving that every apply accepted before this call
    /// has reached the state machine once the returned future resolves.
    pub async fn barrier(&self, timeout: Option<Duration>) -> IndexFuture {
        let (tx, rx) = oneshot::channel();
        match self.enqueue(RaftMsg::Barrier { tx }, timeout).await {
            Ok(()) => ResponseFuture::new(rx),
            Err(err) => ResponseFuture::err(err),
        }
    }

    /// Check that this node is still the cluster leader, guarding reads
    /// against staleness (§8).
    ///
    /// The actual read operation itself is up to the application; this method
    /// only confirms leadership with a quorum heartbeat round.
    pub async fn verify_leader(&self) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::VerifyLeader { tx }, None).await?;
        rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)
    }

    /// Request a snapshot of the state machine to be taken and the log
    /// compacted. Resolves with the new snapshot's metadata.
    pub async fn snapshot(&self) -> SnapshotFuture {
        let (tx, rx) = oneshot::channel();
        match self.enqueue(RaftMsg::TakeSnapshot { tx }, None).await {
            Ok(()) => ResponseFuture::new(rx),
            Err(err) => ResponseFuture::err(err),
        }
    }

    /// Get the committed and latest membership configurations.
    pub async fn get_membership(&self) -> RaftResult<MembershipInfo> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::GetMembership { tx }, None).await?;
        rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)
    }

    //////////////////////////////////////////////////////////////////////////
    // Membership changes ////////////////////////////////////////////////////

    /// Add the given server as a voter (§6).
    ///
    /// If the server's log is far behind the leader's it is first staged and
    /// synced, then promoted with a second configuration entry once caught
    /// up. The returned future resolves with the index of the configuration
    /// entry once it commits.
    ///
    /// `prev_index` of 0 accepts any current membership; a non-zero value
    /// must match the latest membership index exactly or the request fails
    /// with `ConfigurationChanged`.
    pub async fn add_voter(
        &self,
        id: ServerId,
        address: ServerAddress,
        prev_index: u64,
        timeout: Option<Duration>,
    ) -> IndexFuture {
        if self.inner.config.protocol_version < 2 {
            return ResponseFuture::err(RaftError::UnsupportedProtocol);
        }
        self.change_membership(ConfigChange::AddVoter { id, address }, prev_index, timeout).await
    }

    /// Add the given server as a non-voter (§6). It receives the log but
    /// never counts toward quorum.
    pub async fn add_nonvoter(
        &self,
        id: ServerId,
        address: ServerAddress,
        prev_index: u64,
        timeout: Option<Duration>,
    ) -> IndexFuture {
        if self.inner.config.protocol_version < 3 {
            return ResponseFuture::err(RaftError::UnsupportedProtocol);
        }
        self.change_membership(ConfigChange::AddNonvoter { id, address }, prev_index, timeout).await
    }

    /// Strip the given server of its vote while keeping it in the cluster.
    pub async fn demote_voter(&self, id: ServerId, prev_index: u64, timeout: Option<Duration>) -> IndexFuture {
        if self.inner.config.protocol_version < 3 {
            return ResponseFuture::err(RaftError::UnsupportedProtocol);
        }
        self.change_membership(ConfigChange::DemoteVoter { id }, prev_index, timeout).await
    }

    /// Remove the given server from the cluster entirely.
    ///
    /// Removing a server which is not a member still writes a configuration
    /// entry, so the membership index advances either way.
    pub async fn remove_server(&self, id: ServerId, prev_index: u64, timeout: Option<Duration>) -> IndexFuture {
        if self.inner.config.protocol_version < 2 {
            return ResponseFuture::err(RaftError::UnsupportedProtocol);
        }
        self.change_membership(ConfigChange::RemoveServer { id }, prev_index, timeout).await
    }

    /// Legacy address-keyed voter addition, for protocol versions at or below
    /// 2 where the server address doubles as its id.
    pub async fn add_peer(&self, address: ServerAddress) -> IndexFuture {
        if self.inner.config.protocol_version > 2 {
            return ResponseFuture::err(RaftError::UnsupportedProtocol);
        }
        self.change_membership(
            ConfigChange::AddVoter {
                id: address.clone(),
                address,
            },
            0,
            None,
        )
        .await
    }

    /// Legacy address-keyed removal, for protocol versions at or below 2.
    pub async fn remove_peer(&self, address: ServerAddress) -> IndexFuture {
        if self.inner.config.protocol_version > 2 {
            return ResponseFuture::err(RaftError::UnsupportedProtocol);
        }
        self.change_membership(ConfigChange::RemoveServer { id: address }, 0, None).await
    }

    async fn change_membership(&self, change: ConfigChange, prev_index: u64, timeout: Option<Duration>) -> IndexFuture {
        let (tx, rx) = oneshot::channel();
        match self.enqueue(RaftMsg::ChangeMembership { change, prev_index, tx }, timeout).await {
            Ok(()) => ResponseFuture::new(rx),
            Err(err) => ResponseFuture::err(err),
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Cluster lifecycle /////////////////////////////////////////////////////

    /// Bootstrap the cluster live, on a running node with no prior state.
    ///
    /// This writes the initial configuration entry and starts an election.
    /// It fails with `CantBootstrap` on a node which has any existing term,
    /// log or snapshot state, so calling it on every member of a forming
    /// cluster is safe: the first election winner propagates its own entry.
    pub async fn bootstrap_cluster(&self, membership: Membership) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::Bootstrap { membership, tx }, None).await?;
        rx.await.map_err(|_| RaftError::Shutdown).and_then(|res| res)
    }

    /// Shutdown this Raft node. Idempotent; pending futures resolve with
    /// [`RaftError::Shutdown`].
    pub async fn shutdown(&self) -> RaftResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Observability /////////////////////////////////////////////////////////

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a snapshot of the node's current metrics.
    pub fn stats(&self) -> RaftMetrics {
        self.inner.rx_metrics.borrow().clone()
    }

    /// Get the id of the current cluster leader, as far as this node knows.
    pub async fn current_leader(&self) -> Option<ServerId> {
        self.inner.rx_metrics.borrow().current_leader.clone()
    }

    /// A boolean channel which yields `true` when this node acquires
    /// leadership and `false` when it loses it. Only the latest edge is
    /// retained.
    pub fn leader_watch(&self) -> watch::Receiver<bool> {
        self.inner.rx_leader.clone()
    }

    /// Register an observation channel. Full channels drop observations
    /// rather than blocking the engine.
    pub fn register_observer(&self, tx: mpsc::Sender<Observation>) -> u64 {
        self.inner.observers.register(tx)
    }

    /// Remove a previously registered observation channel.
    pub fn deregister_observer(&self, id: u64) {
        self.inner.observers.deregister(id)
    }

    /// Get a handle for awaiting metrics conditions, mostly useful in tests.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    async fn enqueue(&self, msg: RaftMsg<F::Data, F::Response>, timeout: Option<Duration>) -> RaftResult<()> {
        match timeout {
            Some(timeout) if timeout > Duration::from_millis(0) => {
                self.inner.tx_api.send_timeout(msg, timeout).await.map_err(|err| match err {
                    SendTimeoutError::Timeout(_) => RaftError::EnqueueTimeout,
                    SendTimeoutError::Closed(_) => RaftError::Shutdown,
                })
            }
            _ => self.inner.tx_api.send(msg).await.map_err(|_| RaftError::Shutdown),
        }
    }
}

impl<F, N, L, S, P> Clone for Raft<F, N, L, S, P>
where
    F: Fsm,
    N: RaftTransport<F::Data>,
    L: LogStore<F::Data>,
    S: StableStore,
    P: SnapshotStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Futures ///////////////////////////////////////////////////////////////////

/// A handle to an in-flight asynchronous operation.
///
/// The future resolves exactly once; awaiting it is how callers retrieve the
/// outcome. An operation abandoned by the engine (for example at shutdown)
/// resolves with [`RaftError::Shutdown`].
pub struct ResponseFuture<T> {
    rx: oneshot::Receiver<RaftResult<T>>,
}

impl<T> ResponseFuture<T> {
    pub(crate) fn new(rx: oneshot::Receiver<RaftResult<T>>) -> Self {
        Self { rx }
    }

    /// Produce a future which is already resolved with the given error.
    pub(crate) fn err(err: RaftError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = RaftResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(inner) => inner,
            Err(_) => Err(RaftError::Shutdown),
        })
    }
}

/// The future of a client apply, resolving with the applied index and the
/// state machine's response.
pub type ApplyFuture<R> = ResponseFuture<ApplyResponse<R>>;

/// The future of an operation which resolves with a log index.
pub type IndexFuture = ResponseFuture<u64>;

/// The future of a snapshot request, resolving with the snapshot's metadata.
pub type SnapshotFuture = ResponseFuture<SnapshotMeta>;

/// The outcome of a successfully applied client command.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyResponse<R: AppDataResponse> {
    /// The log index of the applied command.
    pub index: u64,
    /// The state machine's response.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

/// The committed and latest membership configurations of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct MembershipInfo {
    pub committed: Membership,
    pub committed_index: u64,
    pub latest: Membership,
    pub latest_index: u64,
}

//////////////////////////////////////////////////////////////////////////////
// Messages //////////////////////////////////////////////////////////////////

/// A message from the public handle to the core actor.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    Apply {
        data: D,
        extensions: Vec<u8>,
        tx: oneshot::Sender<RaftResult<ApplyResponse<R>>>,
    },
    Barrier {
        tx: oneshot::Sender<RaftResult<u64>>,
    },
    VerifyLeader {
        tx: oneshot::Sender<RaftResult<()>>,
    },
    ChangeMembership {
        change: ConfigChange,
        prev_index: u64,
        tx: oneshot::Sender<RaftResult<u64>>,
    },
    TakeSnapshot {
        tx: oneshot::Sender<RaftResult<SnapshotMeta>>,
    },
    GetMembership {
        tx: oneshot::Sender<RaftResult<MembershipInfo>>,
    },
    Bootstrap {
        membership: Membership,
        tx: oneshot::Sender<RaftResult<()>>,
    },
}

//////////////////////////////////////////////////////////////////////////////
// Log entries ///////////////////////////////////////////////////////////////

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// The membership carried by this entry, if it is a configuration entry.
    pub fn membership(&self) -> Option<&Membership> {
        match &self.payload {
            EntryPayload::Configuration { membership } => Some(membership),
            _ => None,
        }
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader at the start of its
    /// term, and used for barriers.
    Noop,
    /// An application command.
    #[serde(bound = "D: AppData")]
    Command {
        data: D,
        /// Opaque bytes carried alongside the command for FSM middleware.
        extensions: Vec<u8>,
    },
    /// A membership configuration.
    Configuration { membership: Membership },
    /// Legacy address-keyed voter addition (protocol version 2 and below,
    /// where a server's address doubles as its id). Never emitted; applied
    /// on receipt for wire compatibility.
    AddPeer { address: ServerAddress },
    /// Legacy address-keyed removal (protocol version 2 and below).
    RemovePeer { address: ServerAddress },
}

impl<D: AppData> EntryPayload<D> {
    /// A short human readable tag for tracing.
    pub fn kind(&self) -> &'static str {
        match self {
            EntryPayload::Noop => "noop",
            EntryPayload::Command { .. } => "command",
            EntryPayload::Configuration { .. } => "configuration",
            EntryPayload::AddPeer { .. } => "add-peer",
            EntryPayload::RemovePeer { .. } => "remove-peer",
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// RPCs //////////////////////////////////////////////////////////////////////

/// The header carried by every RPC request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    /// The protocol version spoken by the sender.
    pub protocol_version: u64,
}

impl RpcHeader {
    pub fn new(protocol_version: u64) -> Self {
        Self { protocol_version }
    }
}

/// An RPC sent by the cluster leader to replicate log entries (§5.3), and as
/// a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub header: RpcHeader,
    /// The leader's current term.
    pub term: u64,
    /// The leader's id.
    pub leader: ServerId,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new log entries to store. Empty for heartbeats.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term.
    pub term: u64,
    /// The responding node's last log index, used by the leader to jump its
    /// probe position after a rejection.
    pub last_log: u64,
    /// True when the follower contained an entry matching `prev_log_id` and
    /// accepted the batch.
    pub success: bool,
    /// True when the rejection is deterministic (missing or conflicting
    /// previous entry), telling the leader to retry immediately rather than
    /// backing off.
    pub no_retry_backoff: bool,
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub header: RpcHeader,
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's id.
    pub candidate: ServerId,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: u64,
    /// Set when the vote is requested as part of a leadership transfer, which
    /// exempts it from the leader-lease check.
    pub leadership_transfer: bool,
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// Whether the candidate received the vote.
    pub vote_granted: bool,
}

/// One segment of a snapshot stream sent by the leader to a follower which is
/// too far behind to be served from the log (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub header: RpcHeader,
    /// The leader's current term.
    pub term: u64,
    /// The leader's id.
    pub leader: ServerId,
    /// Metadata of the snapshot being streamed.
    pub meta: SnapshotMeta,
    /// The byte offset of this segment within the snapshot.
    pub offset: u64,
    /// The raw bytes of this segment.
    pub data: Vec<u8>,
    /// True for the final segment.
    pub done: bool,
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term.
    pub term: u64,
    /// Whether the segment was accepted.
    pub success: bool,
}
