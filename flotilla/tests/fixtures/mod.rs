//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use flotilla::async_trait::async_trait;
use flotilla::membership::Membership;
use flotilla::membership::Server;
use flotilla::membership::Suffrage;
use flotilla::metrics::RaftMetrics;
use flotilla::metrics::Wait;
use flotilla::raft::AppendEntriesRequest;
use flotilla::raft::AppendEntriesResponse;
use flotilla::raft::ApplyResponse;
use flotilla::raft::InstallSnapshotRequest;
use flotilla::raft::InstallSnapshotResponse;
use flotilla::raft::VoteRequest;
use flotilla::raft::VoteResponse;
use flotilla::recovery;
use flotilla::Config;
use flotilla::Raft;
use flotilla::RaftError;
use flotilla::RaftTransport;
use flotilla::ServerAddress;
use flotilla::ServerId;
use flotilla::State;
use memstore::MemClientData;
use memstore::MemFsm;
use memstore::MemLogStore;
use memstore::MemSnapshotStore;
use memstore::MemStableStore;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<MemFsm, NodeTransport, MemLogStore, MemStableStore, MemSnapshotStore>;

/// Everything belonging to one running test node.
#[derive(Clone)]
pub struct MemNode {
    pub raft: MemRaft,
    pub fsm: MemFsm,
    pub log_store: Arc<MemLogStore>,
    pub stable_store: Arc<MemStableStore>,
    pub snapshot_store: Arc<MemSnapshotStore>,
}

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config tuned for fast test clusters. Per-node ids are filled in by the
/// router.
pub fn test_config() -> Config {
    Config::build("test".into())
        .local_id("template".into())
        .heartbeat_timeout(100)
        .election_timeout(100)
        .leader_lease_timeout(100)
        .commit_timeout(10)
        .snapshot_interval(60_000)
        .validate()
        .expect("failed to build test config")
}

/// The long-stop timeout for cluster-wide convergence waits.
pub fn longstop() -> Duration {
    Duration::from_secs(5)
}

//////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network and routes RPCs between in-process nodes.
pub struct RaftRouter {
    /// The Raft runtime config template all nodes are built from.
    config: Config,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<ServerId, MemNode>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<ServerId>>,
}

/// The per-node transport handle: routes through the shared router and
/// carries the local address of its node.
pub struct NodeTransport {
    addr: ServerAddress,
    router: Arc<RaftRouter>,
}

#[async_trait]
impl RaftTransport<MemClientData> for NodeTransport {
    fn local_addr(&self) -> ServerAddress {
        self.addr.clone()
    }

    async fn append_entries(
        &self,
        target: &Server,
        rpc: AppendEntriesRequest<MemClientData>,
    ) -> Result<AppendEntriesResponse> {
        self.router.check_connected(&self.addr, &target.id).await?;
        let raft = self.router.get_raft(&target.id).await?;
        Ok(raft.append_entries(rpc).await?)
    }

    async fn vote(&self, target: &Server, rpc: VoteRequest) -> Result<VoteResponse> {
        self.router.check_connected(&self.addr, &target.id).await?;
        let raft = self.router.get_raft(&target.id).await?;
        Ok(raft.vote(rpc).await?)
    }

    async fn install_snapshot(
        &self,
        target: &Server,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.router.check_connected(&self.addr, &target.id).await?;
        let raft = self.router.get_raft(&target.id).await?;
        Ok(raft.install_snapshot(rpc).await?)
    }
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    async fn check_connected(&self, from: &str, to: &str) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(from) || isolated.contains(to) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(())
    }

    async fn get_raft(&self, id: &str) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        let node = rt.get(id).with_context(|| format!("node {} not found in routing table", id))?;
        Ok(node.raft.clone())
    }

    /// Create and register a pristine node with fresh stores.
    pub async fn new_raft_node(self: &Arc<Self>, id: &str) -> MemNode {
        self.new_raft_node_with_stores(
            id,
            MemFsm::new(),
            Arc::new(MemLogStore::new()),
            Arc::new(MemStableStore::new()),
            Arc::new(MemSnapshotStore::new()),
        )
        .await
    }

    /// Create and register a node running against the given stores, e.g. for
    /// restart scenarios.
    pub async fn new_raft_node_with_stores(
        self: &Arc<Self>,
        id: &str,
        fsm: MemFsm,
        log_store: Arc<MemLogStore>,
        stable_store: Arc<MemStableStore>,
        snapshot_store: Arc<MemSnapshotStore>,
    ) -> MemNode {
        let mut config = self.config.clone();
        config.local_id = id.to_string();
        let transport = Arc::new(NodeTransport {
            addr: id.to_string(),
            router: self.clone(),
        });
        let raft = Raft::new(
            Arc::new(config),
            fsm.clone(),
            log_store.clone(),
            stable_store.clone(),
            snapshot_store.clone(),
            transport,
        );
        let node = MemNode {
            raft,
            fsm,
            log_store,
            stable_store,
            snapshot_store,
        };
        self.routing_table.write().await.insert(id.to_string(), node.clone());
        node
    }

    /// Build a bootstrapped cluster of `n` voters with ids `"0".."n-1"` and
    /// wait for its first leader.
    pub async fn new_cluster(self: &Arc<Self>, n: usize) -> Result<ServerId> {
        let ids: Vec<String> = (0..n).map(|i| i.to_string()).collect();
        let membership = Membership::new(
            ids.iter().map(|id| Server::new(id.clone(), id.clone(), Suffrage::Voter)).collect(),
        );
        for id in &ids {
            let log_store = Arc::new(MemLogStore::new());
            let stable_store = Arc::new(MemStableStore::new());
            let snapshot_store = Arc::new(MemSnapshotStore::new());
            let mut config = self.config.clone();
            config.local_id = id.clone();
            recovery::bootstrap_cluster(
                &config,
                log_store.as_ref(),
                stable_store.as_ref(),
                snapshot_store.as_ref(),
                membership.clone(),
            )
            .await
            .map_err(|err| anyhow!("bootstrap failed: {}", err))?;
            self.new_raft_node_with_stores(id, MemFsm::new(), log_store, stable_store, snapshot_store).await;
        }
        self.wait_for_leader(longstop()).await
    }

    /// Get a handle to a registered node.
    pub async fn node(&self, id: &str) -> MemNode {
        let rt = self.routing_table.read().await;
        rt.get(id).unwrap_or_else(|| panic!("node {} does not exist in routing table", id)).clone()
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: &str) -> Option<MemNode> {
        let node = self.routing_table.write().await.remove(id);
        self.isolated_nodes.write().await.remove(id);
        node
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: &str) {
        tracing::info!(%id, "isolating node");
        self.isolated_nodes.write().await.insert(id.to_string());
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: &str) {
        tracing::info!(%id, "restoring node");
        self.isolated_nodes.write().await.remove(id);
    }

    /// Restore every isolated node.
    pub async fn fully_connect(&self) {
        self.isolated_nodes.write().await.clear();
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.raft.stats()).collect()
    }

    /// Get the id of the current, non-isolated leader, if any.
    pub async fn leader(&self) -> Option<ServerId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.state == State::Leader && !isolated.contains(&m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }

    /// Wait until a non-isolated node assumes leadership.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<ServerId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a cluster leader"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until a non-isolated node *other than* `not` assumes leadership.
    pub async fn wait_for_new_leader(&self, not: &str, timeout: Duration) -> Result<ServerId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                if leader != not {
                    return Ok(leader);
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a new cluster leader"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Get a wait handle for the target node's metrics.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(id).with_context(|| format!("node {} not found", id))?;
        Ok(node.raft.wait(timeout))
    }

    /// Wait for the target node's metrics to satisfy some condition.
    pub async fn wait_for_metrics<T>(
        &self,
        id: &str,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(id, timeout).await?;
        Ok(wait.metrics(func, msg).await?)
    }

    /// Wait for the specified nodes to reach `want_log` in their logs.
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<String>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the specified nodes to apply up to `want` to their FSMs.
    pub async fn wait_for_applied(
        &self,
        node_ids: &BTreeSet<String>,
        want: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.applied(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for the specified nodes to enter `want_state`.
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<String>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Apply a client payload on the target node, panicking on error.
    pub async fn client_request(&self, target: &str, payload: &[u8]) -> ApplyResponse<u64> {
        match self.try_client_request(target, payload).await {
            Ok(res) => res,
            Err(err) => panic!("client request on {} failed: {:?}", target, err),
        }
    }

    /// Apply a client payload on the target node.
    pub async fn try_client_request(
        &self,
        target: &str,
        payload: &[u8],
    ) -> std::result::Result<ApplyResponse<u64>, RaftError> {
        let raft = self.node(target).await.raft;
        raft.apply(payload.to_vec(), Some(Duration::from_secs(5))).await.await
    }

    /// Apply `count` numbered payloads on the target node.
    pub async fn client_request_many(&self, target: &str, prefix: &str, count: usize) {
        for idx in 0..count {
            self.client_request(target, format!("{}-{}", prefix, idx).as_bytes()).await;
        }
    }

    /// Assert that, within the timeout, every non-isolated FSM holds the same
    /// applied command sequence (of length `expect_len` if given).
    pub async fn ensure_same(&self, expect_len: Option<usize>, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let isolated = self.isolated_nodes.read().await.clone();
            let rt = self.routing_table.read().await;
            let mut first: Option<(String, Vec<MemClientData>)> = None;
            let mut all_match = true;
            for (id, node) in rt.iter().filter(|(id, _)| !isolated.contains(*id)) {
                let logs = node.fsm.logs().await;
                if let Some(want) = expect_len {
                    if logs.len() != want {
                        all_match = false;
                        break;
                    }
                }
                match &first {
                    None => first = Some((id.clone(), logs)),
                    Some((_, expected)) => {
                        if &logs != expected {
                            all_match = false;
                            break;
                        }
                    }
                }
            }
            drop(rt);
            if all_match && first.is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for FSMs to converge"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
