//! The network transport contract.

use anyhow::Result;
use async_trait::async_trait;

use crate::membership::Server;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::ServerAddress;

/// A trait defining the interface for the Raft network layer.
///
/// The engine only ever sends through this trait. Inbound RPCs are delivered
/// by the transport implementation invoking the corresponding methods on the
/// local [`Raft`](crate::Raft) handle when a frame arrives, which feeds the
/// core's rpc queue.
///
/// Typically, the transport will be a shared client pool keyed by peer
/// address; peers are addressed by the full [`Server`] record so that an
/// implementation may route by id or by address as it sees fit.
#[async_trait]
pub trait RaftTransport<D: AppData>: Send + Sync + 'static {
    /// The address the local node is reachable at.
    fn local_addr(&self) -> ServerAddress;

    /// Encode a peer address for inclusion in persisted or transmitted data.
    fn encode_peer(&self, address: &str) -> Vec<u8> {
        address.as_bytes().to_vec()
    }

    /// Decode a peer address previously produced by `encode_peer`.
    fn decode_peer(&self, raw: &[u8]) -> ServerAddress {
        String::from_utf8_lossy(raw).into_owned()
    }

    /// Send an AppendEntries RPC to the target peer.
    async fn append_entries(&self, target: &Server, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target peer.
    async fn vote(&self, target: &Server, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send an InstallSnapshot RPC segment to the target peer.
    async fn install_snapshot(&self, target: &Server, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse>;
}
