//! Error types exposed by this crate.

use thiserror::Error;

use crate::membership::Server;
use crate::SnapshotId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants with which client futures and RPC handlers may resolve.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The operation was submitted to a node which is not the cluster leader.
    ///
    /// The hint names the leader this node last observed, when it has one.
    #[error("node is not the leader")]
    NotLeader {
        /// The last observed cluster leader, if any.
        leader: Option<Server>,
    },
    /// Leadership was lost while the request was in flight.
    #[error("leadership lost while request was in flight")]
    LeadershipLost,
    /// The Raft node is shutdown, or was shutdown before the request completed.
    #[error("raft is already shutdown")]
    Shutdown,
    /// The client queue stayed full for the whole enqueue timeout.
    #[error("timed out enqueuing operation")]
    EnqueueTimeout,
    /// A snapshot was requested but the state machine has applied nothing new.
    #[error("nothing new to snapshot")]
    NothingNewToSnapshot,
    /// The operation is not supported at the configured protocol version.
    #[error("operation not supported with current protocol version")]
    UnsupportedProtocol,
    /// Bootstrap was attempted on a node which already has state.
    #[error("bootstrap only works on new clusters")]
    CantBootstrap,
    /// The membership has changed since the index named by the request.
    #[error("membership changed since index {prev_index} (latest is {latest_index})")]
    ConfigurationChanged { prev_index: u64, latest_index: u64 },
    /// A required log entry was not found in the log store.
    #[error("log entry {index} not found")]
    LogNotFound { index: u64 },
    /// The proposed membership failed validation.
    #[error(transparent)]
    Membership(#[from] MembershipError),
    /// An RPC carried a protocol version outside the supported window.
    #[error("protocol version {got} not in supported range [{min}, {max}]")]
    ProtocolVersion { got: u64, min: u64, max: u64 },
    /// An out-of-order snapshot segment was received.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// An error coming from one of the storage collaborators.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
    /// An error coming from the network transport.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl From<std::io::Error> for RaftError {
    fn from(src: std::io::Error) -> Self {
        RaftError::Storage(anyhow::Error::new(src))
    }
}

/// The id and byte offset of a snapshot segment on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl std::fmt::Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}+{}", self.id, self.offset)
    }
}

/// Validation errors for a proposed membership configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("membership has no servers")]
    Empty,
    #[error("membership needs at least one voter")]
    NoVoter,
    #[error("server id {0} appears more than once")]
    DuplicateId(String),
    #[error("server address {0} appears more than once")]
    DuplicateAddress(String),
    #[error("server id may not be empty")]
    EmptyId,
    #[error("server address may not be empty")]
    EmptyAddress,
}
