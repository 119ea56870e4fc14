//! An async implementation of the Raft distributed consensus protocol.
//!
//! A cluster of peers cooperatively maintains a totally ordered, durable log
//! of commands. Each peer applies committed commands to an identical,
//! deterministic application state machine, yielding strong consistency under
//! node crashes, restarts, network partitions and message reordering.
//!
//! The engine is generic over five collaborator contracts bound at
//! construction: the application state machine ([`Fsm`]), the log store
//! ([`LogStore`]), the stable store ([`StableStore`]), the snapshot store
//! ([`SnapshotStore`]) and the network transport ([`RaftTransport`]). The
//! companion `memstore` crate provides in-memory implementations of all of
//! them, which the test-suite runs against.

pub mod config;
mod core;
pub mod error;
pub mod fsm;
pub mod membership;
pub mod metrics;
pub mod observer;
pub mod quorum;
pub mod raft;
pub mod recovery;
mod replication;
pub mod storage;
pub mod transport;
pub mod util;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::core::State;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::fsm::Fsm;
pub use crate::fsm::FsmSnapshot;
pub use crate::membership::Membership;
pub use crate::membership::Server;
pub use crate::membership::Suffrage;
pub use crate::metrics::RaftMetrics;
pub use crate::raft::Raft;
pub use crate::storage::LogStore;
pub use crate::storage::SnapshotMeta;
pub use crate::storage::SnapshotSink;
pub use crate::storage::SnapshotStore;
pub use crate::storage::StableStore;
pub use crate::transport::RaftTransport;

/// The stable identity of a cluster member. Unique and stable across restarts.
pub type ServerId = String;

/// The network address of a cluster member. May change across restarts.
pub type ServerAddress = String;

/// The identity of a snapshot, assigned by the snapshot store.
pub type SnapshotId = String;

/// The term and index pair identifying a log entry's position.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait defining application specific data carried in Raft log entries.
///
/// The intention of this trait is that applications which are using this crate
/// will be able to use their own concrete data types throughout their
/// application without having to serialize and deserialize their data as it
/// goes through Raft. Instead, applications can present their data models
/// as-is, and the data will be serialized only when it hits the wire or the
/// persistence layer.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static> AppData for T {}

/// A trait defining the application's response to a successfully applied entry.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static> AppDataResponse for T {}
