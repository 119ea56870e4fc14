//! The persistent storage contracts and their data types.
//!
//! Three separate stores back a Raft node: the log store holding the entries
//! themselves, the stable store holding the small set of values which must
//! survive crashes (term and vote), and the snapshot store holding serialized
//! state machine snapshots. All three are single-writer from the engine's
//! point of view.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::membership::Membership;
use crate::raft::Entry;
use crate::AppData;
use crate::LogId;
use crate::SnapshotId;

/// Stable store key under which the current term is persisted.
pub const KEY_CURRENT_TERM: &str = "currentTerm";
/// Stable store key under which the term of the last granted vote is persisted.
pub const KEY_LAST_VOTE_TERM: &str = "lastVoteTerm";
/// Stable store key under which the candidate of the last granted vote is persisted.
pub const KEY_LAST_VOTE_CAND: &str = "lastVoteCand";

/// The metadata describing a snapshot held in a snapshot store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The snapshot format version.
    pub version: u64,
    /// The store-assigned identity of the snapshot.
    pub id: SnapshotId,
    /// The log entry covered by this snapshot, inclusive.
    pub last_log_id: LogId,
    /// The membership configuration covered by the snapshot.
    pub membership: Membership,
    /// The log index at which `membership` was appended.
    pub membership_index: u64,
    /// The size of the snapshot payload in bytes.
    pub size: u64,
}

/// A store for Raft log entries.
///
/// Append order is preserved. A partial batch failure is undefined behavior
/// and treated as fatal by the engine.
#[async_trait]
pub trait LogStore<D: AppData>: Send + Sync + 'static {
    /// The index of the first entry in the log, 0 when the log is empty.
    async fn first_index(&self) -> Result<u64>;

    /// The index of the last entry in the log, 0 when the log is empty.
    async fn last_index(&self) -> Result<u64>;

    /// Get the entry at the given index, or `None` if it is not present.
    async fn get_log(&self, index: u64) -> Result<Option<Entry<D>>>;

    /// Get the entries within `[start, stop)`.
    ///
    /// Implementations return only the entries actually present; the engine
    /// detects compaction gaps itself.
    async fn get_log_range(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>>;

    /// Append a batch of entries to the log.
    async fn store_logs(&self, entries: &[Entry<D>]) -> Result<()>;

    /// Delete all entries within the inclusive range `[start, stop]`.
    async fn delete_range(&self, start: u64, stop: u64) -> Result<()>;
}

/// A store for the few small values which must survive crashes.
#[async_trait]
pub trait StableStore: Send + Sync + 'static {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_u64(&self, key: &str, value: u64) -> Result<()>;

    async fn get_u64(&self, key: &str) -> Result<Option<u64>>;
}

/// A write handle for a snapshot being created or received.
///
/// Bytes are streamed in through the `AsyncWrite` impl. Shutting the writer
/// down finalizes the snapshot in its store; `cancel` discards it instead.
#[async_trait]
pub trait SnapshotSink: AsyncWrite + Send + Unpin {
    /// The store-assigned id of the snapshot being written.
    fn id(&self) -> SnapshotId;

    /// Discard the partially written snapshot.
    async fn cancel(&mut self) -> Result<()>;
}

/// A store for serialized state machine snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Open a sink for a new snapshot covering the log up to `last_log_id`.
    async fn create(
        &self,
        version: u64,
        last_log_id: LogId,
        membership: Membership,
        membership_index: u64,
    ) -> Result<Box<dyn SnapshotSink>>;

    /// List the metadata of the stored snapshots, newest first.
    async fn list(&self) -> Result<Vec<SnapshotMeta>>;

    /// Open the snapshot with the given id for reading.
    async fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn AsyncRead + Send + Unpin>)>;
}
