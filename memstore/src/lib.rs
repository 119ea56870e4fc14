//! In-memory implementations of the `flotilla` collaborator contracts.
//!
//! These types back the integration test-suite and double as reference
//! implementations of the storage traits: [`MemLogStore`], [`MemStableStore`]
//! and [`MemSnapshotStore`] hold everything in process memory, and
//! [`MemFsm`] is a mock state machine which records every applied command so
//! tests can compare state machines across a cluster.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::convert::TryInto;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;

use anyhow::Result;
use async_trait::async_trait;
use flotilla::fsm::Fsm;
use flotilla::fsm::FsmSnapshot;
use flotilla::membership::Membership;
use flotilla::raft::Entry;
use flotilla::raft::EntryPayload;
use flotilla::storage::LogStore;
use flotilla::storage::SnapshotMeta;
use flotilla::storage::SnapshotSink;
use flotilla::storage::SnapshotStore;
use flotilla::storage::StableStore;
use flotilla::LogId;
use flotilla::SnapshotId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// The application data type used by the in-memory state machine: an opaque
/// byte payload.
pub type MemClientData = Vec<u8>;

/// Errors surfaced by the in-memory stores.
#[derive(Debug, Error)]
pub enum MemStoreError {
    /// A stable store value was read as a u64 but does not hold one.
    #[error("stable store value under {0} is not a u64")]
    NotAnUnsigned(String),
    /// The requested snapshot id is unknown to the snapshot store.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),
}

//////////////////////////////////////////////////////////////////////////////
// MemLogStore ///////////////////////////////////////////////////////////////

/// An in-memory log store.
#[derive(Default)]
pub struct MemLogStore {
    log: RwLock<BTreeMap<u64, Entry<MemClientData>>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a full copy of the log, for test assertions.
    pub async fn dump(&self) -> Vec<Entry<MemClientData>> {
        self.log.read().await.values().cloned().collect()
    }

    /// Insert an entry directly, bypassing the engine. Test helper.
    pub async fn put(&self, entry: Entry<MemClientData>) {
        self.log.write().await.insert(entry.log_id.index, entry);
    }
}

#[async_trait]
impl LogStore<MemClientData> for MemLogStore {
    async fn first_index(&self) -> Result<u64> {
        Ok(self.log.read().await.keys().next().copied().unwrap_or(0))
    }

    async fn last_index(&self) -> Result<u64> {
        Ok(self.log.read().await.keys().next_back().copied().unwrap_or(0))
    }

    async fn get_log(&self, index: u64) -> Result<Option<Entry<MemClientData>>> {
        Ok(self.log.read().await.get(&index).cloned())
    }

    async fn get_log_range(&self, start: u64, stop: u64) -> Result<Vec<Entry<MemClientData>>> {
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(self.log.read().await.range(start..stop).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self, entries), fields(n = entries.len()))]
    async fn store_logs(&self, entries: &[Entry<MemClientData>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry.clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_range(&self, start: u64, stop: u64) -> Result<()> {
        if start > stop {
            return Ok(());
        }
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(start..=stop).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// MemStableStore ////////////////////////////////////////////////////////////

/// An in-memory stable store.
#[derive(Default)]
pub struct MemStableStore {
    kv: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StableStore for MemStableStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.kv.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.read().await.get(key).cloned())
    }

    async fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, &value.to_le_bytes()).await
    }

    async fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        let raw = match self.get(key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let bytes: [u8; 8] =
            raw.as_slice().try_into().map_err(|_| MemStoreError::NotAnUnsigned(key.to_string()))?;
        Ok(Some(u64::from_le_bytes(bytes)))
    }
}

//////////////////////////////////////////////////////////////////////////////
// MemSnapshotStore //////////////////////////////////////////////////////////

#[derive(Default)]
struct SnapshotStoreInner {
    /// Finalized snapshots, newest first.
    snapshots: Vec<(SnapshotMeta, Arc<Vec<u8>>)>,
}

/// An in-memory snapshot store.
#[derive(Clone, Default)]
pub struct MemSnapshotStore {
    inner: Arc<Mutex<SnapshotStoreInner>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of finalized snapshots held. Test helper.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("snapshot store poisoned").snapshots.len()
    }
}

#[async_trait]
impl SnapshotStore for MemSnapshotStore {
    #[tracing::instrument(level = "trace", skip(self, membership))]
    async fn create(
        &self,
        version: u64,
        last_log_id: LogId,
        membership: Membership,
        membership_index: u64,
    ) -> Result<Box<dyn SnapshotSink>> {
        let id = format!(
            "{}-{}-{:08x}",
            last_log_id.term,
            last_log_id.index,
            rand::random::<u32>()
        );
        Ok(Box::new(MemSnapshotSink {
            meta: SnapshotMeta {
                version,
                id,
                last_log_id,
                membership,
                membership_index,
                size: 0,
            },
            buf: Vec::new(),
            store: self.inner.clone(),
            closed: false,
        }))
    }

    async fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let inner = self.inner.lock().expect("snapshot store poisoned");
        Ok(inner.snapshots.iter().map(|(meta, _)| meta.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn AsyncRead + Send + Unpin>)> {
        let inner = self.inner.lock().expect("snapshot store poisoned");
        let (meta, data) = inner
            .snapshots
            .iter()
            .find(|(meta, _)| meta.id == id)
            .ok_or_else(|| MemStoreError::SnapshotNotFound(id.to_string()))?;
        let reader = Cursor::new(data.as_ref().clone());
        Ok((meta.clone(), Box::new(reader)))
    }
}

/// A sink collecting snapshot bytes in memory; finalizes into its store on
/// shutdown.
pub struct MemSnapshotSink {
    meta: SnapshotMeta,
    buf: Vec<u8>,
    store: Arc<Mutex<SnapshotStoreInner>>,
    closed: bool,
}

impl AsyncWrite for MemSnapshotSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.closed {
            this.closed = true;
            let mut meta = this.meta.clone();
            meta.size = this.buf.len() as u64;
            let data = Arc::new(std::mem::take(&mut this.buf));
            let mut inner = this.store.lock().expect("snapshot store poisoned");
            inner.snapshots.insert(0, (meta, data));
        }
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl SnapshotSink for MemSnapshotSink {
    fn id(&self) -> SnapshotId {
        self.meta.id.clone()
    }

    async fn cancel(&mut self) -> Result<()> {
        self.closed = true;
        self.buf.clear();
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// MemFsm ////////////////////////////////////////////////////////////////////

/// The serializable state held by [`MemFsm`].
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct MemFsmState {
    pub last_applied: LogId,
    /// Every applied command payload, in apply order.
    pub logs: Vec<MemClientData>,
}

/// A mock state machine recording every applied command.
///
/// The handle is cheaply cloneable; the engine owns one clone and tests keep
/// another to inspect the applied log.
#[derive(Clone, Default)]
pub struct MemFsm {
    state: Arc<RwLock<MemFsmState>>,
}

impl MemFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A full copy of the current state.
    pub async fn state(&self) -> MemFsmState {
        self.state.read().await.clone()
    }

    /// The applied command payloads, in order.
    pub async fn logs(&self) -> Vec<MemClientData> {
        self.state.read().await.logs.clone()
    }

    /// The log id of the last applied command.
    pub async fn last_applied(&self) -> LogId {
        self.state.read().await.last_applied
    }
}

#[async_trait]
impl Fsm for MemFsm {
    type Data = MemClientData;
    type Response = u64;
    type Snapshot = MemFsmSnapshot;

    async fn apply(&mut self, entry: &Entry<Self::Data>) -> Result<Self::Response> {
        let data = match &entry.payload {
            EntryPayload::Command { data, .. } => data.clone(),
            payload => anyhow::bail!("non-command entry {} reached the state machine", payload.kind()),
        };
        let mut state = self.state.write().await;
        state.logs.push(data);
        state.last_applied = entry.log_id;
        Ok(state.logs.len() as u64)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn snapshot(&mut self) -> Result<Self::Snapshot> {
        let state = self.state.read().await.clone();
        tracing::debug!(last_applied=%state.last_applied, logs = state.logs.len(), "capturing state machine snapshot");
        Ok(MemFsmSnapshot {
            data: serde_json::to_vec(&state)?,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, source))]
    async fn restore(&mut self, mut source: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
        let mut raw = Vec::new();
        source.read_to_end(&mut raw).await?;
        let restored: MemFsmState = serde_json::from_slice(&raw)?;
        tracing::debug!(last_applied=%restored.last_applied, logs = restored.logs.len(), "restoring state machine from snapshot");
        *self.state.write().await = restored;
        Ok(())
    }
}

/// A point-in-time capture of a [`MemFsm`].
pub struct MemFsmSnapshot {
    data: Vec<u8>,
}

#[async_trait]
impl FsmSnapshot for MemFsmSnapshot {
    async fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()> {
        sink.write_all(&self.data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla::membership::Server;
    use flotilla::membership::Suffrage;

    fn entry(term: u64, index: u64, data: &[u8]) -> Entry<MemClientData> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Command {
                data: data.to_vec(),
                extensions: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_log_store_indexes_and_delete_range() {
        let store = MemLogStore::new();
        assert_eq!(store.first_index().await.unwrap(), 0);
        assert_eq!(store.last_index().await.unwrap(), 0);

        let entries: Vec<_> = (1..=10).map(|i| entry(1, i, format!("e{}", i).as_bytes())).collect();
        store.store_logs(&entries).await.unwrap();
        assert_eq!(store.first_index().await.unwrap(), 1);
        assert_eq!(store.last_index().await.unwrap(), 10);

        store.delete_range(1, 4).await.unwrap();
        assert_eq!(store.first_index().await.unwrap(), 5);
        assert!(store.get_log(4).await.unwrap().is_none());
        assert_eq!(store.get_log_range(5, 8).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stable_store_u64_roundtrip() {
        let store = MemStableStore::new();
        assert_eq!(store.get_u64("currentTerm").await.unwrap(), None);
        store.set_u64("currentTerm", 42).await.unwrap();
        assert_eq!(store.get_u64("currentTerm").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_snapshot_store_create_list_open() {
        let store = MemSnapshotStore::new();
        let membership = Membership::new(vec![Server::new("n1", "addr1", Suffrage::Voter)]);

        let mut sink = store.create(1, LogId::new(1, 5), membership.clone(), 1).await.unwrap();
        sink.write_all(b"snapshot-bytes").await.unwrap();
        sink.shutdown().await.unwrap();

        let metas = store.list().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].last_log_id, LogId::new(1, 5));
        assert_eq!(metas[0].size, 14);

        let (meta, mut reader) = store.open(&metas[0].id).await.unwrap();
        assert_eq!(meta.membership, membership);
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"snapshot-bytes");
    }

    #[tokio::test]
    async fn test_cancelled_sink_is_not_listed() {
        let store = MemSnapshotStore::new();
        let membership = Membership::new(vec![Server::new("n1", "addr1", Suffrage::Voter)]);
        let mut sink = store.create(1, LogId::new(1, 5), membership, 1).await.unwrap();
        sink.write_all(b"partial").await.unwrap();
        sink.cancel().await.unwrap();
        sink.shutdown().await.unwrap();
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_fsm_apply_snapshot_restore() {
        let mut fsm = MemFsm::new();
        for i in 1..=3u64 {
            let res = fsm.apply(&entry(1, i, format!("cmd{}", i).as_bytes())).await.unwrap();
            assert_eq!(res, i);
        }
        assert_eq!(fsm.last_applied().await, LogId::new(1, 3));

        let capture = fsm.snapshot().await.unwrap();
        let store = MemSnapshotStore::new();
        let membership = Membership::new(vec![Server::new("n1", "addr1", Suffrage::Voter)]);
        let mut sink = store.create(1, LogId::new(1, 3), membership, 0).await.unwrap();
        capture.persist(sink.as_mut()).await.unwrap();
        sink.shutdown().await.unwrap();

        let id = store.list().await.unwrap()[0].id.clone();
        let (_, reader) = store.open(&id).await.unwrap();

        let mut other = MemFsm::new();
        other.restore(reader).await.unwrap();
        assert_eq!(other.logs().await, vec![b"cmd1".to_vec(), b"cmd2".to_vec(), b"cmd3".to_vec()]);
        assert_eq!(other.last_applied().await, LogId::new(1, 3));
    }
}
