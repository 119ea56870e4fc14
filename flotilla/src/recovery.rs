//! Offline cluster bootstrap and manual recovery.
//!
//! These routines run against a node's stores while the node itself is *not*
//! running. They are the operator-facing half of cluster formation: bootstrap
//! seeds a brand new cluster with its initial voter set, and recovery forces
//! a new membership onto a cluster which has permanently lost its quorum.

use serde::Deserialize;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Membership;
use crate::membership::Server;
use crate::membership::Suffrage;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::storage::KEY_CURRENT_TERM;
use crate::AppData;
use crate::LogId;

/// Initialize a node's stores with the initial cluster membership.
///
/// Requires a completely clean slate: an empty log, no snapshots and no
/// recorded term. Fails with [`RaftError::CantBootstrap`] otherwise. Every
/// member of a forming cluster should be bootstrapped with the same
/// membership before first start.
pub async fn bootstrap_cluster<D, L, S, P>(
    _config: &Config,
    log_store: &L,
    stable_store: &S,
    snapshot_store: &P,
    membership: Membership,
) -> RaftResult<()>
where
    D: AppData,
    L: LogStore<D>,
    S: StableStore,
    P: SnapshotStore,
{
    membership.validate().map_err(RaftError::Membership)?;
    if has_existing_state(log_store, stable_store, snapshot_store).await? {
        return Err(RaftError::CantBootstrap);
    }

    stable_store.set_u64(KEY_CURRENT_TERM, 1).await.map_err(RaftError::Storage)?;
    let entry = Entry::<D> {
        log_id: LogId::new(1, 1),
        payload: EntryPayload::Configuration { membership },
    };
    log_store.store_logs(&[entry]).await.map_err(RaftError::Storage)?;
    Ok(())
}

/// Force a new membership onto a node's stores, so that a cluster which has
/// permanently lost a quorum of its servers can restart with an
/// operator-chosen voter set.
///
/// The supplied membership (typically parsed from a `peers.json` file with
/// [`read_peers_json`]) is appended as a fresh configuration entry past the
/// end of the existing log, overriding whatever membership the log held.
pub async fn recover_cluster<D, L, S, P>(
    _config: &Config,
    log_store: &L,
    stable_store: &S,
    snapshot_store: &P,
    membership: Membership,
) -> RaftResult<()>
where
    D: AppData,
    L: LogStore<D>,
    S: StableStore,
    P: SnapshotStore,
{
    membership.validate().map_err(RaftError::Membership)?;

    let term = stable_store
        .get_u64(KEY_CURRENT_TERM)
        .await
        .map_err(RaftError::Storage)?
        .unwrap_or(0)
        .max(1);
    let last_log = log_store.last_index().await.map_err(RaftError::Storage)?;
    let last_snap = snapshot_store
        .list()
        .await
        .map_err(RaftError::Storage)?
        .first()
        .map(|meta| meta.last_log_id.index)
        .unwrap_or(0);
    let index = last_log.max(last_snap) + 1;

    stable_store.set_u64(KEY_CURRENT_TERM, term).await.map_err(RaftError::Storage)?;
    let entry = Entry::<D> {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Configuration { membership },
    };
    log_store.store_logs(&[entry]).await.map_err(RaftError::Storage)?;
    Ok(())
}

async fn has_existing_state<D, L, S, P>(log_store: &L, stable_store: &S, snapshot_store: &P) -> RaftResult<bool>
where
    D: AppData,
    L: LogStore<D>,
    S: StableStore,
    P: SnapshotStore,
{
    if log_store.last_index().await.map_err(RaftError::Storage)? > 0 {
        return Ok(true);
    }
    if stable_store.get_u64(KEY_CURRENT_TERM).await.map_err(RaftError::Storage)?.unwrap_or(0) > 0 {
        return Ok(true);
    }
    if !snapshot_store.list().await.map_err(RaftError::Storage)?.is_empty() {
        return Ok(true);
    }
    Ok(false)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PeersFile {
    /// The v3 object form: `[{"id": ..., "address": ..., "non_voter": bool}]`.
    Servers(Vec<PeerEntry>),
    /// The legacy form: a bare array of addresses, each a voter whose address
    /// doubles as its id.
    Addresses(Vec<String>),
}

#[derive(Deserialize)]
struct PeerEntry {
    id: String,
    address: String,
    #[serde(default)]
    non_voter: bool,
}

/// Parse the contents of a `peers.json` recovery file into a [`Membership`].
///
/// Both formats are recognized: the legacy JSON array of addresses, and the
/// v3 array of `{id, address, non_voter}` objects.
pub fn read_peers_json(bytes: &[u8]) -> RaftResult<Membership> {
    let parsed: PeersFile = serde_json::from_slice(bytes)
        .map_err(|err| RaftError::Storage(anyhow::anyhow!("unable to parse peers file: {}", err)))?;
    let servers = match parsed {
        PeersFile::Addresses(addrs) => {
            addrs.into_iter().map(|addr| Server::new(addr.clone(), addr, Suffrage::Voter)).collect()
        }
        PeersFile::Servers(entries) => entries
            .into_iter()
            .map(|entry| {
                let suffrage = if entry.non_voter { Suffrage::Nonvoter } else { Suffrage::Voter };
                Server::new(entry.id, entry.address, suffrage)
            })
            .collect(),
    };
    let membership = Membership::new(servers);
    membership.validate().map_err(RaftError::Membership)?;
    Ok(membership)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_peers_json_legacy() {
        let raw = br#"["127.0.0.1:7000", "127.0.0.1:7001"]"#;
        let membership = read_peers_json(raw).unwrap();
        assert_eq!(membership.servers.len(), 2);
        assert!(membership.is_voter("127.0.0.1:7000"));
        assert_eq!(membership.server("127.0.0.1:7001").unwrap().address, "127.0.0.1:7001");
    }

    #[test]
    fn test_read_peers_json_v3() {
        let raw = br#"[
            {"id": "n1", "address": "127.0.0.1:7000"},
            {"id": "n2", "address": "127.0.0.1:7001", "non_voter": true}
        ]"#;
        let membership = read_peers_json(raw).unwrap();
        assert!(membership.is_voter("n1"));
        assert_eq!(membership.server("n2").unwrap().suffrage, Suffrage::Nonvoter);
    }

    #[test]
    fn test_read_peers_json_rejects_garbage() {
        assert!(read_peers_json(b"{}").is_err());
        assert!(read_peers_json(b"[]").is_err());
    }
}
