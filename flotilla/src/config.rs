//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::ServerId;

/// The lowest protocol version this implementation can speak.
pub const PROTOCOL_VERSION_MIN: u64 = 0;
/// The highest protocol version this implementation can speak.
pub const PROTOCOL_VERSION_MAX: u64 = 3;

/// The snapshot format version written by this implementation.
pub const SNAPSHOT_VERSION: u64 = 1;

/// The runtime configuration for a Raft node.
///
/// When building the Raft configuration for your application, remember this
/// inequality from the Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
/// Keep the election timeout high enough that the performance of your network
/// will not cause spurious elections, but not so high that a real leader crash
/// causes prolonged downtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The stable id of the local server. Required at protocol version 3;
    /// below that it defaults to the transport's local address.
    pub local_id: ServerId,
    /// The base follower timeout in milliseconds. An actual election timer is
    /// drawn uniformly from `[timeout, 2 * timeout)`. The leader heartbeat
    /// cadence is a tenth of this value.
    pub heartbeat_timeout: u64,
    /// The base candidate vote-collection timeout in milliseconds, randomized
    /// the same way as the heartbeat timeout.
    pub election_timeout: u64,
    /// The longest a leader will keep serving without a quorum of heartbeat
    /// acks, in milliseconds. Must not exceed `heartbeat_timeout`.
    pub leader_lease_timeout: u64,
    /// The cadence at which the leader re-broadcasts its commit index to the
    /// replication streams, in milliseconds.
    pub commit_timeout: u64,
    /// The maximum number of entries carried by a single AppendEntries RPC.
    pub max_append_entries: u64,
    /// The period of the automatic snapshot check, in milliseconds.
    pub snapshot_interval: u64,
    /// The minimum number of applied-but-uncompacted entries before the
    /// automatic snapshot check fires.
    pub snapshot_threshold: u64,
    /// The number of recent log entries retained after compaction so that
    /// slightly lagging followers can still be served from the log.
    pub trailing_logs: u64,
    /// The timeout for sending one snapshot segment, in milliseconds.
    pub install_snapshot_timeout: u64,
    /// The maximum byte size of a single snapshot segment on the wire.
    pub snapshot_max_chunk_size: u64,
    /// Whether a leader which removes itself from the cluster shuts down once
    /// the removal commits, instead of staying around as a non-voter.
    pub shutdown_on_remove: bool,
    /// Skip the follower state at boot and assume leadership immediately.
    /// A single-node test and bootstrap affordance only.
    pub start_as_leader: bool,
    /// The wire and API protocol level spoken by this node.
    pub protocol_version: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            local_id: None,
            heartbeat_timeout: None,
            election_timeout: None,
            leader_lease_timeout: None,
            commit_timeout: None,
            max_append_entries: None,
            snapshot_interval: None,
            snapshot_threshold: None,
            trailing_logs: None,
            install_snapshot_timeout: None,
            snapshot_max_chunk_size: None,
            shutdown_on_remove: None,
            start_as_leader: None,
            protocol_version: None,
        }
    }

    /// Generate a new random election timeout within `[T, 2T)` milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.heartbeat_timeout..self.heartbeat_timeout * 2)
    }

    /// Generate a new random candidate timeout within `[T, 2T)` milliseconds.
    pub fn new_rand_candidate_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout..self.election_timeout * 2)
    }

    /// The leader heartbeat cadence in milliseconds.
    pub fn heartbeat_interval(&self) -> u64 {
        std::cmp::max(1, self.heartbeat_timeout / 10)
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    local_id: Option<ServerId>,
    heartbeat_timeout: Option<u64>,
    election_timeout: Option<u64>,
    leader_lease_timeout: Option<u64>,
    commit_timeout: Option<u64>,
    max_append_entries: Option<u64>,
    snapshot_interval: Option<u64>,
    snapshot_threshold: Option<u64>,
    trailing_logs: Option<u64>,
    install_snapshot_timeout: Option<u64>,
    snapshot_max_chunk_size: Option<u64>,
    shutdown_on_remove: Option<bool>,
    start_as_leader: Option<bool>,
    protocol_version: Option<u64>,
}

impl ConfigBuilder {
    /// Set the stable id of the local server.
    pub fn local_id(mut self, id: ServerId) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Set the base follower timeout in milliseconds.
    pub fn heartbeat_timeout(mut self, val: u64) -> Self {
        self.heartbeat_timeout = Some(val);
        self
    }

    /// Set the base candidate vote-collection timeout in milliseconds.
    pub fn election_timeout(mut self, val: u64) -> Self {
        self.election_timeout = Some(val);
        self
    }

    /// Set the leader lease timeout in milliseconds.
    pub fn leader_lease_timeout(mut self, val: u64) -> Self {
        self.leader_lease_timeout = Some(val);
        self
    }

    /// Set the commit re-broadcast cadence in milliseconds.
    pub fn commit_timeout(mut self, val: u64) -> Self {
        self.commit_timeout = Some(val);
        self
    }

    /// Set the maximum number of entries per AppendEntries RPC.
    pub fn max_append_entries(mut self, val: u64) -> Self {
        self.max_append_entries = Some(val);
        self
    }

    /// Set the period of the automatic snapshot check in milliseconds.
    pub fn snapshot_interval(mut self, val: u64) -> Self {
        self.snapshot_interval = Some(val);
        self
    }

    /// Set the automatic snapshot threshold.
    pub fn snapshot_threshold(mut self, val: u64) -> Self {
        self.snapshot_threshold = Some(val);
        self
    }

    /// Set the number of log entries retained after compaction.
    pub fn trailing_logs(mut self, val: u64) -> Self {
        self.trailing_logs = Some(val);
        self
    }

    /// Set the per-segment snapshot send timeout in milliseconds.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the maximum byte size of a snapshot segment.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set whether a removed leader shuts down once its removal commits.
    pub fn shutdown_on_remove(mut self, val: bool) -> Self {
        self.shutdown_on_remove = Some(val);
        self
    }

    /// Skip the follower state at boot. Test and bootstrap affordance only.
    pub fn start_as_leader(mut self, val: bool) -> Self {
        self.start_as_leader = Some(val);
        self
    }

    /// Set the protocol version spoken by this node.
    pub fn protocol_version(mut self, val: u64) -> Self {
        self.protocol_version = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance
    /// if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let heartbeat_timeout = self.heartbeat_timeout.unwrap_or(1000);
        let election_timeout = self.election_timeout.unwrap_or(1000);
        let leader_lease_timeout = self.leader_lease_timeout.unwrap_or(500);
        let protocol_version = self.protocol_version.unwrap_or(PROTOCOL_VERSION_MAX);
        let local_id = self.local_id.unwrap_or_default();

        if heartbeat_timeout < 5 {
            return Err(ConfigError::InvalidTimeout {
                name: "heartbeat_timeout",
                min: 5,
            });
        }
        if election_timeout < 5 {
            return Err(ConfigError::InvalidTimeout {
                name: "election_timeout",
                min: 5,
            });
        }
        if leader_lease_timeout > heartbeat_timeout {
            return Err(ConfigError::LeaseExceedsHeartbeat {
                lease: leader_lease_timeout,
                heartbeat: heartbeat_timeout,
            });
        }
        if protocol_version > PROTOCOL_VERSION_MAX {
            return Err(ConfigError::InvalidProtocolVersion {
                got: protocol_version,
                max: PROTOCOL_VERSION_MAX,
            });
        }
        if protocol_version >= 3 && local_id.is_empty() {
            return Err(ConfigError::LocalIdRequired);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            local_id,
            heartbeat_timeout,
            election_timeout,
            leader_lease_timeout,
            commit_timeout: self.commit_timeout.unwrap_or(50),
            max_append_entries: self.max_append_entries.unwrap_or(64),
            snapshot_interval: self.snapshot_interval.unwrap_or(120_000),
            snapshot_threshold: self.snapshot_threshold.unwrap_or(8192),
            trailing_logs: self.trailing_logs.unwrap_or(10_240),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(2000),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(64 * 1024),
            shutdown_on_remove: self.shutdown_on_remove.unwrap_or(true),
            start_as_leader: self.start_as_leader.unwrap_or(false),
            protocol_version,
        })
    }
}

/// A configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be at least {min}ms")]
    InvalidTimeout { name: &'static str, min: u64 },
    #[error("leader_lease_timeout ({lease}ms) must not exceed heartbeat_timeout ({heartbeat}ms)")]
    LeaseExceedsHeartbeat { lease: u64, heartbeat: u64 },
    #[error("protocol version {got} exceeds the maximum supported version {max}")]
    InvalidProtocolVersion { got: u64, max: u64 },
    #[error("local_id is required at protocol version 3 and above")]
    LocalIdRequired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("test".into()).local_id("n1".into()).validate().unwrap();
        assert_eq!(cfg.cluster_name, "test");
        assert_eq!(cfg.protocol_version, PROTOCOL_VERSION_MAX);
        assert!(cfg.leader_lease_timeout <= cfg.heartbeat_timeout);
        assert_eq!(cfg.heartbeat_interval(), cfg.heartbeat_timeout / 10);
    }

    #[test]
    fn test_lease_must_not_exceed_heartbeat() {
        let res = Config::build("test".into())
            .local_id("n1".into())
            .heartbeat_timeout(100)
            .leader_lease_timeout(200)
            .validate();
        assert_eq!(
            res.unwrap_err(),
            ConfigError::LeaseExceedsHeartbeat { lease: 200, heartbeat: 100 }
        );
    }

    #[test]
    fn test_local_id_required_at_v3() {
        let res = Config::build("test".into()).protocol_version(3).validate();
        assert_eq!(res.unwrap_err(), ConfigError::LocalIdRequired);

        let res = Config::build("test".into()).protocol_version(2).validate();
        assert!(res.is_ok());
    }

    #[test]
    fn test_rand_election_timeout_range() {
        let cfg = Config::build("test".into()).local_id("n1".into()).heartbeat_timeout(100).leader_lease_timeout(100).validate().unwrap();
        for _ in 0..1000 {
            let t = cfg.new_rand_election_timeout();
            assert!((100..200).contains(&t), "timeout {} out of [100, 200)", t);
        }
    }
}
