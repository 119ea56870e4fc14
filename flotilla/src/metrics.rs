//! Raft metrics for observability.
//!
//! Every Raft node spawned by this crate exposes a metrics channel carrying
//! the baseline metrics of the node's internal state: its current role, term,
//! log position, applied index, known leader, membership and snapshot
//! position. Metrics are published on every relevant change via a `watch`
//! channel, so consumers always read the latest value and may await changes.

use std::time::Duration;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::State;
use crate::membership::Membership;
use crate::LogId;
use crate::ServerId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftMetrics {
    /// The id of the Raft node.
    pub id: ServerId,
    /// The role of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index appended to the Raft node's log.
    pub last_log_index: u64,
    /// The last log index applied to the state machine.
    pub last_applied: u64,
    /// The highest index known to be committed.
    pub commit_index: u64,
    /// The current cluster leader, as far as this node knows.
    pub current_leader: Option<ServerId>,
    /// The latest membership configuration known to this node.
    pub membership: Membership,
    /// The log index at which the latest membership was appended.
    pub membership_index: u64,
    /// The log position covered by the most recent local snapshot.
    pub snapshot: LogId,
    /// The time of the last contact from a valid leader, or for a leader, the
    /// last time a quorum of heartbeat acks was confirmed.
    pub last_contact: Option<Instant>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: ServerId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            current_leader: None,
            membership: Membership::default(),
            membership_index: 0,
            snapshot: LogId::default(),
            last_contact: None,
        }
    }
}

/// An error coming from a [`Wait`] condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A wait handle for observing a Raft node's metrics until some condition is
/// satisfied.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or until the timeout elapses.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait condition satisfied: {}", msg);
                return Ok(latest);
            }

            let delay = timeout(self.timeout, rx.changed()).await;
            match delay {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => {
                    let latest = rx.borrow().clone();
                    tracing::debug!(latest=?latest, "wait timed out: {}", msg);
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
            }
        }
    }

    /// Wait for `last_log_index` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log,
            &format!("{} .last_log_index >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for `last_applied` to reach `want`.
    pub async fn applied(&self, want: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, &format!("{} .last_applied >= {}", msg, want)).await
    }

    /// Wait for the node's role to become `want_state`.
    pub async fn state(&self, want_state: State, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want_state, &format!("{} .state == {:?}", msg, want_state)).await
    }

    /// Wait for the node's known leader to become `leader_id`.
    pub async fn current_leader(&self, leader_id: ServerId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader.as_deref() == Some(leader_id.as_str()),
            &format!("{} .current_leader == {}", msg, leader_id),
        )
        .await
    }

    /// Wait for the node's snapshot to cover at least `want`.
    pub async fn snapshot(&self, want: LogId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.snapshot >= want, &format!("{} .snapshot >= {}", msg, want)).await
    }
}
