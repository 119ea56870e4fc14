//! Best-effort observation of Raft internal events.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::core::State;
use crate::ServerId;

/// A single observed event from inside the engine.
///
/// Observations are advisory and best-effort: a receiver whose channel is
/// full misses the event rather than blocking the core.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    /// The node transitioned into the given role.
    State { id: ServerId, state: State },
    /// The node adopted a new term.
    Term { term: u64 },
    /// The node observed a (possibly new) cluster leader.
    Leader { leader: Option<ServerId> },
    /// The node handled a RequestVote RPC.
    RequestVote {
        candidate: ServerId,
        term: u64,
        granted: bool,
    },
    /// A replication peer stopped responding, or resumed responding.
    PeerLiveness { id: ServerId, alive: bool },
}

/// The registry of observer channels attached to a Raft node.
#[derive(Clone, Default)]
pub(crate) struct ObserverRegistry {
    next_id: Arc<AtomicU64>,
    channels: Arc<Mutex<HashMap<u64, mpsc::Sender<Observation>>>>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attach an observer channel, returning its registration id.
    pub(crate) fn register(&self, tx: mpsc::Sender<Observation>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels.lock().expect("observer registry poisoned").insert(id, tx);
        id
    }

    /// Detach a previously registered observer channel.
    pub(crate) fn deregister(&self, id: u64) {
        self.channels.lock().expect("observer registry poisoned").remove(&id);
    }

    /// Fan an observation out to every registered channel, dropping it for
    /// any receiver whose channel is full or closed.
    pub(crate) fn observe(&self, observation: Observation) {
        let channels = self.channels.lock().expect("observer registry poisoned");
        for tx in channels.values() {
            let _ = tx.try_send(observation.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_rather_than_blocks() {
        let registry = ObserverRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(tx);

        registry.observe(Observation::Term { term: 1 });
        registry.observe(Observation::Term { term: 2 });

        assert_eq!(rx.try_recv().unwrap(), Observation::Term { term: 1 });
        assert!(rx.try_recv().is_err(), "second observation should have been dropped");
    }

    #[test]
    fn test_deregister_stops_delivery() {
        let registry = ObserverRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = registry.register(tx);
        registry.deregister(id);
        registry.observe(Observation::Term { term: 1 });
        assert!(rx.try_recv().is_err());
    }
}
