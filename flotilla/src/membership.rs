//! Cluster membership configuration.

use serde::Deserialize;
use serde::Serialize;

use crate::error::MembershipError;
use crate::ServerAddress;
use crate::ServerId;

/// The voting rights of a single server within a membership configuration.
///
/// Only `Voter` entries count toward any quorum. `Staging` is a transient
/// pre-promotion state used while a future voter's log catches up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suffrage {
    Voter,
    Nonvoter,
    Staging,
}

/// A single member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub address: ServerAddress,
    pub suffrage: Suffrage,
}

impl Server {
    pub fn new(id: impl Into<ServerId>, address: impl Into<ServerAddress>, suffrage: Suffrage) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            suffrage,
        }
    }
}

/// The membership configuration of the cluster: an ordered list of servers
/// and their suffrage.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub servers: Vec<Server>,
}

/// A single-server change applied to a membership configuration.
///
/// Exactly one change is carried per configuration log entry, which is what
/// keeps overlapping quorums intact without joint consensus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigChange {
    AddVoter { id: ServerId, address: ServerAddress },
    AddStaging { id: ServerId, address: ServerAddress },
    AddNonvoter { id: ServerId, address: ServerAddress },
    DemoteVoter { id: ServerId },
    Promote { id: ServerId },
    RemoveServer { id: ServerId },
}

impl ConfigChange {
    /// The id of the server this change is about.
    pub fn server_id(&self) -> &ServerId {
        match self {
            ConfigChange::AddVoter { id, .. } => id,
            ConfigChange::AddStaging { id, .. } => id,
            ConfigChange::AddNonvoter { id, .. } => id,
            ConfigChange::DemoteVoter { id } => id,
            ConfigChange::Promote { id } => id,
            ConfigChange::RemoveServer { id } => id,
        }
    }
}

impl Membership {
    /// Create a membership holding the given servers.
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    /// Create a new initial config containing only the given server as a voter.
    pub fn new_initial(id: impl Into<ServerId>, address: impl Into<ServerAddress>) -> Self {
        Self {
            servers: vec![Server::new(id, address, Suffrage::Voter)],
        }
    }

    /// Look up a server by id.
    pub fn server(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Check if the given server id exists in this configuration.
    pub fn contains(&self, id: &str) -> bool {
        self.server(id).is_some()
    }

    /// Check if the given server id is a voter in this configuration.
    pub fn is_voter(&self, id: &str) -> bool {
        matches!(self.server(id), Some(s) if s.suffrage == Suffrage::Voter)
    }

    /// Iterate the voters of this configuration.
    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.suffrage == Suffrage::Voter)
    }

    /// The number of voters in this configuration.
    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// The first server currently held in `Staging` suffrage, if any.
    pub fn staging(&self) -> Option<&Server> {
        self.servers.iter().find(|s| s.suffrage == Suffrage::Staging)
    }

    /// Check that this configuration is sane: non-empty, at least one voter,
    /// no duplicate ids or addresses.
    pub fn validate(&self) -> Result<(), MembershipError> {
        if self.servers.is_empty() {
            return Err(MembershipError::Empty);
        }
        if self.voter_count() == 0 {
            return Err(MembershipError::NoVoter);
        }
        for (i, server) in self.servers.iter().enumerate() {
            if server.id.is_empty() {
                return Err(MembershipError::EmptyId);
            }
            if server.address.is_empty() {
                return Err(MembershipError::EmptyAddress);
            }
            for other in self.servers.iter().skip(i + 1) {
                if server.id == other.id {
                    return Err(MembershipError::DuplicateId(server.id.clone()));
                }
                if server.address == other.address {
                    return Err(MembershipError::DuplicateAddress(server.address.clone()));
                }
            }
        }
        Ok(())
    }

    /// Compute the configuration which results from applying `change` to this
    /// one. The result is validated before being returned.
    ///
    /// Adding a server which is already present with identical id, address
    /// and suffrage, or removing a server which is not present, yields a
    /// configuration with the same content; the caller still appends it as a
    /// new entry so the membership index advances.
    pub fn next(&self, change: &ConfigChange) -> Result<Membership, MembershipError> {
        let mut next = self.clone();
        match change {
            ConfigChange::AddVoter { id, address } => next.upsert(id, address, Suffrage::Voter),
            ConfigChange::AddStaging { id, address } => next.upsert(id, address, Suffrage::Staging),
            ConfigChange::AddNonvoter { id, address } => next.upsert(id, address, Suffrage::Nonvoter),
            ConfigChange::DemoteVoter { id } => {
                if let Some(server) = next.servers.iter_mut().find(|s| &s.id == id) {
                    server.suffrage = Suffrage::Nonvoter;
                }
            }
            ConfigChange::Promote { id } => {
                if let Some(server) = next.servers.iter_mut().find(|s| &s.id == id) {
                    server.suffrage = Suffrage::Voter;
                }
            }
            ConfigChange::RemoveServer { id } => {
                next.servers.retain(|s| &s.id != id);
            }
        }
        next.validate()?;
        Ok(next)
    }

    fn upsert(&mut self, id: &str, address: &str, suffrage: Suffrage) {
        match self.servers.iter_mut().find(|s| s.id == id) {
            Some(server) => {
                server.address = address.to_string();
                server.suffrage = suffrage;
            }
            None => self.servers.push(Server::new(id, address, suffrage)),
        }
    }
}

/// The committed and latest membership configurations tracked by a node,
/// each alongside the log index of the entry which carried it.
///
/// At most one uncommitted configuration may exist at a time; the tracked
/// pair is equal whenever the configuration is stable.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct MembershipState {
    pub committed: Membership,
    pub committed_index: u64,
    pub latest: Membership,
    pub latest_index: u64,
}

impl MembershipState {
    /// Record a new configuration entry observed at `index`.
    pub fn append(&mut self, index: u64, membership: Membership) {
        self.latest = membership;
        self.latest_index = index;
    }

    /// Mark every configuration at or below `commit_index` committed.
    pub fn commit(&mut self, commit_index: u64) {
        if self.latest_index > self.committed_index && self.latest_index <= commit_index {
            self.committed = self.latest.clone();
            self.committed_index = self.latest_index;
        }
    }

    /// Whether the latest configuration has been committed.
    pub fn is_stable(&self) -> bool {
        self.committed_index == self.latest_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Membership {
        Membership::new(vec![
            Server::new("n1", "addr1", Suffrage::Voter),
            Server::new("n2", "addr2", Suffrage::Voter),
            Server::new("n3", "addr3", Suffrage::Nonvoter),
        ])
    }

    #[test]
    fn test_voter_count_ignores_nonvoters() {
        assert_eq!(three().voter_count(), 2);
        assert!(three().is_voter("n1"));
        assert!(!three().is_voter("n3"));
    }

    #[test]
    fn test_next_add_voter_upserts() {
        let m = three().next(&ConfigChange::AddVoter { id: "n3".into(), address: "addr3".into() }).unwrap();
        assert!(m.is_voter("n3"));
        assert_eq!(m.servers.len(), 3);

        let m = three().next(&ConfigChange::AddVoter { id: "n4".into(), address: "addr4".into() }).unwrap();
        assert_eq!(m.servers.len(), 4);
        assert!(m.is_voter("n4"));
    }

    #[test]
    fn test_next_add_known_voter_is_noop_content() {
        let m = three().next(&ConfigChange::AddVoter { id: "n1".into(), address: "addr1".into() }).unwrap();
        assert_eq!(m, three());
    }

    #[test]
    fn test_next_remove_unknown_is_noop_content() {
        let m = three().next(&ConfigChange::RemoveServer { id: "n9".into() }).unwrap();
        assert_eq!(m, three());
    }

    #[test]
    fn test_next_cannot_remove_last_voter() {
        let single = Membership::new_initial("n1", "addr1");
        let res = single.next(&ConfigChange::RemoveServer { id: "n1".into() });
        assert_eq!(res.unwrap_err(), MembershipError::Empty);

        let res = three()
            .next(&ConfigChange::DemoteVoter { id: "n1".into() })
            .unwrap()
            .next(&ConfigChange::DemoteVoter { id: "n2".into() });
        assert_eq!(res.unwrap_err(), MembershipError::NoVoter);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let m = Membership::new(vec![
            Server::new("n1", "addr1", Suffrage::Voter),
            Server::new("n1", "addr2", Suffrage::Voter),
        ]);
        assert_eq!(m.validate().unwrap_err(), MembershipError::DuplicateId("n1".into()));

        let m = Membership::new(vec![
            Server::new("n1", "addr1", Suffrage::Voter),
            Server::new("n2", "addr1", Suffrage::Voter),
        ]);
        assert_eq!(m.validate().unwrap_err(), MembershipError::DuplicateAddress("addr1".into()));
    }

    #[test]
    fn test_membership_state_commit() {
        let mut state = MembershipState::default();
        state.append(5, three());
        assert!(!state.is_stable());
        state.commit(4);
        assert!(!state.is_stable());
        state.commit(5);
        assert!(state.is_stable());
        assert_eq!(state.committed_index, 5);
        assert_eq!(state.committed, three());
    }
}
