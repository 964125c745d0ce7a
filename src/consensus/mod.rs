//! Consensus module surface
//!
//! Leader election and log replication are provided by an external consensus
//! implementation. The server only needs to seed it once, change its voter set,
//! observe leadership, and append opaque commands. [`memory`] provides an
//! in-process implementation with the same observable contract.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::common::Result;

pub use memory::{MemoryRaft, RaftNetwork, RaftRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

/// One member of a consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub address: String,
    pub suffrage: Suffrage,
}

impl ServerEntry {
    pub fn voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            suffrage: Suffrage::Voter,
        }
    }
}

/// Committed voter set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<ServerEntry>,
    /// Log index at which this configuration was committed
    pub index: u64,
}

impl Configuration {
    pub fn new(servers: Vec<ServerEntry>) -> Self {
        Self { servers, index: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &ServerEntry> {
        self.servers
            .iter()
            .filter(|s| s.suffrage == Suffrage::Voter)
    }

    pub fn num_voters(&self) -> usize {
        self.voters().count()
    }

    pub fn quorum(&self) -> usize {
        self.num_voters() / 2 + 1
    }
}

#[async_trait]
pub trait Consensus: Send + Sync {
    /// Seed the cluster. Fails with `AlreadyBootstrapped` when any configuration
    /// exists, leaving state untouched.
    async fn bootstrap_cluster(&self, configuration: Configuration) -> Result<()>;

    /// Add or update a voter; resolves once the change is committed.
    async fn add_voter(&self, id: &str, address: &str) -> Result<()>;

    /// Remove a server; resolves once the change is committed.
    async fn remove_voter(&self, id: &str) -> Result<()>;

    /// Append an opaque command; resolves with its log index once committed.
    async fn apply(&self, command: Vec<u8>) -> Result<u64>;

    /// Hand leadership to another voter and step down.
    async fn leadership_transfer(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    /// Latest committed configuration, empty before bootstrap.
    fn configuration(&self) -> Result<Configuration>;

    fn is_leader(&self) -> bool;

    /// Address of the current leader, if known.
    fn leader(&self) -> Option<String>;

    /// Leadership changes; `true` while this node leads.
    fn leadership(&self) -> watch::Receiver<bool>;

    fn term(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_counts_voters_only() {
        let mut config = Configuration::new(vec![
            ServerEntry::voter("a", "1"),
            ServerEntry::voter("b", "2"),
            ServerEntry::voter("c", "3"),
        ]);
        assert_eq!(config.quorum(), 2);
        config.servers.push(ServerEntry {
            id: "d".into(),
            address: "4".into(),
            suffrage: Suffrage::Nonvoter,
        });
        assert_eq!(config.num_voters(), 3);
        assert_eq!(config.quorum(), 2);
        assert!(config.contains("d"));
        assert!(!config.contains("e"));
    }
}
