//! In-process Raft stand-in
//!
//! Nodes register on a shared [`RaftNetwork`]. Everything a real cluster would
//! do through message passing happens synchronously under the network lock:
//! committed entries and configurations are installed on every reachable
//! member, and an election runs whenever quorum exists without a leader. The
//! winner is the live voter with the lowest id, and every election bumps the
//! term.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{Configuration, Consensus, ServerEntry};
use crate::common::{Error, Result};

/// Raft role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

/// Registry of consensus nodes, keyed by address
#[derive(Default)]
pub struct RaftNetwork {
    nodes: Mutex<HashMap<String, Arc<RaftShared>>>,
}

impl RaftNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

type Nodes = HashMap<String, Arc<RaftShared>>;

struct RaftShared {
    id: String,
    address: String,
    state: Mutex<RaftState>,
    leadership: watch::Sender<bool>,
}

struct RaftState {
    role: RaftRole,
    term: u64,
    leader: Option<String>,
    configuration: Configuration,
    log: Vec<LogEntry>,
    last_index: u64,
    shutdown: bool,
}

impl RaftState {
    fn become_leader(&mut self, address: &str, term: u64) {
        self.role = RaftRole::Leader;
        self.term = term;
        self.leader = Some(address.to_string());
    }

    fn step_down(&mut self, term: u64, leader: Option<String>) {
        self.role = RaftRole::Follower;
        self.term = term;
        self.leader = leader;
    }
}

impl RaftShared {
    fn notify(&self) {
        let leading = self.state.lock().unwrap().role == RaftRole::Leader;
        self.leadership.send_if_modified(|current| {
            if *current != leading {
                *current = leading;
                true
            } else {
                false
            }
        });
    }

    fn is_live(&self) -> bool {
        !self.state.lock().unwrap().shutdown
    }

    /// Install a committed configuration as a follower of `leader`.
    fn install(&self, configuration: &Configuration, leader: Option<(&str, u64)>) {
        {
            let mut state = self.state.lock().unwrap();
            state.configuration = configuration.clone();
            state.last_index = state.last_index.max(configuration.index);
            if !configuration.contains(&self.id) {
                let term = state.term;
                state.step_down(term, None);
            } else if let Some((address, term)) = leader {
                if address != self.address {
                    state.step_down(term, Some(address.to_string()));
                }
            }
        }
        self.notify();
    }
}

/// Live members of `configuration` that are registered under their address.
fn reachable(nodes: &Nodes, configuration: &Configuration) -> Vec<Arc<RaftShared>> {
    configuration
        .servers
        .iter()
        .filter_map(|entry| nodes.get(&entry.address))
        .filter(|node| node.is_live())
        .cloned()
        .collect()
}

/// Elect a leader among the live voters of `configuration`, never `exclude`.
fn elect(nodes: &Nodes, configuration: &Configuration, exclude: Option<&str>) -> Option<String> {
    let live = reachable(nodes, configuration);
    let live_voters: Vec<&Arc<RaftShared>> = live
        .iter()
        .filter(|n| configuration.voters().any(|v| v.id == n.id))
        .collect();
    let term = live
        .iter()
        .map(|n| n.state.lock().unwrap().term)
        .max()
        .unwrap_or(0)
        + 1;

    let winner = if live_voters.len() >= configuration.quorum() {
        live_voters
            .iter()
            .filter(|n| Some(n.id.as_str()) != exclude)
            .min_by(|a, b| a.id.cmp(&b.id))
            .map(|n| n.address.clone())
    } else {
        None
    };

    for node in &live {
        {
            let mut state = node.state.lock().unwrap();
            match &winner {
                Some(address) if *address == node.address => state.become_leader(address, term),
                Some(address) => state.step_down(term, Some(address.clone())),
                None => {
                    let current = state.term;
                    state.step_down(current, None);
                }
            }
        }
        node.notify();
    }

    match &winner {
        Some(address) => info!(leader = %address, term, "raft leader elected"),
        None => debug!("raft election without quorum"),
    }
    winner
}

/// Elect only if no live member currently leads.
fn settle(nodes: &Nodes, configuration: &Configuration) {
    let live = reachable(nodes, configuration);
    let voters = live
        .iter()
        .filter(|n| configuration.voters().any(|v| v.id == n.id))
        .count();
    let has_leader = live
        .iter()
        .any(|n| n.state.lock().unwrap().role == RaftRole::Leader);
    if voters < configuration.quorum() || !has_leader {
        elect(nodes, configuration, None);
    }
}

/// Consensus node backed by a [`RaftNetwork`]
pub struct MemoryRaft {
    shared: Arc<RaftShared>,
    network: Arc<RaftNetwork>,
}

impl MemoryRaft {
    pub fn new(
        network: &Arc<RaftNetwork>,
        id: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<Self> {
        let address = address.into();
        let (leadership, _) = watch::channel(false);
        let shared = Arc::new(RaftShared {
            id: id.into(),
            address: address.clone(),
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                term: 0,
                leader: None,
                configuration: Configuration::default(),
                log: Vec::new(),
                last_index: 0,
                shutdown: false,
            }),
            leadership,
        });

        let mut nodes = network.nodes.lock().unwrap();
        if nodes.contains_key(&address) {
            return Err(Error::Raft(format!("address in use: {}", address)));
        }
        nodes.insert(address, shared.clone());

        Ok(Self {
            shared,
            network: network.clone(),
        })
    }

    pub fn role(&self) -> RaftRole {
        self.shared.state.lock().unwrap().role
    }

    /// Committed command entries, in log order.
    pub fn log(&self) -> Vec<LogEntry> {
        self.shared.state.lock().unwrap().log.clone()
    }

    /// Leader-side precondition shared by every write.
    fn require_leader(&self) -> Result<(Configuration, u64, u64)> {
        let state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(Error::ConsensusShutdown);
        }
        if state.role != RaftRole::Leader {
            return Err(match &state.leader {
                Some(leader) => Error::NotLeader(leader.clone()),
                None => Error::NoLeader,
            });
        }
        Ok((state.configuration.clone(), state.term, state.last_index))
    }

    fn commit_configuration(&self, nodes: &Nodes, old: &Configuration, mut new: Configuration) {
        let (term, index) = {
            let state = self.shared.state.lock().unwrap();
            (state.term, state.last_index + 1)
        };
        new.index = index;

        let mut targets = reachable(nodes, old);
        for node in reachable(nodes, &new) {
            if !targets.iter().any(|t| Arc::ptr_eq(t, &node)) {
                targets.push(node);
            }
        }
        for node in &targets {
            node.install(&new, Some((&self.shared.address, term)));
        }
        debug!(index, servers = new.servers.len(), "raft configuration committed");

        if !new.contains(&self.shared.id) {
            info!(id = %self.shared.id, "leader removed from configuration, stepping down");
            elect(nodes, &new, Some(&self.shared.id));
        }
    }
}

#[async_trait]
impl Consensus for MemoryRaft {
    async fn bootstrap_cluster(&self, mut configuration: Configuration) -> Result<()> {
        let nodes = self.network.nodes.lock().unwrap();
        {
            let state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(Error::ConsensusShutdown);
            }
            if !state.configuration.is_empty() {
                return Err(Error::AlreadyBootstrapped);
            }
        }
        if !configuration.contains(&self.shared.id) {
            return Err(Error::Raft(
                "bootstrap configuration must include the local server".to_string(),
            ));
        }

        configuration.index = 1;
        for node in reachable(&nodes, &configuration) {
            let unconfigured = node.state.lock().unwrap().configuration.is_empty();
            let listed = configuration
                .get(&node.id)
                .is_some_and(|e| e.address == node.address);
            if listed && unconfigured {
                node.install(&configuration, None);
            }
        }
        info!(
            id = %self.shared.id,
            servers = configuration.servers.len(),
            "raft cluster bootstrapped"
        );
        settle(&nodes, &configuration);
        Ok(())
    }

    async fn add_voter(&self, id: &str, address: &str) -> Result<()> {
        let nodes = self.network.nodes.lock().unwrap();
        let (old, _, _) = self.require_leader()?;
        if let Some(existing) = old.get(id) {
            if *existing == ServerEntry::voter(id, address) {
                return Ok(());
            }
        }
        let mut new = old.clone();
        new.servers.retain(|s| s.id != id);
        new.servers.push(ServerEntry::voter(id, address));
        self.commit_configuration(&nodes, &old, new);
        Ok(())
    }

    async fn remove_voter(&self, id: &str) -> Result<()> {
        let nodes = self.network.nodes.lock().unwrap();
        let (old, _, _) = self.require_leader()?;
        if !old.contains(id) {
            return Ok(());
        }
        let mut new = old.clone();
        new.servers.retain(|s| s.id != id);
        self.commit_configuration(&nodes, &old, new);
        Ok(())
    }

    async fn apply(&self, command: Vec<u8>) -> Result<u64> {
        let nodes = self.network.nodes.lock().unwrap();
        let (configuration, term, last_index) = self.require_leader()?;
        let entry = LogEntry {
            term,
            index: last_index + 1,
            data: command,
        };
        for node in reachable(&nodes, &configuration) {
            let mut state = node.state.lock().unwrap();
            state.log.push(entry.clone());
            state.last_index = entry.index;
        }
        Ok(entry.index)
    }

    async fn leadership_transfer(&self) -> Result<()> {
        let nodes = self.network.nodes.lock().unwrap();
        let (configuration, _, _) = self.require_leader()?;
        let has_successor = reachable(&nodes, &configuration)
            .iter()
            .any(|n| n.id != self.shared.id && configuration.voters().any(|v| v.id == n.id));
        if !has_successor {
            return Err(Error::Raft(
                "no voter available for leadership transfer".to_string(),
            ));
        }
        info!(id = %self.shared.id, "transferring raft leadership");
        match elect(&nodes, &configuration, Some(&self.shared.id)) {
            Some(_) => Ok(()),
            None => Err(Error::NoLeader),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let mut nodes = self.network.nodes.lock().unwrap();
        let configuration = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
            let term = state.term;
            state.step_down(term, None);
            state.configuration.clone()
        };
        self.shared.notify();

        if nodes
            .get(&self.shared.address)
            .is_some_and(|n| Arc::ptr_eq(n, &self.shared))
        {
            nodes.remove(&self.shared.address);
        }
        if !configuration.is_empty() {
            settle(&nodes, &configuration);
        }
        debug!(id = %self.shared.id, "raft node shut down");
        Ok(())
    }

    fn configuration(&self) -> Result<Configuration> {
        let state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(Error::ConsensusShutdown);
        }
        Ok(state.configuration.clone())
    }

    fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    fn leader(&self) -> Option<String> {
        self.shared.state.lock().unwrap().leader.clone()
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.shared.leadership.subscribe()
    }

    fn term(&self) -> u64 {
        self.shared.state.lock().unwrap().term
    }
}
