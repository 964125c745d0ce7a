//! Bootstrap-expect controller
//!
//! Turns a set of gossiping candidate servers into a single consensus group,
//! exactly once. Every membership event and tick funnels into
//! [`BootstrapExpect::maybe_bootstrap`]; the `Waiting -> Bootstrapped`
//! transition is a compare-and-set so other tasks can observe it lock-free.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::common::{Error, Result};
use crate::consensus::{Configuration, Consensus, ServerEntry};
use crate::membership::{Member, ServerMeta};
use crate::transport::{RpcRequest, RpcTransport};

/// Outcome of inspecting the current LAN view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// `bootstrap_expect` is zero
    Inert,
    /// Not enough candidates yet
    Wait { observed: usize },
    /// Enough candidates, but this node is not one of the seeds
    NotSeed,
    /// A peer disagrees on how the cluster forms
    Conflict(String),
    /// Seed the cluster with these servers
    Seed(Vec<ServerMeta>),
}

pub struct BootstrapExpect {
    node_id: String,
    datacenter: String,
    expect: u32,
    bootstrapped: AtomicBool,
    /// Zero-expect peers already warned about
    warned: Mutex<HashSet<String>>,
}

impl BootstrapExpect {
    pub fn new(node_id: impl Into<String>, datacenter: impl Into<String>, expect: u32) -> Self {
        Self {
            node_id: node_id.into(),
            datacenter: datacenter.into(),
            expect,
            bootstrapped: AtomicBool::new(false),
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn expect(&self) -> u32 {
        self.expect
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Returns `true` for the one caller that performed the transition.
    pub fn mark_bootstrapped(&self) -> bool {
        self.bootstrapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `true` the first time `name` is seen without an expect value.
    fn first_zero_expect(&self, name: &str) -> bool {
        self.warned.lock().unwrap().insert(name.to_string())
    }

    /// Decide, from the LAN view alone, whether this node should seed now.
    pub fn evaluate(&self, members: &[Member]) -> Evaluation {
        if self.expect == 0 {
            return Evaluation::Inert;
        }

        let mut candidates = Vec::new();
        let servers = members
            .iter()
            .filter(|m| m.status.is_alive())
            .filter_map(ServerMeta::from_member)
            .filter(|meta| meta.datacenter == self.datacenter);
        for meta in servers {
            if meta.bootstrap {
                return Evaluation::Conflict(format!(
                    "server {} is in bootstrap mode",
                    meta.name
                ));
            }
            match meta.expect {
                0 if self.first_zero_expect(&meta.name) => {
                    warn!(
                        server = %meta.name,
                        "server has no bootstrap_expect set, not counting it as a candidate"
                    );
                }
                0 => debug!(server = %meta.name, "skipping zero-expect server"),
                n if n != self.expect => {
                    return Evaluation::Conflict(format!(
                        "server {} expects {} servers, this node expects {}",
                        meta.name, n, self.expect
                    ));
                }
                _ => candidates.push(meta),
            }
        }

        let expect = self.expect as usize;
        if candidates.len() < expect {
            return Evaluation::Wait {
                observed: candidates.len(),
            };
        }

        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.truncate(expect);
        if !candidates.iter().any(|c| c.id == self.node_id) {
            return Evaluation::NotSeed;
        }
        Evaluation::Seed(candidates)
    }

    /// One bootstrap round. Returns `true` when this call seeded the cluster.
    pub async fn maybe_bootstrap(
        &self,
        members: &[Member],
        consensus: &dyn Consensus,
        transport: &dyn RpcTransport,
        rpc_timeout: Duration,
    ) -> Result<bool> {
        if self.expect == 0 || self.is_bootstrapped() {
            return Ok(false);
        }

        if !consensus.configuration()?.is_empty() {
            if self.mark_bootstrapped() {
                info!("existing raft configuration found, bootstrap-expect disabled");
            }
            return Ok(false);
        }

        let seed = match self.evaluate(members) {
            Evaluation::Seed(seed) => seed,
            Evaluation::Conflict(reason) => {
                error!(%reason, "bootstrap-expect aborted");
                return Ok(false);
            }
            Evaluation::Wait { observed } => {
                debug!(observed, expect = self.expect, "waiting for bootstrap candidates");
                return Ok(false);
            }
            Evaluation::NotSeed => {
                debug!("not in the bootstrap seed set, waiting to be added");
                return Ok(false);
            }
            Evaluation::Inert => return Ok(false),
        };

        for peer in seed.iter().filter(|m| m.id != self.node_id) {
            match self.peer_configuration(peer, transport, rpc_timeout).await {
                Ok(peers) if !peers.is_empty() => {
                    info!(
                        server = %peer.name,
                        peers = peers.len(),
                        "peer already has a raft configuration, bootstrap-expect disabled"
                    );
                    self.mark_bootstrapped();
                    return Ok(false);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        server = %peer.name,
                        error = %e,
                        "failed to query peer, retrying bootstrap later"
                    );
                    return Ok(false);
                }
            }
        }

        let configuration = Configuration::new(
            seed.iter()
                .map(|m| ServerEntry::voter(m.id.clone(), m.rpc_addr.clone()))
                .collect(),
        );
        match consensus.bootstrap_cluster(configuration).await {
            Ok(()) => {
                self.mark_bootstrapped();
                info!(
                    servers = ?seed.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
                    "raft cluster bootstrapped from expected servers"
                );
                Ok(true)
            }
            Err(Error::AlreadyBootstrapped) => {
                self.mark_bootstrapped();
                info!("raft cluster was bootstrapped concurrently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn peer_configuration(
        &self,
        peer: &ServerMeta,
        transport: &dyn RpcTransport,
        rpc_timeout: Duration,
    ) -> Result<Vec<String>> {
        let request = RpcRequest::new(self.datacenter.clone(), "Status.Peers", Value::Null);
        let reply = tokio::time::timeout(rpc_timeout, transport.call(&peer.rpc_addr, request))
            .await
            .map_err(|_| Error::Timeout(format!("Status.Peers to {}", peer.name)))??;
        Ok(serde_json::from_value(reply)?)
    }
}
