//! In-process gossip pools for tests and simulations
//!
//! Pools register on a shared [`GossipNetwork`] under their bind address and
//! can be joined through either their bind or advertise address.
//! Dissemination is instantaneous: a join merges both connected components and
//! every pool in the result learns the members it was missing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{Member, MemberEvent, MemberEventKind, MemberStatus, MembershipPool};
use crate::common::{Error, Result};

const EVENT_BUFFER: usize = 256;

/// Registry of pools reachable from each other
#[derive(Default)]
pub struct GossipNetwork {
    pools: Mutex<HashMap<String, Arc<PoolShared>>>,
}

impl GossipNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of pools currently listening
    pub fn len(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PoolShared {
    bind_addr: String,
    local: Member,
    secret: Option<Vec<u8>>,
    state: Mutex<PoolState>,
    events: broadcast::Sender<MemberEvent>,
}

struct PoolState {
    members: BTreeMap<String, Member>,
    left: bool,
    shutdown: bool,
}

impl PoolShared {
    fn snapshot(&self) -> BTreeMap<String, Member> {
        self.state.lock().unwrap().members.clone()
    }

    fn learn(&self, members: &BTreeMap<String, Member>) {
        let mut fresh = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (name, member) in members {
                if !state.members.contains_key(name) {
                    state.members.insert(name.clone(), member.clone());
                    fresh.push(member.clone());
                }
            }
        }
        if !fresh.is_empty() {
            let _ = self.events.send(MemberEvent {
                kind: MemberEventKind::Join,
                members: fresh,
            });
        }
    }

    fn forget(&self, name: &str, kind: MemberEventKind, status: MemberStatus) {
        let removed = self.state.lock().unwrap().members.remove(name);
        if let Some(mut member) = removed {
            member.status = status;
            let _ = self.events.send(MemberEvent {
                kind,
                members: vec![member],
            });
        }
    }
}

/// One gossip pool attached to a [`GossipNetwork`]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
    network: Arc<GossipNetwork>,
}

impl MemoryPool {
    pub fn create(
        network: &Arc<GossipNetwork>,
        name: impl Into<String>,
        bind_addr: impl Into<String>,
        advertise_addr: impl Into<String>,
        tags: BTreeMap<String, String>,
        secret: Option<Vec<u8>>,
    ) -> Result<Self> {
        let bind_addr = bind_addr.into();
        let local = Member {
            name: name.into(),
            addr: advertise_addr.into(),
            tags,
            status: MemberStatus::Alive,
        };
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut members = BTreeMap::new();
        members.insert(local.name.clone(), local.clone());
        let shared = Arc::new(PoolShared {
            bind_addr: bind_addr.clone(),
            local,
            secret,
            state: Mutex::new(PoolState {
                members,
                left: false,
                shutdown: false,
            }),
            events,
        });

        let mut pools = network.pools.lock().unwrap();
        if pools.contains_key(&bind_addr) {
            return Err(Error::Internal(format!("gossip address in use: {}", bind_addr)));
        }
        pools.insert(bind_addr.clone(), shared.clone());
        debug!(name = %shared.local.name, addr = %bind_addr, "gossip pool listening");

        Ok(Self {
            shared,
            network: network.clone(),
        })
    }

    /// Pools currently in the same connected component, excluding this one.
    fn peers(&self, pools: &HashMap<String, Arc<PoolShared>>) -> Vec<Arc<PoolShared>> {
        let known = self.shared.snapshot();
        pools
            .values()
            .filter(|p| !Arc::ptr_eq(p, &self.shared) && known.contains_key(&p.local.name))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MembershipPool for MemoryPool {
    async fn join(&self, addrs: &[String]) -> Result<usize> {
        {
            let state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(Error::PoolShutdown);
            }
            if state.left {
                return Err(Error::JoinFailed("pool has left".to_string()));
            }
        }

        let pools = self.network.pools.lock().unwrap();
        let mut joined = 0;
        let mut errors = Vec::new();
        for addr in addrs {
            let target = pools
                .get(addr)
                .or_else(|| pools.values().find(|p| p.local.addr == *addr))
                .cloned();
            let Some(target) = target else {
                errors.push(format!("{}: connection refused", addr));
                continue;
            };
            if target.secret != self.shared.secret {
                errors.push(Error::EncryptionMismatch(addr.clone()).to_string());
                continue;
            }

            let mut union = self.shared.snapshot();
            for (name, member) in target.snapshot() {
                union.entry(name).or_insert(member);
            }
            for pool in pools.values().filter(|p| union.contains_key(&p.local.name)) {
                pool.learn(&union);
            }
            joined += 1;
        }

        if joined == 0 && !errors.is_empty() {
            return Err(Error::JoinFailed(errors.join("; ")));
        }
        info!(name = %self.shared.local.name, joined, "gossip join");
        Ok(joined)
    }

    async fn leave(&self) -> Result<()> {
        let mut pools = self.network.pools.lock().unwrap();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(Error::PoolShutdown);
            }
            if state.left {
                return Ok(());
            }
            state.left = true;
        }

        let name = &self.shared.local.name;
        for peer in self.peers(&pools) {
            peer.forget(name, MemberEventKind::Leave, MemberStatus::Left);
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            let mut local = self.shared.local.clone();
            local.status = MemberStatus::Left;
            state.members.clear();
            state.members.insert(name.clone(), local);
        }
        if pools
            .get(&self.shared.bind_addr)
            .is_some_and(|p| Arc::ptr_eq(p, &self.shared))
        {
            pools.remove(&self.shared.bind_addr);
        }
        info!(name = %name, "left gossip pool");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut pools = self.network.pools.lock().unwrap();
        let left = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
            state.left
        };

        if !left {
            let name = &self.shared.local.name;
            for peer in self.peers(&pools) {
                peer.forget(name, MemberEventKind::Failed, MemberStatus::Failed);
            }
        }
        if pools
            .get(&self.shared.bind_addr)
            .is_some_and(|p| Arc::ptr_eq(p, &self.shared))
        {
            pools.remove(&self.shared.bind_addr);
        }
        debug!(name = %self.shared.local.name, "gossip pool shut down");
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        self.shared.snapshot().into_values().collect()
    }

    fn local_member(&self) -> Member {
        self.shared.local.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.shared.events.subscribe()
    }

    fn encrypted(&self) -> bool {
        self.shared.secret.as_ref().is_some_and(|k| !k.is_empty())
    }
}
