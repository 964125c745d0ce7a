//! Leader-side reconciliation of gossip membership into the raft configuration
//!
//! Only the leader changes the configuration. A [`Reconciler`] task is spawned
//! for each leadership term and cancelled when the term ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::utils::random_stagger;
use crate::common::Result;
use crate::consensus::{Consensus, ServerEntry};
use crate::membership::{Member, MembershipPool, ServerMeta};

/// Capacity of the LAN loop to reconciler queue
pub const RECONCILE_QUEUE: usize = 256;

/// Sending half used by the LAN loop. Events are dropped when the queue is
/// full; the next full reconcile picks them up.
#[derive(Clone)]
pub struct ReconcileQueue {
    tx: mpsc::Sender<Member>,
}

impl ReconcileQueue {
    pub fn channel() -> (Self, Arc<Mutex<mpsc::Receiver<Member>>>) {
        let (tx, rx) = mpsc::channel(RECONCILE_QUEUE);
        (Self { tx }, Arc::new(Mutex::new(rx)))
    }

    pub fn push(&self, member: Member) {
        if let Err(e) = self.tx.try_send(member) {
            debug!(error = %e, "reconcile queue full, dropping member event");
        }
    }
}

pub struct Reconciler {
    node_id: String,
    datacenter: String,
    consensus: Arc<dyn Consensus>,
    lan: Arc<dyn MembershipPool>,
}

impl Reconciler {
    pub fn new(
        node_id: impl Into<String>,
        datacenter: impl Into<String>,
        consensus: Arc<dyn Consensus>,
        lan: Arc<dyn MembershipPool>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            datacenter: datacenter.into(),
            consensus,
            lan,
        }
    }

    /// Alive servers of the local datacenter in the current LAN view.
    fn live_servers(&self) -> Vec<ServerMeta> {
        self.lan
            .members()
            .iter()
            .filter(|m| m.status.is_alive())
            .filter_map(ServerMeta::from_member)
            .filter(|meta| meta.datacenter == self.datacenter)
            .collect()
    }

    /// Diff the whole LAN view against the configuration and apply every
    /// change, one at a time.
    pub async fn reconcile_all(&self) -> Result<()> {
        let configuration = self.consensus.configuration()?;
        let live = self.live_servers();

        for meta in &live {
            let wanted = ServerEntry::voter(meta.id.clone(), meta.rpc_addr.clone());
            if configuration.get(&meta.id) == Some(&wanted) {
                continue;
            }
            if !self.add(meta).await {
                return Ok(());
            }
        }

        for entry in &configuration.servers {
            if entry.id == self.node_id || live.iter().any(|m| m.id == entry.id) {
                continue;
            }
            if !self.remove(&entry.id, &entry.address).await {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Apply a single member event, re-checked against the current LAN view.
    pub async fn reconcile_member(&self, member: &Member) -> Result<()> {
        let Some(meta) = ServerMeta::from_member(member) else {
            return Ok(());
        };
        if meta.datacenter != self.datacenter {
            return Ok(());
        }

        let configuration = self.consensus.configuration()?;
        match self.live_servers().into_iter().find(|m| m.name == meta.name) {
            Some(current) => {
                let wanted = ServerEntry::voter(current.id.clone(), current.rpc_addr.clone());
                if configuration.get(&current.id) != Some(&wanted) {
                    self.add(&current).await;
                }
            }
            None => {
                if meta.id != self.node_id && configuration.contains(&meta.id) {
                    self.remove(&meta.id, &meta.rpc_addr).await;
                }
            }
        }
        Ok(())
    }

    /// Returns `false` when leadership was lost and the pass should stop.
    async fn add(&self, meta: &ServerMeta) -> bool {
        match self.consensus.add_voter(&meta.id, &meta.rpc_addr).await {
            Ok(()) => {
                info!(server = %meta.name, id = %meta.id, "added raft voter");
                true
            }
            Err(e) if e.is_config_race() => {
                debug!(server = %meta.name, error = %e, "lost leadership while adding voter");
                false
            }
            Err(e) => {
                warn!(server = %meta.name, error = %e, "failed to add raft voter");
                true
            }
        }
    }

    async fn remove(&self, id: &str, address: &str) -> bool {
        match self.consensus.remove_voter(id).await {
            Ok(()) => {
                info!(id, address, "removed raft server");
                true
            }
            Err(e) if e.is_config_race() => {
                debug!(id, error = %e, "lost leadership while removing server");
                false
            }
            Err(e) => {
                warn!(id, error = %e, "failed to remove raft server");
                true
            }
        }
    }

    /// Leader task for one term: full reconcile, then queued events and
    /// periodic full passes until `token` is cancelled.
    pub async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        queue: Arc<Mutex<mpsc::Receiver<Member>>>,
        interval: Duration,
    ) {
        let mut events = tokio::select! {
            _ = token.cancelled() => return,
            events = queue.lock() => events,
        };

        info!("reconciler started");
        if let Err(e) = self.reconcile_all().await {
            warn!(error = %e, "initial reconcile failed");
        }

        let start = Instant::now() + interval + random_stagger(interval);
        let mut ticker = interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(member) = events.recv() => {
                    if let Err(e) = self.reconcile_member(&member).await {
                        warn!(member = %member.name, error = %e, "reconcile failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_all().await {
                        warn!(error = %e, "periodic reconcile failed");
                    }
                }
            }
        }
        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{Configuration, MemoryRaft, RaftNetwork};
    use crate::membership::{server_tags, GossipNetwork, MemoryPool};

    struct Node {
        pool: Arc<MemoryPool>,
        raft: Arc<MemoryRaft>,
    }

    fn node(gossip: &Arc<GossipNetwork>, rafts: &Arc<RaftNetwork>, name: &str) -> Node {
        let rpc = format!("{}-rpc", name);
        let tags = server_tags(&format!("id-{}", name), "dc1", &rpc, 0, false, "wan");
        let lan = format!("{}-lan", name);
        let pool = MemoryPool::create(gossip, name, lan.clone(), lan, tags, None).unwrap();
        Node {
            pool: Arc::new(pool),
            raft: Arc::new(MemoryRaft::new(rafts, format!("id-{}", name), rpc).unwrap()),
        }
    }

    fn reconciler(n: &Node, name: &str) -> Reconciler {
        Reconciler::new(format!("id-{}", name), "dc1", n.raft.clone(), n.pool.clone())
    }

    #[tokio::test]
    async fn test_full_reconcile_adds_and_removes() {
        let gossip = GossipNetwork::new();
        let rafts = RaftNetwork::new();
        let a = node(&gossip, &rafts, "a");
        let b = node(&gossip, &rafts, "b");
        let c = node(&gossip, &rafts, "c");
        a.raft
            .bootstrap_cluster(Configuration::new(vec![ServerEntry::voter("id-a", "a-rpc")]))
            .await
            .unwrap();
        b.pool.join(&["a-lan".to_string()]).await.unwrap();
        c.pool.join(&["a-lan".to_string()]).await.unwrap();

        let r = reconciler(&a, "a");
        r.reconcile_all().await.unwrap();
        assert_eq!(a.raft.configuration().unwrap().num_voters(), 3);
        assert_eq!(c.raft.configuration().unwrap().num_voters(), 3);

        c.pool.leave().await.unwrap();
        r.reconcile_all().await.unwrap();
        let configuration = a.raft.configuration().unwrap();
        assert_eq!(configuration.num_voters(), 2);
        assert!(!configuration.contains("id-c"));
    }

    #[tokio::test]
    async fn test_stale_join_is_ignored() {
        let gossip = GossipNetwork::new();
        let rafts = RaftNetwork::new();
        let a = node(&gossip, &rafts, "a");
        let b = node(&gossip, &rafts, "b");
        a.raft
            .bootstrap_cluster(Configuration::new(vec![ServerEntry::voter("id-a", "a-rpc")]))
            .await
            .unwrap();
        b.pool.join(&["a-lan".to_string()]).await.unwrap();
        let joined = b.pool.local_member();
        b.pool.leave().await.unwrap();

        let r = reconciler(&a, "a");
        r.reconcile_member(&joined).await.unwrap();
        assert_eq!(a.raft.configuration().unwrap().num_voters(), 1);
    }

    #[tokio::test]
    async fn test_follower_changes_nothing() {
        let gossip = GossipNetwork::new();
        let rafts = RaftNetwork::new();
        let a = node(&gossip, &rafts, "a");
        let b = node(&gossip, &rafts, "b");
        let c = node(&gossip, &rafts, "c");
        a.raft
            .bootstrap_cluster(Configuration::new(vec![
                ServerEntry::voter("id-a", "a-rpc"),
                ServerEntry::voter("id-b", "b-rpc"),
            ]))
            .await
            .unwrap();
        b.pool.join(&["a-lan".to_string()]).await.unwrap();
        c.pool.join(&["a-lan".to_string()]).await.unwrap();

        reconciler(&b, "b").reconcile_all().await.unwrap();
        assert!(!a.raft.configuration().unwrap().contains("id-c"));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let gossip = GossipNetwork::new();
        let rafts = RaftNetwork::new();
        let a = node(&gossip, &rafts, "a");
        let b = node(&gossip, &rafts, "b");
        a.raft
            .bootstrap_cluster(Configuration::new(vec![ServerEntry::voter("id-a", "a-rpc")]))
            .await
            .unwrap();

        let (queue, rx) = ReconcileQueue::channel();
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::new(reconciler(&a, "a")).run(
            token.clone(),
            rx,
            Duration::from_secs(60),
        ));

        b.pool.join(&["a-lan".to_string()]).await.unwrap();
        queue.push(b.pool.local_member());
        for _ in 0..100 {
            if a.raft.configuration().unwrap().num_voters() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.raft.configuration().unwrap().num_voters(), 2);

        token.cancel();
        task.await.unwrap();
    }
}
