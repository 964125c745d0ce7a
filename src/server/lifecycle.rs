//! Server composition root and lifecycle
//!
//! A [`Server`] owns the LAN and WAN pools, the consensus node, the router and
//! the RPC dispatcher, and runs three background loops:
//!
//! - LAN loop: bootstrap-expect, WAN flooding, forwarding member events to the
//!   reconciler while leader
//! - WAN loop: keeps the router in sync with WAN membership
//! - leadership loop: starts a reconciler per leadership term

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::common::utils::random_stagger;
use crate::common::{Error, Result, ServerConfig};
use crate::consensus::{Configuration, Consensus, MemoryRaft, RaftNetwork, ServerEntry};
use crate::membership::{
    server_tags, GossipNetwork, Member, MemberEvent, MembershipPool, MemoryPool,
};
use crate::server::bootstrap::BootstrapExpect;
use crate::server::flood::flood_join;
use crate::server::reconcile::{ReconcileQueue, Reconciler};
use crate::server::router::Router;
use crate::server::rpc::{ReplyMerger, RpcDispatcher};
use crate::transport::{
    MemoryTransport, RpcHandler, RpcListener, RpcNetwork, RpcRequest, RpcTransport,
};

/// Period of the LAN maintenance tick (bootstrap retries and flooding)
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Poll period while waiting to be removed from the configuration on leave
const LEAVE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Left,
    Shutdown,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::Left => write!(f, "left"),
            Lifecycle::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// External collaborators a server is built on
pub struct Collaborators {
    pub lan: Arc<dyn MembershipPool>,
    pub wan: Arc<dyn MembershipPool>,
    pub consensus: Arc<dyn Consensus>,
    pub transport: Arc<dyn RpcTransport>,
    pub listener: Arc<dyn RpcListener>,
}

/// Tags a server advertises in both gossip pools.
pub fn local_tags(config: &ServerConfig) -> BTreeMap<String, String> {
    server_tags(
        &config.node_id,
        &config.datacenter,
        &config.rpc_addr,
        config.bootstrap_expect,
        config.bootstrap,
        config.wan.advertise(),
    )
}

/// In-process networks shared by every server of a simulated federation
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    pub lan: Arc<GossipNetwork>,
    pub wan: Arc<GossipNetwork>,
    pub raft: Arc<RaftNetwork>,
    pub rpc: Arc<RpcNetwork>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pools, consensus node and transport for one server.
    pub async fn collaborators(&self, config: &ServerConfig) -> Result<Collaborators> {
        let tags = local_tags(config);
        let lan: Arc<dyn MembershipPool> = Arc::new(MemoryPool::create(
            &self.lan,
            &config.node_name,
            &config.lan.bind_addr,
            config.lan.advertise(),
            tags.clone(),
            config.lan.secret()?,
        )?);
        let wan = MemoryPool::create(
            &self.wan,
            config.wan_name(),
            &config.wan.bind_addr,
            config.wan.advertise(),
            tags,
            config.wan.secret()?,
        );
        let wan: Arc<dyn MembershipPool> = match wan {
            Ok(wan) => Arc::new(wan),
            Err(e) => {
                let _ = lan.shutdown().await;
                return Err(e);
            }
        };
        let consensus = match MemoryRaft::new(&self.raft, &config.node_id, &config.rpc_addr) {
            Ok(consensus) => consensus,
            Err(e) => {
                let _ = lan.shutdown().await;
                let _ = wan.shutdown().await;
                return Err(e);
            }
        };

        Ok(Collaborators {
            lan,
            wan,
            consensus: Arc::new(consensus),
            transport: Arc::new(MemoryTransport::new(self.rpc.clone())),
            listener: self.rpc.clone(),
        })
    }
}

pub struct Server {
    config: ServerConfig,
    lan: Arc<dyn MembershipPool>,
    wan: Arc<dyn MembershipPool>,
    consensus: Arc<dyn Consensus>,
    listener: Arc<dyn RpcListener>,
    router: Arc<Router>,
    bootstrap: Arc<BootstrapExpect>,
    dispatcher: Arc<RpcDispatcher>,
    leaving: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    token: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub async fn start_in_memory(
        config: ServerConfig,
        network: &MemoryNetwork,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let collaborators = network.collaborators(&config).await?;
        Self::start(config, collaborators).await
    }

    pub async fn start(config: ServerConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        let Collaborators {
            lan,
            wan,
            consensus,
            transport,
            listener,
        } = collaborators;

        info!(
            node = %config.node_name,
            datacenter = %config.datacenter,
            rpc = %config.rpc_addr,
            expect = config.bootstrap_expect,
            "starting server"
        );

        let router = Arc::new(Router::new(config.datacenter.clone()));
        let bootstrap = Arc::new(BootstrapExpect::new(
            config.node_id.clone(),
            config.datacenter.clone(),
            config.bootstrap_expect,
        ));
        let dispatcher = Arc::new(RpcDispatcher::new(
            config.datacenter.clone(),
            consensus.clone(),
            router.clone(),
            transport.clone(),
            config.rpc_timeout(),
        ));
        let handler: Arc<dyn RpcHandler> = dispatcher.clone();
        if let Err(e) = listener.listen(&config.rpc_addr, Arc::downgrade(&handler)) {
            release(&[&lan, &wan], consensus.as_ref()).await;
            return Err(e);
        }

        // subscribe before reading the current views so nothing falls between
        let lan_events = lan.subscribe();
        let wan_events = wan.subscribe();
        router.sync(&wan.members());

        if config.bootstrap {
            if let Err(e) = bootstrap_single(&config, consensus.as_ref()).await {
                listener.close(&config.rpc_addr);
                release(&[&lan, &wan], consensus.as_ref()).await;
                return Err(e);
            }
            bootstrap.mark_bootstrapped();
        }

        let token = CancellationToken::new();
        let leaving = Arc::new(AtomicBool::new(false));
        let (queue, queue_rx) = ReconcileQueue::channel();
        let span = info_span!("server", node = %config.node_name, datacenter = %config.datacenter);

        let lan_loop = LanLoop {
            datacenter: config.datacenter.clone(),
            rpc_timeout: config.rpc_timeout(),
            lan: lan.clone(),
            wan: wan.clone(),
            consensus: consensus.clone(),
            transport,
            bootstrap: bootstrap.clone(),
            queue,
            leaving: leaving.clone(),
        };
        let wan_loop = WanLoop {
            wan: wan.clone(),
            router: router.clone(),
        };
        let reconciler = Arc::new(Reconciler::new(
            config.node_id.clone(),
            config.datacenter.clone(),
            consensus.clone(),
            lan.clone(),
        ));
        let tasks = vec![
            tokio::spawn(
                lan_loop
                    .run(lan_events, token.clone())
                    .instrument(info_span!(parent: &span, "lan")),
            ),
            tokio::spawn(
                wan_loop
                    .run(wan_events, token.clone())
                    .instrument(info_span!(parent: &span, "wan")),
            ),
            tokio::spawn(
                leadership_loop(
                    consensus.clone(),
                    reconciler,
                    queue_rx,
                    config.reconcile_interval(),
                    token.clone(),
                )
                .instrument(info_span!(parent: &span, "leadership")),
            ),
        ];

        Ok(Arc::new(Self {
            config,
            lan,
            wan,
            consensus,
            listener,
            router,
            bootstrap,
            dispatcher,
            leaving,
            lifecycle: Mutex::new(Lifecycle::Running),
            token,
            tasks: StdMutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn datacenter(&self) -> &str {
        &self.config.datacenter
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().await
    }

    pub async fn join_lan(&self, addrs: &[String]) -> Result<usize> {
        self.lan.join(addrs).await
    }

    pub async fn join_wan(&self, addrs: &[String]) -> Result<usize> {
        self.wan.join(addrs).await
    }

    pub fn lan_members(&self) -> Vec<Member> {
        self.lan.members()
    }

    pub fn wan_members(&self) -> Vec<Member> {
        self.wan.members()
    }

    /// Number of voters in the committed configuration.
    pub fn num_peers(&self) -> Result<usize> {
        Ok(self.consensus.configuration()?.num_voters())
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.consensus.leader()
    }

    pub fn term(&self) -> u64 {
        self.consensus.term()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrap.is_bootstrapped()
            || self
                .consensus
                .configuration()
                .is_ok_and(|c| !c.is_empty())
    }

    /// True only when both gossip pools carry a secret key.
    pub fn encrypted(&self) -> bool {
        self.lan.encrypted() && self.wan.encrypted()
    }

    /// Known datacenters, the local one included.
    pub fn datacenters(&self) -> Vec<String> {
        self.router.datacenters()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Call `method` in the local datacenter.
    pub async fn rpc(&self, method: &str, args: Value) -> Result<Value> {
        let request = RpcRequest::new(self.config.datacenter.clone(), method, args);
        self.dispatcher.dispatch(request).await
    }

    /// Call `method` on a server of `datacenter`.
    pub async fn forward_dc(&self, datacenter: &str, method: &str, args: Value) -> Result<Value> {
        self.dispatcher
            .dispatch(RpcRequest::new(datacenter, method, args))
            .await
    }

    /// Call `method` in every known datacenter and merge the replies.
    pub async fn global_rpc<M: ReplyMerger>(
        &self,
        method: &str,
        args: Value,
        merger: &mut M,
    ) -> Result<()> {
        self.dispatcher.dispatch_global(method, args, merger).await
    }

    /// Leave both pools gracefully and wait to be removed from the raft
    /// configuration.
    pub async fn leave(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Running {
            return Err(Error::InvalidState(format!("cannot leave, server is {}", lifecycle)));
        }
        info!(node = %self.config.node_name, "server leaving");
        self.leaving.store(true, Ordering::Release);

        if self.consensus.is_leader() {
            if let Err(e) = self.consensus.leadership_transfer().await {
                warn!(error = %e, "leadership transfer before leave failed");
            }
        }

        if let Err(e) = self.wan.leave().await {
            warn!(error = %e, "failed to leave WAN pool");
        }
        if let Err(e) = self.lan.leave().await {
            warn!(error = %e, "failed to leave LAN pool");
        }

        let deadline = Instant::now() + self.config.leave_drain();
        loop {
            match self.consensus.configuration() {
                Ok(c) if c.contains(&self.config.node_id) && c.num_voters() > 1 => {}
                _ => break,
            }
            if Instant::now() >= deadline {
                warn!("still in the raft configuration after leave drain");
                break;
            }
            tokio::time::sleep(LEAVE_POLL).await;
        }

        *lifecycle = Lifecycle::Left;
        info!(node = %self.config.node_name, "server left");
        Ok(())
    }

    /// Stop every loop and collaborator. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Shutdown {
            return Ok(());
        }
        info!(node = %self.config.node_name, "shutting down server");

        self.token.cancel();
        self.listener.close(&self.config.rpc_addr);
        // loops and the current reconciler finish before collaborators go away
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "server task ended abnormally");
            }
        }

        if let Err(e) = self.consensus.shutdown().await {
            warn!(error = %e, "consensus shutdown failed");
        }
        if let Err(e) = self.wan.shutdown().await {
            warn!(error = %e, "WAN pool shutdown failed");
        }
        if let Err(e) = self.lan.shutdown().await {
            warn!(error = %e, "LAN pool shutdown failed");
        }

        *lifecycle = Lifecycle::Shutdown;
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Tear down collaborators of a server that failed to start.
async fn release(pools: &[&Arc<dyn MembershipPool>], consensus: &dyn Consensus) {
    for pool in pools {
        let _ = pool.shutdown().await;
    }
    let _ = consensus.shutdown().await;
}

async fn bootstrap_single(config: &ServerConfig, consensus: &dyn Consensus) -> Result<()> {
    if !consensus.configuration()?.is_empty() {
        return Ok(());
    }
    let configuration = Configuration::new(vec![ServerEntry::voter(
        config.node_id.clone(),
        config.rpc_addr.clone(),
    )]);
    match consensus.bootstrap_cluster(configuration).await {
        Ok(()) => {
            info!(node = %config.node_name, "bootstrapped single-node cluster");
            Ok(())
        }
        Err(Error::AlreadyBootstrapped) => Ok(()),
        Err(e) => Err(e),
    }
}

struct LanLoop {
    datacenter: String,
    rpc_timeout: Duration,
    lan: Arc<dyn MembershipPool>,
    wan: Arc<dyn MembershipPool>,
    consensus: Arc<dyn Consensus>,
    transport: Arc<dyn RpcTransport>,
    bootstrap: Arc<BootstrapExpect>,
    queue: ReconcileQueue,
    leaving: Arc<AtomicBool>,
}

impl LanLoop {
    async fn run(self, mut events: broadcast::Receiver<MemberEvent>, token: CancellationToken) {
        let start = Instant::now() + random_stagger(MAINTENANCE_INTERVAL);
        let mut ticker = interval_at(start, MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.maintain().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(kind = ?event.kind, members = event.members.len(), "LAN event");
                        self.forward(event.members);
                        self.maintain().await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "LAN event stream lagged, resyncing");
                        self.forward(self.lan.members());
                        self.maintain().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.maintain().await,
            }
        }
        debug!("LAN loop stopped");
    }

    fn forward(&self, members: Vec<Member>) {
        if !self.consensus.is_leader() {
            return;
        }
        for member in members {
            self.queue.push(member);
        }
    }

    async fn maintain(&self) {
        if self.leaving.load(Ordering::Acquire) {
            return;
        }
        let members = self.lan.members();
        if !self.bootstrap.is_bootstrapped() {
            if let Err(e) = self
                .bootstrap
                .maybe_bootstrap(
                    &members,
                    self.consensus.as_ref(),
                    self.transport.as_ref(),
                    self.rpc_timeout,
                )
                .await
            {
                warn!(error = %e, "bootstrap-expect round failed");
            }
        }
        flood_join(&self.datacenter, &members, self.wan.as_ref()).await;
    }
}

struct WanLoop {
    wan: Arc<dyn MembershipPool>,
    router: Arc<Router>,
}

impl WanLoop {
    async fn run(self, mut events: broadcast::Receiver<MemberEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.router.on_wan_event(event.kind, &event.members),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "WAN event stream lagged, resyncing router");
                        self.router.sync(&self.wan.members());
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("WAN loop stopped");
    }
}

async fn end_term((token, task): (CancellationToken, JoinHandle<()>)) {
    token.cancel();
    if let Err(e) = task.await {
        warn!(error = %e, "reconciler task failed");
    }
}

/// Start a reconciler for every leadership term and cancel it when the term
/// ends.
async fn leadership_loop(
    consensus: Arc<dyn Consensus>,
    reconciler: Arc<Reconciler>,
    queue: Arc<Mutex<mpsc::Receiver<Member>>>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut leadership = consensus.leadership();
    let mut term: Option<(CancellationToken, JoinHandle<()>)> = None;

    loop {
        let leading = *leadership.borrow_and_update();
        match (leading, term.take()) {
            (true, None) => {
                info!(term = consensus.term(), "acquired leadership");
                let child = token.child_token();
                let task = tokio::spawn(
                    reconciler
                        .clone()
                        .run(child.clone(), queue.clone(), interval)
                        .in_current_span(),
                );
                term = Some((child, task));
            }
            (false, Some(current)) => {
                info!("lost leadership");
                end_term(current).await;
            }
            (_, current) => term = current,
        }

        tokio::select! {
            _ = token.cancelled() => break,
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(current) = term {
        end_term(current).await;
    }
    debug!("leadership loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        pool: Arc<MemoryPool>,
        raft: Arc<MemoryRaft>,
        queue: ReconcileQueue,
        pending: Arc<Mutex<mpsc::Receiver<Member>>>,
        token: CancellationToken,
        task: JoinHandle<()>,
    }

    fn node(gossip: &Arc<GossipNetwork>, rafts: &Arc<RaftNetwork>, name: &str) -> Node {
        let id = format!("id-{}", name);
        let rpc = format!("{}-rpc", name);
        let lan = format!("{}-lan", name);
        let tags = server_tags(&id, "dc1", &rpc, 0, false, "wan");
        let pool = MemoryPool::create(gossip, name, lan.clone(), lan, tags, None).unwrap();
        let pool = Arc::new(pool);
        let raft = Arc::new(MemoryRaft::new(rafts, id.clone(), rpc).unwrap());

        let (queue, pending) = ReconcileQueue::channel();
        let reconciler = Arc::new(Reconciler::new(id, "dc1", raft.clone(), pool.clone()));
        let token = CancellationToken::new();
        let task = tokio::spawn(leadership_loop(
            raft.clone(),
            reconciler,
            pending.clone(),
            Duration::from_secs(60),
            token.clone(),
        ));
        Node {
            pool,
            raft,
            queue,
            pending,
            token,
            task,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// A running reconciler holds the queue receiver for its whole term.
    fn reconciling(n: &Node) -> bool {
        n.pending.try_lock().is_err()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reconciler_follows_leadership() {
        let gossip = GossipNetwork::new();
        let rafts = RaftNetwork::new();
        let a = node(&gossip, &rafts, "a");
        let b = node(&gossip, &rafts, "b");
        b.pool.join(&["a-lan".to_string()]).await.unwrap();

        a.raft
            .bootstrap_cluster(Configuration::new(vec![
                ServerEntry::voter("id-a", "a-rpc"),
                ServerEntry::voter("id-b", "b-rpc"),
            ]))
            .await
            .unwrap();
        assert!(eventually(|| a.raft.is_leader() && reconciling(&a)).await);
        assert!(!reconciling(&b));

        a.raft.leadership_transfer().await.unwrap();
        assert!(eventually(|| b.raft.is_leader() && reconciling(&b)).await);
        assert!(eventually(|| !reconciling(&a)).await);

        // a third server shows up; the old leader no longer acts on events
        let c = MemoryPool::create(
            &gossip,
            "c",
            "c-lan",
            "c-lan",
            server_tags("id-c", "dc1", "c-rpc", 0, false, "wan"),
            None,
        )
        .unwrap();
        c.join(&["a-lan".to_string()]).await.unwrap();
        a.queue.push(c.local_member());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!a.raft.configuration().unwrap().contains("id-c"));
        let unconsumed = a.pending.lock().await.try_recv();
        assert_eq!(unconsumed.map(|m| m.name).ok().as_deref(), Some("c"));

        // the new leader's reconciler performs the change
        b.queue.push(c.local_member());
        assert!(eventually(|| b.raft.configuration().unwrap().contains("id-c")).await);
        assert_eq!(b.raft.configuration().unwrap().num_voters(), 3);

        for Node {
            pending,
            token,
            task,
            ..
        } in [a, b]
        {
            token.cancel();
            task.await.unwrap();
            assert!(pending.try_lock().is_ok());
        }
    }
}
