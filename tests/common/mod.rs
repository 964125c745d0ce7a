//! Shared helpers for integration tests

#![allow(dead_code)]

use dcfed::common::GossipConfig;
use dcfed::{MemoryNetwork, Server, ServerConfig};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

static NEXT_PORT: AtomicU16 = AtomicU16::new(20_000);

/// Config with unique addresses and intervals short enough for tests.
pub fn test_config(name: &str, datacenter: &str) -> ServerConfig {
    let port = NEXT_PORT.fetch_add(3, Ordering::SeqCst);
    ServerConfig {
        node_name: name.to_string(),
        datacenter: datacenter.to_string(),
        lan: GossipConfig::new(format!("127.0.0.1:{}", port)),
        wan: GossipConfig::new(format!("127.0.0.1:{}", port + 1)),
        rpc_addr: format!("127.0.0.1:{}", port + 2),
        reconcile_interval_ms: 500,
        rpc_timeout_ms: 1_000,
        leave_drain_ms: 3_000,
        ..ServerConfig::default()
    }
}

pub fn expect_config(name: &str, datacenter: &str, expect: u32) -> ServerConfig {
    ServerConfig {
        bootstrap_expect: expect,
        ..test_config(name, datacenter)
    }
}

pub fn bootstrap_config(name: &str, datacenter: &str) -> ServerConfig {
    ServerConfig {
        bootstrap: true,
        ..test_config(name, datacenter)
    }
}

pub async fn start(network: &MemoryNetwork, config: ServerConfig) -> Arc<Server> {
    Server::start_in_memory(config, network)
        .await
        .expect("server should start")
}

pub async fn join_lan(server: &Server, to: &Server) {
    let addr = vec![to.config().lan.bind_addr.clone()];
    server.join_lan(&addr).await.expect("LAN join");
}

pub async fn join_wan(server: &Server, to: &Server) {
    let addr = vec![to.config().wan.bind_addr.clone()];
    server.join_wan(&addr).await.expect("WAN join");
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn peers(server: &Server) -> usize {
    server.num_peers().unwrap_or(0)
}

pub fn leaders(servers: &[Arc<Server>]) -> Vec<Arc<Server>> {
    servers.iter().filter(|s| s.is_leader()).cloned().collect()
}

pub async fn shutdown_all(servers: &[Arc<Server>]) {
    for server in servers {
        server.shutdown().await.expect("shutdown");
    }
}
