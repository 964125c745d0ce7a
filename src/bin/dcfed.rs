//! dcfed binary

use clap::{Parser, Subcommand};
use dcfed::common::{parse_duration, Config, GossipConfig};
use dcfed::server::{http, CollectReplies};
use dcfed::{MemoryNetwork, Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dcfed")]
#[command(about = "Multi-datacenter control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process federation and report how it converges
    Simulate {
        /// Number of datacenters
        #[arg(long, default_value = "2")]
        datacenters: usize,

        /// Servers per datacenter
        #[arg(long, default_value = "3")]
        servers: usize,

        /// bootstrap_expect of every server (0 bootstraps the first server of each datacenter)
        #[arg(long)]
        expect: Option<u32>,

        /// Serve the admin API of the first server on this address
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Keep running this long after convergence, e.g. "30s"
        #[arg(long)]
        hold: Option<String>,

        /// Give up waiting for convergence after this long
        #[arg(long, default_value = "30s")]
        timeout: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config from file and environment; CLI arguments take priority
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            datacenters,
            servers,
            expect,
            http: http_addr,
            hold,
            timeout,
        } => {
            anyhow::ensure!(datacenters > 0 && servers > 0, "need at least one server");
            let expect = expect.unwrap_or(servers as u32);
            let timeout = parse_duration(&timeout)?;
            let hold = hold.as_deref().map(parse_duration).transpose()?;

            let network = MemoryNetwork::new();
            let fleet = start_fleet(&network, &config.server, datacenters, servers, expect).await?;
            join_fleet(&fleet).await?;

            let converged = wait_converged(&fleet, datacenters, servers, timeout).await;
            report(&fleet);
            if !converged {
                tracing::warn!("federation did not converge within {:?}", timeout);
            }

            let first = fleet[0][0].clone();
            let mut merged = CollectReplies::<Vec<String>>::default();
            match first
                .global_rpc("Catalog.ListDatacenters", serde_json::Value::Null, &mut merged)
                .await
            {
                Ok(()) => tracing::info!("global Catalog.ListDatacenters: {:?}", merged.replies),
                Err(e) => tracing::warn!("global rpc: {}", e),
            }

            let token = CancellationToken::new();
            let admin = http_addr
                .map(|addr| tokio::spawn(http::serve(first.clone(), addr, token.clone())));

            match (hold, admin.is_some()) {
                (Some(hold), _) => tokio::time::sleep(hold).await,
                (None, true) => {
                    tracing::info!("press Ctrl-C to stop");
                    tokio::signal::ctrl_c().await?;
                }
                (None, false) => {}
            }

            token.cancel();
            if let Some(admin) = admin {
                admin.await??;
            }
            for server in fleet.iter().flatten() {
                server.shutdown().await?;
            }
            anyhow::ensure!(converged, "federation did not converge");
        }
    }

    Ok(())
}

fn server_config(template: &ServerConfig, dc: usize, index: usize, expect: u32) -> ServerConfig {
    let host = format!("10.{}.0.{}", dc, index);
    ServerConfig {
        node_name: format!("s{}", index),
        node_id: uuid::Uuid::new_v4().to_string(),
        datacenter: format!("dc{}", dc),
        bootstrap: expect == 0 && index == 1,
        bootstrap_expect: expect,
        lan: GossipConfig {
            bind_addr: format!("{}:8301", host),
            ..template.lan.clone()
        },
        wan: GossipConfig {
            bind_addr: format!("{}:8302", host),
            ..template.wan.clone()
        },
        rpc_addr: format!("{}:8300", host),
        ..template.clone()
    }
}

async fn start_fleet(
    network: &MemoryNetwork,
    template: &ServerConfig,
    datacenters: usize,
    servers: usize,
    expect: u32,
) -> dcfed::Result<Vec<Vec<Arc<Server>>>> {
    let mut fleet = Vec::with_capacity(datacenters);
    for dc in 1..=datacenters {
        let mut members = Vec::with_capacity(servers);
        for index in 1..=servers {
            let config = server_config(template, dc, index, expect);
            members.push(Server::start_in_memory(config, network).await?);
        }
        fleet.push(members);
    }
    Ok(fleet)
}

/// LAN-join every datacenter around its first server, then WAN-join the
/// first servers together.
async fn join_fleet(fleet: &[Vec<Arc<Server>>]) -> dcfed::Result<()> {
    for members in fleet {
        let seed = vec![members[0].config().lan.bind_addr.clone()];
        for server in &members[1..] {
            server.join_lan(&seed).await?;
        }
    }
    let seed = vec![fleet[0][0].config().wan.bind_addr.clone()];
    for members in &fleet[1..] {
        members[0].join_wan(&seed).await?;
    }
    Ok(())
}

async fn wait_converged(
    fleet: &[Vec<Arc<Server>>],
    datacenters: usize,
    servers: usize,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let converged = fleet.iter().all(|members| {
            members.iter().filter(|s| s.is_leader()).count() == 1
                && members.iter().all(|s| {
                    s.num_peers().ok() == Some(servers) && s.datacenters().len() == datacenters
                })
        });
        if converged {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn report(fleet: &[Vec<Arc<Server>>]) {
    for server in fleet.iter().flatten() {
        tracing::info!(
            "{}.{}: {} peers={} term={} datacenters={:?}",
            server.name(),
            server.datacenter(),
            if server.is_leader() { "leader" } else { "follower" },
            server
                .num_peers()
                .map(|n| n.to_string())
                .unwrap_or_else(|e| e.to_string()),
            server.term(),
            server.datacenters(),
        );
    }
}
