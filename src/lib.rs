//! # dcfed
//!
//! The control plane of a multi-datacenter coordination service:
//! - Bootstrap-expect cluster formation, exactly once
//! - Reconciliation of gossip membership into the Raft configuration
//! - Per-datacenter routing learned from WAN gossip, with failover
//! - RPC dispatch with leader forwarding and datacenter-wide fan-out
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            ┌──────────── WAN gossip ────────────┐
//!            │                                    │
//! ┌──────────▼──────────┐            ┌────────────▼────────┐
//! │  dc1                │            │  dc2                │
//! │  ┌──────┐ ┌──────┐  │    RPC     │  ┌──────┐ ┌──────┐  │
//! │  │ s1 * │ │ s2   │◄─┼────────────┼─►│ s4 * │ │ s5   │  │
//! │  └──────┘ └──────┘  │            │  └──────┘ └──────┘  │
//! │   LAN gossip + Raft │            │   LAN gossip + Raft │
//! └─────────────────────┘            └─────────────────────┘
//!                                         (* = raft leader)
//! ```
//!
//! ## Usage
//!
//! ### Simulate a federation in-process
//! ```bash
//! dcfed simulate --datacenters 2 --servers 3 --expect 3 --http 127.0.0.1:8500
//! ```
//!
//! ### Embed a server
//! ```no_run
//! # async fn run() -> dcfed::Result<()> {
//! use dcfed::{MemoryNetwork, Server, ServerConfig};
//!
//! let network = MemoryNetwork::new();
//! let config = ServerConfig { bootstrap: true, ..ServerConfig::default() };
//! let server = Server::start_in_memory(config, &network).await?;
//! assert_eq!(server.datacenters(), vec!["dc1"]);
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod consensus;
pub mod membership;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use common::{Config, Error, Result, ServerConfig};
pub use server::{MemoryNetwork, Server};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
