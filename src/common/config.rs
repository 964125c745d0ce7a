//! Configuration for dcfed servers

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{Error, Result};

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load `dcfed.toml` (optional) layered under `DCFED_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `DCFED_SERVER__DATACENTER=dc2`.
    pub fn load() -> Result<Self> {
        Self::load_from("dcfed")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("DCFED").separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.server.validate()?;
        Ok(config)
    }
}

/// Gossip pool configuration (one per scope, LAN and WAN)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipConfig {
    /// Address the pool binds to and that peers join
    pub bind_addr: String,

    /// Address advertised to other members, if different from the bind address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,

    /// Base64 encoded shared secret (16, 24 or 32 bytes once decoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl GossipConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            advertise_addr: None,
            secret_key: None,
        }
    }

    pub fn advertise(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.bind_addr)
    }

    /// Decoded secret key, `None` when encryption is disabled.
    pub fn secret(&self) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = self.secret_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        let key = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidConfig(format!("secret key is not base64: {}", e)))?;
        match key.len() {
            16 | 24 | 32 => Ok(Some(key)),
            n => Err(Error::InvalidConfig(format!(
                "secret key must be 16, 24 or 32 bytes, got {}",
                n
            ))),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Node name, unique within the datacenter
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Stable node identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Datacenter this server belongs to
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    /// Bootstrap a single-node cluster at start
    #[serde(default)]
    pub bootstrap: bool,

    /// Number of servers to wait for before forming the cluster (0 disables)
    #[serde(default)]
    pub bootstrap_expect: u32,

    /// LAN gossip pool
    #[serde(default = "default_lan")]
    pub lan: GossipConfig,

    /// WAN gossip pool
    #[serde(default = "default_wan")]
    pub wan: GossipConfig,

    /// Address of the RPC endpoint (also used as the consensus address)
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: String,

    /// Admin HTTP API, disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<SocketAddr>,

    /// Interval between full membership reconciliations
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Timeout applied to each forwarded or fanned-out RPC
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// How long `leave` waits to be removed from the configuration
    #[serde(default = "default_leave_drain")]
    pub leave_drain_ms: u64,
}

fn default_node_name() -> String {
    format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}
fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_datacenter() -> String {
    "dc1".to_string()
}
fn default_lan() -> GossipConfig {
    GossipConfig::new("127.0.0.1:8301")
}
fn default_wan() -> GossipConfig {
    GossipConfig::new("127.0.0.1:8302")
}
fn default_rpc_addr() -> String {
    "127.0.0.1:8300".to_string()
}
fn default_reconcile_interval() -> u64 {
    60_000
}
fn default_rpc_timeout() -> u64 {
    5_000
}
fn default_leave_drain() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            node_id: default_node_id(),
            datacenter: default_datacenter(),
            bootstrap: false,
            bootstrap_expect: 0,
            lan: default_lan(),
            wan: default_wan(),
            rpc_addr: default_rpc_addr(),
            http_addr: None,
            reconcile_interval_ms: default_reconcile_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
            leave_drain_ms: default_leave_drain(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::InvalidConfig("node_name must not be empty".into()));
        }
        if self.datacenter.is_empty() || self.datacenter.contains('.') {
            return Err(Error::InvalidConfig(format!(
                "invalid datacenter name: {:?}",
                self.datacenter
            )));
        }
        if self.bootstrap && self.bootstrap_expect > 0 {
            return Err(Error::InvalidConfig(
                "bootstrap cannot be combined with bootstrap_expect".into(),
            ));
        }
        if self.rpc_addr.is_empty() {
            return Err(Error::InvalidConfig("rpc_addr must not be empty".into()));
        }
        if self.reconcile_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconcile_interval_ms must be greater than zero".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "rpc_timeout_ms must be greater than zero".into(),
            ));
        }
        self.lan.secret()?;
        self.wan.secret()?;
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn leave_drain(&self) -> Duration {
        Duration::from_millis(self.leave_drain_ms)
    }

    /// Name this server carries in the WAN pool.
    pub fn wan_name(&self) -> String {
        format!("{}.{}", self.node_name, self.datacenter)
    }
}
