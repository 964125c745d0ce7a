//! Built-in RPC methods served by every server

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::common::{Error, Result};
use crate::consensus::Consensus;
use crate::server::router::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    StatusPing,
    StatusLeader,
    StatusPeers,
    CatalogListDatacenters,
    LogApply,
}

impl Endpoint {
    pub const ALL: [Endpoint; 5] = [
        Endpoint::StatusPing,
        Endpoint::StatusLeader,
        Endpoint::StatusPeers,
        Endpoint::CatalogListDatacenters,
        Endpoint::LogApply,
    ];

    pub fn parse(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == method)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::StatusPing => "Status.Ping",
            Endpoint::StatusLeader => "Status.Leader",
            Endpoint::StatusPeers => "Status.Peers",
            Endpoint::CatalogListDatacenters => "Catalog.ListDatacenters",
            Endpoint::LogApply => "Log.Apply",
        }
    }

    /// Methods that must run on the raft leader of the target datacenter.
    pub fn requires_leader(&self) -> bool {
        matches!(self, Endpoint::LogApply)
    }
}

/// Reply of `Log.Apply`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReply {
    pub index: u64,
}

pub async fn serve(
    endpoint: Endpoint,
    args: Value,
    consensus: &dyn Consensus,
    router: &Router,
) -> Result<Value> {
    match endpoint {
        Endpoint::StatusPing => Ok(json!({})),
        Endpoint::StatusLeader => Ok(json!(consensus.leader().unwrap_or_default())),
        Endpoint::StatusPeers => {
            let configuration = consensus.configuration()?;
            let peers: Vec<&str> = configuration.voters().map(|s| s.address.as_str()).collect();
            Ok(json!(peers))
        }
        Endpoint::CatalogListDatacenters => Ok(json!(router.datacenters())),
        Endpoint::LogApply => {
            if args.is_null() {
                return Err(Error::Codec("Log.Apply requires a command".into()));
            }
            let index = consensus.apply(serde_json::to_vec(&args)?).await?;
            Ok(serde_json::to_value(ApplyReply { index })?)
        }
    }
}
