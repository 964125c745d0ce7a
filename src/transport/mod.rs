//! RPC transport seam
//!
//! Wire framing belongs to the transport collaborator. The dispatcher only sees
//! a method name, opaque JSON arguments, and an opaque result or error.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Weak;

use crate::common::Result;

pub use memory::{MemoryTransport, RpcNetwork};

/// Request envelope carried between servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Datacenter that must serve the request
    pub datacenter: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
    /// Set once a follower has handed the request to its leader
    #[serde(default)]
    pub forwarded: bool,
}

impl RpcRequest {
    pub fn new(datacenter: impl Into<String>, method: impl Into<String>, args: Value) -> Self {
        Self {
            datacenter: datacenter.into(),
            method: method.into(),
            args,
            forwarded: false,
        }
    }
}

/// Outbound side: deliver a request to the server listening at `addr`.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, addr: &str, request: RpcRequest) -> Result<Value>;
}

/// Inbound side: a server's request handler.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> Result<Value>;
}

/// Where a server's inbound handler is made reachable.
pub trait RpcListener: Send + Sync {
    fn listen(&self, addr: &str, handler: Weak<dyn RpcHandler>) -> Result<()>;

    fn close(&self, addr: &str);
}
