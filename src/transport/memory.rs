//! In-process RPC transport
//!
//! Handlers are held weakly so a registered server is never kept alive by the
//! network it listens on.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

use super::{RpcHandler, RpcListener, RpcRequest, RpcTransport};
use crate::common::{Error, Result};

#[derive(Default)]
pub struct RpcNetwork {
    handlers: Mutex<HashMap<String, Weak<dyn RpcHandler>>>,
}

impl RpcNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: &str, handler: Weak<dyn RpcHandler>) -> Result<()> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers
            .get(addr)
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            return Err(Error::Internal(format!("rpc address in use: {}", addr)));
        }
        handlers.insert(addr.to_string(), handler);
        Ok(())
    }

    pub fn deregister(&self, addr: &str) {
        self.handlers.lock().unwrap().remove(addr);
    }

    fn lookup(&self, addr: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.lock().unwrap().get(addr).and_then(Weak::upgrade)
    }
}

impl RpcListener for RpcNetwork {
    fn listen(&self, addr: &str, handler: Weak<dyn RpcHandler>) -> Result<()> {
        self.register(addr, handler)
    }

    fn close(&self, addr: &str) {
        self.deregister(addr)
    }
}

/// Client side of an [`RpcNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<RpcNetwork>,
}

impl MemoryTransport {
    pub fn new(network: Arc<RpcNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl RpcTransport for MemoryTransport {
    async fn call(&self, addr: &str, request: RpcRequest) -> Result<Value> {
        let handler = self
            .network
            .lookup(addr)
            .ok_or_else(|| Error::ConnectionFailed(format!("no server listening at {}", addr)))?;
        trace!(addr, method = %request.method, "rpc call");
        handler.handle(request).await
    }
}
