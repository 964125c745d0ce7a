//! RPC dispatch
//!
//! A call is served locally, forwarded to the local leader, forwarded to a
//! server of another datacenter, or (global calls) fanned out to every known
//! datacenter with the replies merged.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::{Error, Result};
use crate::consensus::Consensus;
use crate::server::endpoints::{self, Endpoint};
use crate::server::router::Router;
use crate::transport::{RpcHandler, RpcRequest, RpcTransport};

/// Accumulates the per-datacenter replies of a global call.
pub trait ReplyMerger: Send {
    type Reply: DeserializeOwned;

    fn add(&mut self, datacenter: &str, reply: Self::Reply);
}

/// Collects replies keyed by datacenter.
#[derive(Debug, Default)]
pub struct CollectReplies<T> {
    pub replies: Vec<(String, T)>,
}

impl<T: DeserializeOwned + Send> ReplyMerger for CollectReplies<T> {
    type Reply = T;

    fn add(&mut self, datacenter: &str, reply: T) {
        self.replies.push((datacenter.to_string(), reply));
    }
}

pub struct RpcDispatcher {
    datacenter: String,
    consensus: Arc<dyn Consensus>,
    router: Arc<Router>,
    transport: Arc<dyn RpcTransport>,
    rpc_timeout: Duration,
}

impl RpcDispatcher {
    pub fn new(
        datacenter: impl Into<String>,
        consensus: Arc<dyn Consensus>,
        router: Arc<Router>,
        transport: Arc<dyn RpcTransport>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            datacenter: datacenter.into(),
            consensus,
            router,
            transport,
            rpc_timeout,
        }
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub async fn dispatch(&self, request: RpcRequest) -> Result<Value> {
        let endpoint = Endpoint::parse(&request.method)
            .ok_or_else(|| Error::UnknownMethod(request.method.clone()))?;

        if !request.datacenter.is_empty() && request.datacenter != self.datacenter {
            return self.forward_dc(request).await;
        }
        if endpoint.requires_leader() && !self.consensus.is_leader() {
            return self.forward_leader(request).await;
        }
        endpoints::serve(endpoint, request.args, self.consensus.as_ref(), &self.router).await
    }

    /// Forward to a server of `request.datacenter`, failing over to the next
    /// known server on transport errors only.
    pub async fn forward_dc(&self, request: RpcRequest) -> Result<Value> {
        let datacenter = request.datacenter.clone();
        let targets = self.router.targets(&datacenter);
        if targets.is_empty() {
            return Err(Error::NoPathToDatacenter(datacenter));
        }

        let mut last_error = Error::NoPathToDatacenter(datacenter.clone());
        for addr in targets {
            match self.call(&addr, request.clone()).await {
                Ok(reply) => {
                    self.router.report_success(&datacenter, &addr);
                    return Ok(reply);
                }
                Err(e) if e.is_retryable() => {
                    debug!(datacenter = %datacenter, addr = %addr, error = %e, "rpc failed over");
                    self.router.report_failure(&datacenter, &addr);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn forward_leader(&self, mut request: RpcRequest) -> Result<Value> {
        if request.forwarded {
            return Err(Error::NoLeader);
        }
        let leader = self.consensus.leader().ok_or(Error::NoLeader)?;
        request.forwarded = true;
        match self.call(&leader, request).await {
            Err(e) if matches!(e, Error::ConnectionFailed(_) | Error::Timeout(_)) => {
                debug!(leader = %leader, error = %e, "leader unreachable");
                Err(Error::NoLeader)
            }
            other => other,
        }
    }

    async fn call(&self, addr: &str, request: RpcRequest) -> Result<Value> {
        let method = request.method.clone();
        tokio::time::timeout(self.rpc_timeout, self.transport.call(addr, request))
            .await
            .map_err(|_| Error::Timeout(format!("{} to {}", method, addr)))?
    }

    /// Deadline for one datacenter of a global call: room for every failover
    /// target to time out once, plus one more call.
    fn branch_budget(&self, datacenter: &str) -> Duration {
        let attempts = self.router.targets(datacenter).len() + 1;
        self.rpc_timeout.saturating_mul(attempts as u32)
    }

    /// Call `method` in every known datacenter concurrently. Successful replies
    /// are merged even when some datacenters fail.
    pub async fn dispatch_global<M: ReplyMerger>(
        &self,
        method: &str,
        args: Value,
        merger: &mut M,
    ) -> Result<()> {
        let mut datacenters = self.router.datacenters();
        if !datacenters.contains(&self.datacenter) {
            datacenters.push(self.datacenter.clone());
        }

        let branches = datacenters.into_iter().map(|datacenter| {
            let request = RpcRequest::new(datacenter.clone(), method, args.clone());
            let budget = self.branch_budget(&datacenter);
            async move {
                let result = tokio::time::timeout(budget, self.dispatch(request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout(format!("{} in {}", method, datacenter)))
                    });
                (datacenter, result)
            }
        });

        let mut failures = Vec::new();
        for (datacenter, result) in join_all(branches).await {
            match result.and_then(|value| Ok(serde_json::from_value::<M::Reply>(value)?)) {
                Ok(reply) => merger.add(&datacenter, reply),
                Err(e) => failures.push((datacenter, e.to_string())),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(method, failed = failures.len(), "global rpc partially failed");
            Err(Error::GlobalRpc {
                method: method.to_string(),
                failures,
            })
        }
    }
}

#[async_trait]
impl RpcHandler for RpcDispatcher {
    async fn handle(&self, request: RpcRequest) -> Result<Value> {
        self.dispatch(request).await
    }
}
