//! Gossip membership pools
//!
//! The gossip protocol itself is an external collaborator. This module defines
//! the surface the server drives ([`MembershipPool`]), the member/event types it
//! reacts to, and [`ServerMeta`], the typed view of the tags a server
//! advertises. An in-process implementation lives in [`memory`].

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::common::Result;

pub use memory::{GossipNetwork, MemoryPool};

pub const TAG_ROLE: &str = "role";
pub const TAG_DATACENTER: &str = "dc";
pub const TAG_ID: &str = "id";
pub const TAG_EXPECT: &str = "expect";
pub const TAG_BOOTSTRAP: &str = "bootstrap";
pub const TAG_RPC_ADDR: &str = "rpc_addr";
pub const TAG_WAN_JOIN: &str = "wan_join";

pub const ROLE_SERVER: &str = "server";

/// Gossip-observed liveness of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

impl MemberStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, MemberStatus::Alive)
    }
}

/// A node as seen through one gossip pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: String,
    pub tags: BTreeMap<String, String>,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberEventKind {
    Join,
    Leave,
    Failed,
}

/// Membership change delivered on a pool's event stream
#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub members: Vec<Member>,
}

/// Surface of one gossip pool (LAN or WAN scope)
#[async_trait]
pub trait MembershipPool: Send + Sync {
    /// Join the pools listening at `addrs`, returning how many were contacted.
    async fn join(&self, addrs: &[String]) -> Result<usize>;

    /// Leave gracefully; other members observe a `Leave` event.
    async fn leave(&self) -> Result<()>;

    /// Stop the pool. Without a prior leave, others observe a `Failed` event.
    async fn shutdown(&self) -> Result<()>;

    /// Every known member, including the local one.
    fn members(&self) -> Vec<Member>;

    fn local_member(&self) -> Member;

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent>;

    /// True when the pool's transport is configured with a shared secret.
    fn encrypted(&self) -> bool;
}

/// Server metadata parsed from a member's tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMeta {
    pub name: String,
    pub id: String,
    pub datacenter: String,
    pub rpc_addr: String,
    pub expect: u32,
    pub bootstrap: bool,
    pub wan_join_addr: Option<String>,
    pub status: MemberStatus,
}

impl ServerMeta {
    /// Parse a member's tags; `None` for non-servers or malformed tags.
    pub fn from_member(member: &Member) -> Option<Self> {
        if member.tags.get(TAG_ROLE).map(String::as_str) != Some(ROLE_SERVER) {
            return None;
        }
        let expect = match member.tags.get(TAG_EXPECT) {
            Some(raw) => raw.parse().ok()?,
            None => 0,
        };
        Some(Self {
            name: member.name.clone(),
            id: member.tags.get(TAG_ID)?.clone(),
            datacenter: member.tags.get(TAG_DATACENTER)?.clone(),
            rpc_addr: member.tags.get(TAG_RPC_ADDR)?.clone(),
            expect,
            bootstrap: member.tags.get(TAG_BOOTSTRAP).map(String::as_str) == Some("1"),
            wan_join_addr: member.tags.get(TAG_WAN_JOIN).cloned(),
            status: member.status,
        })
    }
}

/// Tags a server advertises in both pools.
pub fn server_tags(
    id: &str,
    datacenter: &str,
    rpc_addr: &str,
    expect: u32,
    bootstrap: bool,
    wan_join_addr: &str,
) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_ROLE.to_string(), ROLE_SERVER.to_string());
    tags.insert(TAG_ID.to_string(), id.to_string());
    tags.insert(TAG_DATACENTER.to_string(), datacenter.to_string());
    tags.insert(TAG_RPC_ADDR.to_string(), rpc_addr.to_string());
    tags.insert(TAG_WAN_JOIN.to_string(), wan_join_addr.to_string());
    if expect > 0 {
        tags.insert(TAG_EXPECT.to_string(), expect.to_string());
    }
    if bootstrap {
        tags.insert(TAG_BOOTSTRAP.to_string(), "1".to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(tags: BTreeMap<String, String>) -> Member {
        Member {
            name: "s1".to_string(),
            addr: "127.0.0.1:1".to_string(),
            tags,
            status: MemberStatus::Alive,
        }
    }

    #[test]
    fn test_server_meta_roundtrip_through_tags() {
        let tags = server_tags("id-1", "dc1", "127.0.0.1:8300", 3, false, "127.0.0.1:8302");
        let meta = ServerMeta::from_member(&member(tags)).unwrap();
        assert_eq!(meta.id, "id-1");
        assert_eq!(meta.datacenter, "dc1");
        assert_eq!(meta.expect, 3);
        assert!(!meta.bootstrap);
        assert_eq!(meta.wan_join_addr.as_deref(), Some("127.0.0.1:8302"));
    }

    #[test]
    fn test_non_server_and_malformed_tags() {
        assert!(ServerMeta::from_member(&member(BTreeMap::new())).is_none());

        let mut tags = server_tags("id-1", "dc1", "127.0.0.1:8300", 0, true, "x");
        tags.insert(TAG_EXPECT.to_string(), "three".to_string());
        assert!(ServerMeta::from_member(&member(tags)).is_none());

        let mut tags = server_tags("id-1", "dc1", "127.0.0.1:8300", 0, true, "x");
        tags.remove(TAG_RPC_ADDR);
        assert!(ServerMeta::from_member(&member(tags)).is_none());
    }
}
