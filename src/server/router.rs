//! Cross-datacenter routing table
//!
//! The table maps each datacenter to an ordered list of its servers, learned
//! from WAN gossip. Readers take a lock-free snapshot; writers clone the
//! current table, edit the copy and swap it in while holding the writer lock,
//! so a reader never observes a half-applied change.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::membership::{Member, MemberEventKind, ServerMeta};

/// A server reachable for calls into its datacenter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerRoute {
    pub name: String,
    pub id: String,
    pub addr: String,
}

impl ServerRoute {
    fn from_meta(meta: &ServerMeta) -> Self {
        Self {
            name: meta.name.clone(),
            id: meta.id.clone(),
            addr: meta.rpc_addr.clone(),
        }
    }
}

/// Immutable routing snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingTable {
    datacenters: BTreeMap<String, Vec<ServerRoute>>,
}

impl RoutingTable {
    pub fn datacenters(&self) -> Vec<String> {
        self.datacenters.keys().cloned().collect()
    }

    /// Servers of `datacenter`, most recently confirmed first.
    pub fn servers(&self, datacenter: &str) -> &[ServerRoute] {
        self.datacenters
            .get(datacenter)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn upsert(&mut self, datacenter: &str, route: ServerRoute) -> bool {
        let routes = self.datacenters.entry(datacenter.to_string()).or_default();
        match routes.iter_mut().find(|r| r.name == route.name) {
            Some(existing) if *existing == route => false,
            Some(existing) => {
                *existing = route;
                true
            }
            None => {
                routes.push(route);
                true
            }
        }
    }

    fn remove(&mut self, datacenter: &str, name: &str) -> bool {
        let Some(routes) = self.datacenters.get_mut(datacenter) else {
            return false;
        };
        let before = routes.len();
        routes.retain(|r| r.name != name);
        let changed = routes.len() != before;
        if routes.is_empty() {
            self.datacenters.remove(datacenter);
        }
        changed
    }

    /// Move the route at `addr` to the front (`true`) or the back (`false`).
    fn reorder(&mut self, datacenter: &str, addr: &str, to_front: bool) -> bool {
        let Some(routes) = self.datacenters.get_mut(datacenter) else {
            return false;
        };
        let Some(pos) = routes.iter().position(|r| r.addr == addr) else {
            return false;
        };
        let route = routes.remove(pos);
        if to_front {
            routes.insert(0, route);
        } else {
            routes.push(route);
        }
        true
    }
}

pub struct Router {
    local_datacenter: String,
    table: ArcSwap<RoutingTable>,
    writer: Mutex<()>,
}

impl Router {
    pub fn new(local_datacenter: impl Into<String>) -> Self {
        Self {
            local_datacenter: local_datacenter.into(),
            table: ArcSwap::from_pointee(RoutingTable::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn local_datacenter(&self) -> &str {
        &self.local_datacenter
    }

    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    fn update(&self, edit: impl FnOnce(&mut RoutingTable) -> bool) -> bool {
        let _guard = self.writer.lock().unwrap();
        let mut next = RoutingTable::clone(&self.table.load());
        let changed = edit(&mut next);
        if changed {
            self.table.store(Arc::new(next));
        }
        changed
    }

    /// Apply one WAN membership event.
    pub fn on_wan_event(&self, kind: MemberEventKind, members: &[Member]) {
        for member in members {
            let Some(meta) = ServerMeta::from_member(member) else {
                debug!(member = %member.name, "ignoring non-server WAN member");
                continue;
            };
            match kind {
                MemberEventKind::Join => self.add_server(&meta),
                MemberEventKind::Leave | MemberEventKind::Failed => self.remove_server(&meta),
            }
        }
    }

    /// Rebuild the table from a full member list.
    pub fn sync(&self, members: &[Member]) {
        let mut fresh = RoutingTable::default();
        for meta in members
            .iter()
            .filter(|m| m.status.is_alive())
            .filter_map(ServerMeta::from_member)
        {
            fresh.upsert(&meta.datacenter, ServerRoute::from_meta(&meta));
        }
        self.update(|table| {
            // keep the learned ordering for servers that are still known
            for (dc, routes) in fresh.datacenters.iter_mut() {
                let previous = table.servers(dc);
                routes.sort_by_key(|r| {
                    previous
                        .iter()
                        .position(|p| p.name == r.name)
                        .unwrap_or(usize::MAX)
                });
            }
            *table = fresh;
            true
        });
    }

    pub fn add_server(&self, meta: &ServerMeta) {
        let route = ServerRoute::from_meta(meta);
        if self.update(|table| table.upsert(&meta.datacenter, route)) {
            info!(server = %meta.name, datacenter = %meta.datacenter, "router: server added");
        }
    }

    pub fn remove_server(&self, meta: &ServerMeta) {
        if self.update(|table| table.remove(&meta.datacenter, &meta.name)) {
            info!(server = %meta.name, datacenter = %meta.datacenter, "router: server removed");
        }
    }

    /// Addresses to try for a call into a remote datacenter, in order. The
    /// local datacenter is served through the local leader, never from here.
    pub fn targets(&self, datacenter: &str) -> Vec<String> {
        if datacenter == self.local_datacenter {
            return Vec::new();
        }
        self.table
            .load()
            .servers(datacenter)
            .iter()
            .map(|r| r.addr.clone())
            .collect()
    }

    /// Every datacenter with at least one known server, local included.
    pub fn datacenters(&self) -> Vec<String> {
        self.table.load().datacenters()
    }

    pub fn num_servers(&self, datacenter: &str) -> usize {
        self.table.load().servers(datacenter).len()
    }

    pub fn report_success(&self, datacenter: &str, addr: &str) {
        self.update(|table| {
            table.servers(datacenter).first().map(|r| r.addr.as_str()) != Some(addr)
                && table.reorder(datacenter, addr, true)
        });
    }

    pub fn report_failure(&self, datacenter: &str, addr: &str) {
        if self.update(|table| table.reorder(datacenter, addr, false)) {
            debug!(datacenter, addr, "router: deprioritized failing server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{server_tags, MemberStatus};

    fn wan_member(name: &str, dc: &str, rpc: &str) -> Member {
        Member {
            name: format!("{}.{}", name, dc),
            addr: format!("{}-wan", rpc),
            tags: server_tags(&format!("id-{}", name), dc, rpc, 0, false, "wan"),
            status: MemberStatus::Alive,
        }
    }

    #[test]
    fn test_join_and_leave_maintain_datacenters() {
        let router = Router::new("dc1");
        let a = wan_member("a", "dc1", "10.0.0.1:8300");
        let b = wan_member("b", "dc2", "10.0.1.1:8300");
        let c = wan_member("c", "dc2", "10.0.1.2:8300");
        router.on_wan_event(MemberEventKind::Join, &[a.clone(), b.clone(), c.clone()]);

        assert_eq!(router.datacenters(), vec!["dc1", "dc2"]);
        assert_eq!(router.targets("dc2"), vec!["10.0.1.1:8300", "10.0.1.2:8300"]);
        assert!(router.targets("dc1").is_empty(), "local datacenter is never a target");
        assert_eq!(router.num_servers("dc1"), 1);

        router.on_wan_event(MemberEventKind::Leave, &[b]);
        assert_eq!(router.targets("dc2"), vec!["10.0.1.2:8300"]);
        router.on_wan_event(MemberEventKind::Failed, &[c]);
        assert_eq!(router.datacenters(), vec!["dc1"]);
        assert!(router.targets("dc2").is_empty());
    }

    #[test]
    fn test_feedback_reorders_without_removing() {
        let router = Router::new("dc1");
        let members: Vec<_> = (1..=3)
            .map(|i| wan_member(&format!("s{}", i), "dc2", &format!("10.0.1.{}:8300", i)))
            .collect();
        router.on_wan_event(MemberEventKind::Join, &members);

        router.report_failure("dc2", "10.0.1.1:8300");
        assert_eq!(
            router.targets("dc2"),
            vec!["10.0.1.2:8300", "10.0.1.3:8300", "10.0.1.1:8300"]
        );
        router.report_success("dc2", "10.0.1.3:8300");
        assert_eq!(
            router.targets("dc2"),
            vec!["10.0.1.3:8300", "10.0.1.2:8300", "10.0.1.1:8300"]
        );
        router.report_failure("dc2", "10.9.9.9:8300");
        assert_eq!(router.num_servers("dc2"), 3);
    }

    #[test]
    fn test_refresh_and_ignore_non_servers() {
        let router = Router::new("dc1");
        let mut b = wan_member("b", "dc2", "10.0.1.1:8300");
        router.on_wan_event(MemberEventKind::Join, &[b.clone()]);
        b.tags = server_tags("id-b", "dc2", "10.0.1.9:8300", 0, false, "wan");
        router.on_wan_event(MemberEventKind::Join, &[b]);
        assert_eq!(router.targets("dc2"), vec!["10.0.1.9:8300"]);

        let client = Member {
            name: "client.dc3".into(),
            addr: "x".into(),
            tags: Default::default(),
            status: MemberStatus::Alive,
        };
        router.on_wan_event(MemberEventKind::Join, &[client]);
        assert_eq!(router.datacenters(), vec!["dc2"]);
    }

    #[test]
    fn test_sync_keeps_learned_order() {
        let router = Router::new("dc1");
        let members: Vec<_> = (1..=2)
            .map(|i| wan_member(&format!("s{}", i), "dc2", &format!("10.0.1.{}:8300", i)))
            .collect();
        router.on_wan_event(MemberEventKind::Join, &members);
        router.report_success("dc2", "10.0.1.2:8300");
        let snapshot = router.snapshot();

        let mut current = members.clone();
        current.push(wan_member("s3", "dc3", "10.0.2.1:8300"));
        router.sync(&current);
        assert_eq!(router.targets("dc2"), vec!["10.0.1.2:8300", "10.0.1.1:8300"]);
        assert_eq!(router.datacenters(), vec!["dc2", "dc3"]);
        // earlier snapshots are unaffected by later writes
        assert_eq!(snapshot.datacenters(), vec!["dc2"]);
    }
}
