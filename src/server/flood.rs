//! WAN flooding
//!
//! Every server makes sure the servers of its own datacenter that it sees over
//! LAN are also present in the WAN pool, joining them on their behalf. A server
//! that only ever joined its LAN still becomes visible to other datacenters.

use std::collections::HashSet;
use tracing::{debug, info};

use crate::membership::{Member, MembershipPool, ServerMeta};

/// Join every LAN server missing from the WAN view. Returns how many joins
/// succeeded.
pub async fn flood_join(
    datacenter: &str,
    lan_members: &[Member],
    wan: &dyn MembershipPool,
) -> usize {
    let known: HashSet<String> = wan
        .members()
        .into_iter()
        .filter(|m| m.status.is_alive())
        .map(|m| m.name)
        .collect();

    let mut joined = 0;
    let missing = lan_members
        .iter()
        .filter(|m| m.status.is_alive())
        .filter_map(ServerMeta::from_member)
        .filter(|meta| meta.datacenter == datacenter)
        .filter(|meta| !known.contains(&format!("{}.{}", meta.name, meta.datacenter)));
    for meta in missing {
        let Some(addr) = meta.wan_join_addr.as_deref().filter(|a| !a.is_empty()) else {
            debug!(server = %meta.name, "server advertises no WAN address");
            continue;
        };
        match wan.join(&[addr.to_string()]).await {
            Ok(_) => {
                info!(server = %meta.name, addr, "flooded LAN server into WAN");
                joined += 1;
            }
            Err(e) => debug!(server = %meta.name, addr, error = %e, "WAN flood join failed"),
        }
    }
    joined
}
