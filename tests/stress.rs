//! Larger federation convergence, run with `--features heavy-tests`

#![cfg(feature = "heavy-tests")]

mod common;

use common::*;
use dcfed::server::CollectReplies;
use dcfed::MemoryNetwork;
use serde_json::Value;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_federation_converges() {
    let network = MemoryNetwork::new();
    let datacenters = 4;
    let per_dc = 5;

    let start_time = Instant::now();
    let mut fleet = Vec::new();
    for dc in 1..=datacenters {
        let name = format!("dc{}", dc);
        let mut servers = Vec::new();
        for i in 1..=per_dc {
            let config = expect_config(&format!("s{}", i), &name, per_dc as u32);
            servers.push(start(&network, config).await);
        }
        for server in &servers[1..] {
            join_lan(server, &servers[0]).await;
        }
        fleet.push(servers);
    }
    for servers in &fleet[1..] {
        join_wan(&servers[0], &fleet[0][0]).await;
    }

    let all: Vec<_> = fleet.iter().flatten().cloned().collect();
    assert!(
        wait_for(Duration::from_secs(30), || {
            all.iter()
                .all(|s| peers(s) == per_dc && s.datacenters().len() == datacenters)
        })
        .await
    );
    for servers in &fleet {
        assert_eq!(leaders(servers).len(), 1);
    }
    // every server is in the WAN, flooded in by its datacenter
    assert!(wait_for(Duration::from_secs(10), || all
        .iter()
        .all(|s| s.wan_members().len() == datacenters * per_dc))
    .await);

    let mut merged = CollectReplies::<Vec<String>>::default();
    fleet[2][3]
        .global_rpc("Catalog.ListDatacenters", Value::Null, &mut merged)
        .await
        .unwrap();
    assert_eq!(merged.replies.len(), datacenters);

    println!(
        "{} servers in {} datacenters converged in {:?}",
        all.len(),
        datacenters,
        start_time.elapsed()
    );
    shutdown_all(&all).await;
}
