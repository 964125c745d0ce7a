//! WAN federation: datacenter discovery, flooding, advertise addresses

mod common;

use common::*;
use dcfed::common::GossipConfig;
use dcfed::{MemoryNetwork, ServerConfig};

#[tokio::test]
async fn single_server_knows_its_datacenter() {
    let network = MemoryNetwork::new();
    let s1 = start(&network, bootstrap_config("s1", "dc1")).await;
    assert_eq!(s1.datacenters(), vec!["dc1"]);
    assert!(s1.router().targets("dc1").is_empty());
    s1.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wan_join_discovers_datacenters() {
    let network = MemoryNetwork::new();
    let s1 = start(&network, bootstrap_config("s1", "dc1")).await;
    let s2 = start(&network, bootstrap_config("s2", "dc2")).await;

    join_wan(&s2, &s1).await;
    assert_eq!(s1.wan_members().len(), 2);
    assert_eq!(s2.wan_members().len(), 2);
    let mut names: Vec<String> = s1.wan_members().into_iter().map(|m| m.name).collect();
    names.sort();
    assert_eq!(names, vec!["s1.dc1", "s2.dc2"]);

    assert!(wait_for(WAIT, || s1.datacenters().len() == 2 && s2.datacenters().len() == 2).await);
    assert_eq!(s1.datacenters(), vec!["dc1", "dc2"]);
    assert_eq!(s1.router().targets("dc2"), vec![s2.config().rpc_addr.clone()]);

    shutdown_all(&[s1, s2]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lan_only_join_floods_into_wan() {
    let network = MemoryNetwork::new();
    let s1 = start(&network, bootstrap_config("s1", "dc1")).await;
    let s2 = start(&network, test_config("s2", "dc1")).await;
    let s3 = start(&network, bootstrap_config("s3", "dc2")).await;

    join_wan(&s3, &s1).await;
    // s2 never touches the WAN itself
    join_lan(&s2, &s1).await;

    let has = |members: Vec<dcfed::membership::Member>, name: &str| {
        members.iter().any(|m| m.name == name)
    };
    assert!(wait_for(WAIT, || has(s3.wan_members(), "s2.dc1")).await);
    assert!(wait_for(WAIT, || has(s2.wan_members(), "s3.dc2")).await);
    assert!(wait_for(WAIT, || s3.router().num_servers("dc1") == 2).await);

    shutdown_all(&[s1, s2, s3]).await;
}

#[tokio::test]
async fn separate_lan_and_wan_advertise_addresses() {
    let network = MemoryNetwork::new();
    let base = bootstrap_config("s1", "dc1");
    let config = ServerConfig {
        lan: GossipConfig {
            advertise_addr: Some("10.0.0.1:8301".to_string()),
            ..base.lan.clone()
        },
        wan: GossipConfig {
            advertise_addr: Some("192.0.2.1:8302".to_string()),
            ..base.wan.clone()
        },
        ..base
    };
    let s1 = start(&network, config).await;

    let lan = s1.lan_members();
    let wan = s1.wan_members();
    assert_eq!(lan.len(), 1);
    assert_eq!(wan.len(), 1);
    assert_eq!(lan[0].addr, "10.0.0.1:8301");
    assert_eq!(wan[0].addr, "192.0.2.1:8302");

    // peers reach the server through its WAN advertise address
    let s2 = start(&network, bootstrap_config("s2", "dc2")).await;
    s2.join_wan(&["192.0.2.1:8302".to_string()]).await.unwrap();
    assert_eq!(s1.wan_members().len(), 2);

    shutdown_all(&[s1, s2]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn datacenter_disappears_with_last_server() {
    let network = MemoryNetwork::new();
    let s1 = start(&network, bootstrap_config("s1", "dc1")).await;
    let s2 = start(&network, bootstrap_config("s2", "dc2")).await;
    join_wan(&s2, &s1).await;
    assert!(wait_for(WAIT, || s1.datacenters().len() == 2).await);

    s2.shutdown().await.unwrap();
    assert!(wait_for(WAIT, || s1.datacenters() == vec!["dc1"]).await);
    assert!(s1.router().targets("dc2").is_empty());

    s1.shutdown().await.unwrap();
}
