mod common;

use std::collections::BTreeSet;

use beacon_core::cluster::{Announcement, ClusterView, InstanceDescription};
use beacon_core::error::UndefinedReason;
use beacon_runtime::cluster::{read_established_view, DiscoveryPaths};
use beacon_runtime::testing::ScriptedResponse;

use common::{converge, Cluster};

#[tokio::test]
async fn test_stale_instance_is_dropped_from_view_and_vote() {
    let cluster = Cluster::new();
    let x = cluster.node("x", |_| {});
    let y = cluster.node("y", |_| {});
    converge(&[&x, &y], 2).await;

    let topology = y.get_topology().await;
    let leaders: Vec<&str> = topology
        .instances()
        .iter()
        .filter(|i| i.is_leader)
        .map(|i| i.sling_id.as_str())
        .collect();
    assert_eq!(leaders, vec!["x"]);

    // x stops heartbeating; y keeps going.
    for _ in 0..6 {
        cluster.advance(5);
        y.heartbeat().tick().await.unwrap();
    }

    let view = y.cluster_views().local_cluster_view().await.unwrap();
    assert_eq!(view.instance_ids(), vec!["y"]);
    assert!(view.instance("y").unwrap().is_leader);

    let paths = DiscoveryPaths::new(y.config().discovery.root.clone());
    let established = read_established_view(cluster.store.as_ref(), &paths)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(established.members, BTreeSet::from(["y".to_string()]));
    assert_eq!(established.leader_id, "y");

    let topology = y.get_topology().await;
    assert!(topology.is_current());
    assert!(topology.instance("x").is_none());
}

#[tokio::test]
async fn test_isolated_instance_serves_old_view() {
    let cluster = Cluster::new();
    let a = cluster.node("a", |_| {});
    converge(&[&a], 1).await;
    let current = a.get_topology().await;
    assert!(current.is_current());

    cluster.advance(60);
    let undefined = a.cluster_views().local_cluster_view().await.unwrap_err();
    assert_eq!(undefined.reason, UndefinedReason::IsolatedFromTopology);

    let first = a.get_topology().await;
    let second = a.get_topology().await;
    assert!(!first.is_current());
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.local_instance().map(|i| i.sling_id.as_str()), Some("a"));
}

#[tokio::test]
async fn test_at_most_one_leader_across_nodes() {
    let cluster = Cluster::new();
    let b = cluster.node("b", |_| {});
    let a = cluster.node("a", |_| {});
    let c = cluster.node("c", |_| {});
    converge(&[&b, &c, &a], 3).await;

    for node in [&a, &b, &c] {
        let topology = node.get_topology().await;
        let leaders: Vec<&str> = topology
            .instances()
            .iter()
            .filter(|i| i.is_leader)
            .map(|i| i.sling_id.as_str())
            .collect();
        assert_eq!(leaders, vec!["a"]);
    }
}

#[tokio::test]
async fn test_announced_instances_expire() {
    let cluster = Cluster::new();
    let url = "http://peer:8081";
    let a = cluster.node("a", |config| config.connector.urls = vec![url.to_string()]);
    a.heartbeat().startup_finished().await;

    let remote = Announcement::new("r").with_cluster_view(ClusterView::new(
        "remote",
        vec![InstanceDescription::new("r").with_leader(true)],
    ));
    cluster.transport.push(url, ScriptedResponse::Reply(remote));

    converge(&[&a], 1).await;
    a.heartbeat().tick().await.unwrap();
    assert!(cluster.transport.request_count() >= 1);
    assert!(a.get_topology().await.instance("r").is_some());
    assert!(a.announcements().has_active_announcement("r").await);

    // The peer is gone from now on; the announcement ages out.
    cluster.advance(31);
    a.heartbeat().tick().await.unwrap();
    assert!(!a.announcements().has_active_announcement("r").await);
    let topology = a.get_topology().await;
    assert!(topology.is_current());
    assert!(topology.instance("r").is_none());
}
