//! Multi-node delivery: several runtimes in one process sharing a store,
//! talking to each other over the node RPC listener.

mod common;

use common::*;
use courier::cluster::{pick_node_id, OnlineDeviceRoute, RouteStore};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn single_chat_is_forwarded_to_the_recipients_node() {
    let hook = MockHook::spawn(HookScript::default()).await;
    let cluster = Cluster::start(&["n1", "n2"], &hook).await;
    let alice = connect(&cluster.gateway(0), "alice", "phone").await;
    let mut bob = connect(&cluster.gateway(1), "bob", "phone").await;

    let ack = cluster
        .gateway(0)
        .send(&alice.session, single("bob", "m1", b"across"))
        .await;
    assert!(ack.ok, "{ack:?}");
    let delivered = bob.next_delivery().await;
    assert_eq!(delivered.msg_id, "m1");
    assert_eq!(delivered.user_id, "alice");
    assert_eq!(
        cluster.nodes[1].metrics().counter_value(
            "courier_deliveries_total",
            &[("tenant", TENANT), ("via", "rpc_in_single")]
        ),
        1
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn group_fanout_batches_per_node() {
    let mut groups = HashMap::new();
    groups.insert(
        "team".to_string(),
        vec!["alice".into(), "bob".into(), "carol".into(), "dave".into()],
    );
    let hook = MockHook::spawn(HookScript {
        groups,
        ..HookScript::default()
    })
    .await;
    let cluster = Cluster::start(&["n1", "n2"], &hook).await;
    let mut alice = connect(&cluster.gateway(0), "alice", "phone").await;
    let mut bob = connect(&cluster.gateway(1), "bob", "phone").await;
    let mut carol = connect(&cluster.gateway(1), "carol", "phone").await;

    let ack = cluster
        .gateway(0)
        .send(&alice.session, group("team", "g1", b"standup"))
        .await;
    assert!(ack.ok, "{ack:?}");
    assert_eq!(alice.next_delivery().await.msg_id, "g1");
    assert_eq!(bob.next_delivery().await.msg_id, "g1");
    assert_eq!(carol.next_delivery().await.msg_id, "g1");
    assert_eq!(
        cluster.nodes[0]
            .metrics()
            .counter_total("courier_group_fanout_nodes_total"),
        2
    );

    // dave was offline; the message waits at his owner node.
    let mut dave = connect(&cluster.gateway(1), "dave", "phone").await;
    assert_eq!(dave.next_delivery().await.msg_id, "g1");
    cluster.shutdown().await;
}

#[tokio::test]
async fn offline_messages_wait_at_owner_node_and_follow_the_user() {
    let hook = MockHook::spawn(HookScript::default()).await;
    let cluster = Cluster::start(&["n1", "n2", "n3"], &hook).await;
    let alice = connect(&cluster.gateway(0), "alice", "phone").await;

    let ack = cluster
        .gateway(0)
        .send(&alice.session, single("bob", "m1", b"while away"))
        .await;
    assert!(ack.ok, "{ack:?}");

    let live = cluster.nodes[0].snapshot().current();
    let owner = pick_node_id(TENANT, "bob", &live).unwrap().to_string();
    let owner_index = cluster
        .nodes
        .iter()
        .position(|n| n.local_node().node_id == owner)
        .unwrap();
    assert_eq!(
        cluster.nodes[owner_index]
            .metrics()
            .counter_total("courier_offline_buffered_total"),
        1
    );

    // Connect somewhere other than the owner; the buffer is pulled across.
    let elsewhere = (owner_index + 1) % cluster.nodes.len();
    let mut bob = connect(&cluster.gateway(elsewhere), "bob", "phone").await;
    assert_eq!(bob.next_delivery().await.msg_id, "m1");
    cluster.shutdown().await;
}

#[tokio::test]
async fn unreachable_node_falls_back_to_offline_buffer() {
    let hook = MockHook::spawn(HookScript::default()).await;
    let cluster = Cluster::start(&["n1", "n2"], &hook).await;
    let alice = connect(&cluster.gateway(0), "alice", "phone").await;

    // A route left behind by a node that died without cleaning up.
    let dead = ephemeral_port();
    RouteStore::new(cluster.store.clone())
        .upsert(
            TENANT,
            "bob",
            "old-phone",
            &OnlineDeviceRoute {
                node_id: "ghost".into(),
                endpoint: format!("http://{dead}"),
                connection_id: "c-ghost".into(),
                online_at_ms: 1,
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let ack = cluster
        .gateway(0)
        .send(&alice.session, single("bob", "m1", b"are you there"))
        .await;
    assert!(ack.ok, "{ack:?}");
    assert!(
        cluster.nodes[0]
            .metrics()
            .counter_total("courier_node_forward_failed_total")
            >= 1
    );

    let mut bob = connect(&cluster.gateway(1), "bob", "phone").await;
    assert_eq!(bob.next_delivery().await.msg_id, "m1");
    cluster.shutdown().await;
}

#[tokio::test]
async fn drained_node_leaves_the_directory() {
    let hook = MockHook::spawn(HookScript::default()).await;
    let mut cluster = Cluster::start(&["n1", "n2"], &hook).await;
    assert_eq!(cluster.nodes[0].snapshot().current().len(), 2);

    let mut gone = cluster.nodes.remove(1);
    gone.shutdown().await.unwrap();
    cluster.refresh_snapshots().await;
    let live = cluster.nodes[0].snapshot().current();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].node_id, "n1");
    cluster.shutdown().await;
}
