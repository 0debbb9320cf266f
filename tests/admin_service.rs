//! Admin channel tests against real in-process node servers.

mod fixtures;

use bytes::Bytes;

use ringkv::cluster::{Cluster, Node};
use ringkv::store::{ServerState, CLUSTER_KEY, OLD_CLUSTER_KEY};
use ringkv::versioning::{now_ms, VectorClock, Versioned};
use ringkv::xml;

use fixtures::{memory_store_def, TestRing};

fn two_node_ring() -> TestRing {
    TestRing::start(
        &[vec![0, 1], vec![2, 3]],
        &[memory_store_def("users", 1)],
    )
}

/// The running cluster plus a joining node 2 owning two new partitions.
fn grown_cluster(ring: &TestRing) -> Cluster {
    let mut nodes: Vec<Node> = ring.cluster.nodes().cloned().collect();
    nodes.push(Node::new(2, "127.0.0.1", 8883, 6668, 7779, vec![4, 5]));
    Cluster::new("grown", nodes).unwrap()
}

#[test]
fn update_cluster_metadata_reaches_the_peer() {
    let ring = two_node_ring();
    let client = ring.admin_client(0);
    let grown = grown_cluster(&ring);

    client.update_cluster_metadata(1, &grown, CLUSTER_KEY).unwrap();

    let seen = ring.server(1).metadata().get_cluster().unwrap();
    assert_eq!(seen, grown);
    // Node 0 still has the original view; propagation is per-target.
    assert_eq!(ring.server(0).metadata().get_cluster().unwrap(), ring.cluster);
}

#[test]
fn update_old_cluster_snapshots_without_touching_current() {
    let ring = two_node_ring();
    let client = ring.admin_client(0);
    let grown = grown_cluster(&ring);

    client
        .update_cluster_metadata(1, &grown, OLD_CLUSTER_KEY)
        .unwrap();

    let metadata = ring.server(1).metadata();
    let snapshot = metadata.get_versioned(OLD_CLUSTER_KEY).unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(xml::parse_cluster(&snapshot[0].value).unwrap(), grown);
    assert_eq!(metadata.get_cluster().unwrap(), ring.cluster);
}

#[test]
fn update_stores_metadata_replaces_the_definition_list() {
    let ring = TestRing::start(
        &[vec![0, 1], vec![2, 3]],
        &[memory_store_def("users", 1), memory_store_def("events", 1)],
    );
    let client = ring.admin_client(0);

    // Drop the `users` store from the definitions and push to the peer.
    let remaining: Vec<_> = ring
        .server(1)
        .metadata()
        .get_stores()
        .unwrap()
        .into_iter()
        .filter(|def| def.name != "users")
        .collect();
    client.update_stores_metadata(1, &remaining).unwrap();

    let names: Vec<String> = ring
        .server(1)
        .metadata()
        .get_stores()
        .unwrap()
        .into_iter()
        .map(|def| def.name)
        .collect();
    assert_eq!(names, vec!["events".to_string()]);
    assert!(ring.server(1).metadata().get_store("users").is_err());
}

#[test]
fn redirect_get_returns_value_and_clock() {
    let ring = two_node_ring();
    let engine = ring.server(0).services().engine("users").unwrap();

    let key = Bytes::from_static(b"test_member_1");
    let value = Bytes::from_static(b"test-value-1");
    let clock = VectorClock::new().incremented(0, now_ms());
    engine
        .put(key.clone(), Versioned::new(value.clone(), clock.clone()))
        .unwrap();

    let client = ring.admin_client(1);
    let found = client.redirect_get(0, "users", &key).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, value);
    assert_eq!(found[0].version, clock);
}

#[test]
fn redirect_get_on_missing_store_reports_store_not_found() {
    let ring = two_node_ring();
    let client = ring.admin_client(1);
    let err = client.redirect_get(0, "no-such-store", b"k").unwrap_err();
    assert!(matches!(err, ringkv::StoreError::StoreNotFound(_)));
}

#[test]
fn restart_services_bumps_the_generation() {
    let ring = two_node_ring();
    let before = ring.server(1).services().generation();
    ring.admin_client(0).restart_services(1).unwrap();
    assert_eq!(ring.server(1).services().generation(), before + 1);
}

#[test]
fn state_transitions_cycle_and_repeat() {
    let ring = two_node_ring();
    let client = ring.admin_client(0);
    let metadata = ring.server(1).metadata().clone();

    assert_eq!(metadata.server_state().unwrap(), ServerState::Normal);

    client.set_rebalancing_state_and_restart(1).unwrap();
    assert_eq!(metadata.server_state().unwrap(), ServerState::Rebalancing);

    client.set_normal_state_and_restart(1).unwrap();
    assert_eq!(metadata.server_state().unwrap(), ServerState::Normal);

    // One more lap: the cycle is idempotent.
    client.set_rebalancing_state_and_restart(1).unwrap();
    assert_eq!(metadata.server_state().unwrap(), ServerState::Rebalancing);
    client.set_normal_state_and_restart(1).unwrap();
    assert_eq!(metadata.server_state().unwrap(), ServerState::Normal);
}
