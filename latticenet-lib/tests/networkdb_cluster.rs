//! Multi-node NetworkDB tests over real loopback sockets.

use std::time::Duration;

use latticenet_lib::networkdb::{NetworkDb, NetworkDbConfig, NetworkDbError, WatchEvent};
use serial_test::serial;
use tokio::time::{sleep, timeout, Instant};

const NETWORK: &str = "overlay-1";
const TABLE: &str = "endpoints";

fn config(name: &str, reap_secs: u64) -> NetworkDbConfig {
    NetworkDbConfig {
        node_id: name.to_string(),
        hostname: name.to_string(),
        bind_addr: "127.0.0.1".parse().unwrap(),
        bind_port: 0,
        gossip_interval_ms: 50,
        bulk_sync_interval_secs: 1,
        reap_entry_interval_secs: reap_secs,
        // Keep the failure detector and islands recovery quiet; these tests
        // exercise replication, not liveness.
        node_failure_timeout_ms: 60_000,
        rejoin_cluster_interval_secs: 600,
        stats_print_period_secs: 600,
        ..Default::default()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, cond: F) {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn start_cluster(names: &[&str], reap_secs: u64) -> Vec<NetworkDb> {
    let mut nodes = Vec::new();
    for name in names {
        nodes.push(NetworkDb::new(config(name, reap_secs)).await.unwrap());
    }
    let seed = nodes[0].advertise_addr();
    for node in &nodes[1..] {
        node.join(&[seed]).await.unwrap();
    }
    let expected = nodes.len();
    wait_for("cluster membership to converge", Duration::from_secs(15), || {
        nodes.iter().all(|n| n.cluster_peers().len() == expected)
    })
    .await;
    nodes
}

async fn close_all(nodes: Vec<NetworkDb>) {
    for node in nodes {
        node.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn entries_converge_across_five_nodes() {
    let nodes = start_cluster(&["n0", "n1", "n2", "n3", "n4"], 600).await;
    for node in &nodes {
        node.join_network(NETWORK).await.unwrap();
    }
    wait_for("network membership to converge", Duration::from_secs(15), || {
        nodes.iter().all(|n| n.network_peers(NETWORK).len() == nodes.len() - 1)
    })
    .await;

    nodes[0].create_entry(TABLE, NETWORK, "svc", b"10.0.0.1".to_vec()).unwrap();
    wait_for("entry to reach every node", Duration::from_secs(15), || {
        nodes.iter().all(|n| {
            n.get_entry(TABLE, NETWORK, "svc")
                .map(|v| v == b"10.0.0.1")
                .unwrap_or(false)
        })
    })
    .await;

    nodes[0].update_entry(TABLE, NETWORK, "svc", b"10.0.0.2".to_vec()).unwrap();
    wait_for("update to reach every node", Duration::from_secs(15), || {
        nodes.iter().all(|n| {
            n.get_entry(TABLE, NETWORK, "svc")
                .map(|v| v == b"10.0.0.2")
                .unwrap_or(false)
        })
    })
    .await;

    nodes[0].delete_entry(TABLE, NETWORK, "svc").unwrap();
    wait_for("delete to reach every node", Duration::from_secs(15), || {
        nodes
            .iter()
            .all(|n| matches!(n.get_entry(TABLE, NETWORK, "svc"), Err(NetworkDbError::EntryNotFound { .. })))
    })
    .await;

    close_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn local_create_constraints() {
    let node = NetworkDb::new(config("solo", 600)).await.unwrap();
    assert!(matches!(
        node.create_entry(TABLE, NETWORK, "k", b"v".to_vec()),
        Err(NetworkDbError::NetworkNotJoined(_))
    ));
    node.join_network(NETWORK).await.unwrap();
    node.create_entry(TABLE, NETWORK, "k", b"v".to_vec()).unwrap();
    assert!(matches!(
        node.create_entry(TABLE, NETWORK, "k", b"v2".to_vec()),
        Err(NetworkDbError::EntryExists { .. })
    ));
    assert!(matches!(
        node.delete_entry(TABLE, NETWORK, "missing"),
        Err(NetworkDbError::EntryNotFound { .. })
    ));
    node.delete_entry(TABLE, NETWORK, "k").unwrap();
    // A deleted key can be created again.
    node.create_entry(TABLE, NETWORK, "k", b"v3".to_vec()).unwrap();
    assert_eq!(node.get_entry(TABLE, NETWORK, "k").unwrap(), b"v3");
    node.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn tombstones_reach_late_joiners_then_reap() {
    let nodes = start_cluster(&["t0", "t1"], 10).await;
    for node in &nodes {
        node.join_network(NETWORK).await.unwrap();
    }
    wait_for("two-node network", Duration::from_secs(15), || {
        nodes.iter().all(|n| n.network_peers(NETWORK).len() == 1)
    })
    .await;

    for i in 0..5 {
        nodes[0]
            .create_entry(TABLE, NETWORK, &format!("k{i}"), format!("v{i}").into_bytes())
            .unwrap();
    }
    wait_for("entries to replicate", Duration::from_secs(15), || {
        nodes[1].table_entries(TABLE, NETWORK).len() == 5
    })
    .await;
    for i in 0..5 {
        nodes[0].delete_entry(TABLE, NETWORK, &format!("k{i}")).unwrap();
    }

    // A third node joining before the reap interval elapses must observe all
    // five tombstones through bulk sync.
    let late = NetworkDb::new(config("t2", 10)).await.unwrap();
    late.join(&[nodes[0].advertise_addr()]).await.unwrap();
    late.join_network(NETWORK).await.unwrap();
    wait_for("tombstones to reach the late joiner", Duration::from_secs(8), || {
        late.network_entry_count(NETWORK) == 5
            && late.table_entries(TABLE, NETWORK).is_empty()
    })
    .await;

    // After the reap interval every node converges to zero entries.
    wait_for("tombstones to be reaped everywhere", Duration::from_secs(25), || {
        nodes
            .iter()
            .chain(std::iter::once(&late))
            .all(|n| n.network_entry_count(NETWORK) == 0)
    })
    .await;

    late.close().await;
    close_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn watch_delivers_snapshot_then_live_events() {
    let nodes = start_cluster(&["w0", "w1"], 600).await;
    for node in &nodes {
        node.join_network(NETWORK).await.unwrap();
    }

    nodes[0].create_entry(TABLE, NETWORK, "existing", b"before".to_vec()).unwrap();
    wait_for("entry to replicate", Duration::from_secs(15), || {
        nodes[1].get_entry(TABLE, NETWORK, "existing").is_ok()
    })
    .await;

    let (mut rx, cancel) = nodes[1].watch(Some(TABLE), Some(NETWORK));

    // Snapshot first: a synthetic create for the remotely-owned entry.
    let first = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    match first {
        WatchEvent::Create(rec) => {
            assert_eq!(rec.key, "existing");
            assert_eq!(rec.value, b"before");
        }
        other => panic!("expected snapshot create, got {other:?}"),
    }

    nodes[0].update_entry(TABLE, NETWORK, "existing", b"after".to_vec()).unwrap();
    let second = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    match second {
        WatchEvent::Update(rec) => assert_eq!(rec.value, b"after"),
        other => panic!("expected update, got {other:?}"),
    }

    // Deletes carry the last value the watcher observed.
    nodes[0].delete_entry(TABLE, NETWORK, "existing").unwrap();
    let third = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    match third {
        WatchEvent::Delete(rec) => assert_eq!(rec.value, b"after"),
        other => panic!("expected delete, got {other:?}"),
    }

    cancel.cancel();
    close_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn clean_leave_removes_peer_from_active_set() {
    let mut nodes = start_cluster(&["l0", "l1"], 600).await;
    let leaver = nodes.pop().unwrap();
    let stayer = nodes.pop().unwrap();

    leaver.close().await;
    wait_for("leaver to disappear from the active set", Duration::from_secs(15), || {
        stayer.cluster_peers().len() == 1
    })
    .await;
    stayer.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn network_leave_suppresses_peer_entries() {
    let nodes = start_cluster(&["x0", "x1"], 600).await;
    for node in &nodes {
        node.join_network(NETWORK).await.unwrap();
    }
    wait_for("two-node network", Duration::from_secs(15), || {
        nodes.iter().all(|n| n.network_peers(NETWORK).len() == 1)
    })
    .await;

    nodes[1].create_entry(TABLE, NETWORK, "owned-by-x1", b"v".to_vec()).unwrap();
    wait_for("entry to replicate", Duration::from_secs(15), || {
        nodes[0].get_entry(TABLE, NETWORK, "owned-by-x1").is_ok()
    })
    .await;

    nodes[1].leave_network(NETWORK).unwrap();
    // The peer's entries become tombstones on the remaining member.
    wait_for("entries of the departed member to die", Duration::from_secs(15), || {
        nodes[0].get_entry(TABLE, NETWORK, "owned-by-x1").is_err()
            && nodes[0].network_peers(NETWORK).is_empty()
    })
    .await;

    close_all(nodes).await;
}
