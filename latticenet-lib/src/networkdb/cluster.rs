//! Gossip transport, membership maintenance and the periodic loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::bulk_sync;
use super::message::{Message, NodeEventKind, MAX_UDP_PAYLOAD};
use super::{NetworkDbError, Shared};

/// Gossip targets per tick, per scope.
const GOSSIP_FANOUT: usize = 3;
/// Granularity of the reap timers and the failure sweep.
const REAP_PERIOD: Duration = Duration::from_secs(1);
/// Pause between join attempts while reconnecting an isolated node.
const REJOIN_ATTEMPT_PAUSE: Duration = Duration::from_secs(1);

pub(crate) fn spawn_loops(shared: &Arc<Shared>, tcp: TcpListener) {
    shared.tracker.spawn(udp_recv_loop(shared.clone(), shared.shutdown_tx.subscribe()));
    shared.tracker.spawn(tcp_accept_loop(shared.clone(), tcp, shared.shutdown_tx.subscribe()));
    shared.tracker.spawn(gossip_loop(shared.clone(), shared.shutdown_tx.subscribe()));
    shared.tracker.spawn(reap_loop(shared.clone(), shared.shutdown_tx.subscribe()));
    shared.tracker.spawn(failure_sweep_loop(shared.clone(), shared.shutdown_tx.subscribe()));
    shared.tracker.spawn(periodic_bulk_sync_loop(shared.clone(), shared.shutdown_tx.subscribe()));
    shared.tracker.spawn(rejoin_loop(shared.clone(), shared.shutdown_tx.subscribe()));
    shared.tracker.spawn(stats_loop(shared.clone(), shared.shutdown_tx.subscribe()));
}

/// Send the initial join events. Each carries `reply_requested` so the
/// receiver unicasts back its node and network state.
pub(crate) async fn send_join(
    shared: &Arc<Shared>,
    members: &[SocketAddr],
) -> Result<(), NetworkDbError> {
    let ltime = shared.state_read().network_clock.increment();
    let event = shared.self_node_event(NodeEventKind::Join, ltime, true);
    let frame = Message::NodeEvent(event).encode()?;
    for member in members {
        shared.udp.send_to(&frame, member).await?;
        debug!(%member, "sent join");
    }
    Ok(())
}

/// Best-effort clean-leave broadcast to every active peer.
pub(crate) async fn send_leave(shared: &Arc<Shared>) -> Result<(), NetworkDbError> {
    let (frame, peers) = {
        let st = shared.state_read();
        let ltime = st.network_clock.increment();
        let event = shared.self_node_event(NodeEventKind::Leave, ltime, false);
        let peers: Vec<SocketAddr> = st
            .nodes
            .values()
            .filter(|n| n.node_id != st.self_id)
            .map(|n| n.socket_addr())
            .collect();
        (Message::NodeEvent(event).encode()?, peers)
    };
    for peer in peers {
        let _ = shared.udp.send_to(&frame, peer).await;
    }
    Ok(())
}

async fn udp_recv_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            result = shared.udp.recv_from(&mut buf) => match result {
                Ok((len, from)) => handle_frame(&shared, &buf[..len], from).await,
                Err(e) => warn!(error = %e, "udp receive failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn tcp_accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    shared.tracker.clone().spawn(async move {
                        bulk_sync::handle_connection(shared, stream, peer).await;
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept bulk sync connection"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Decode and dispatch one datagram. Undecodable frames are logged and
/// dropped; compounds are unpacked iteratively.
async fn handle_frame(shared: &Arc<Shared>, data: &[u8], from: SocketAddr) {
    let first = match Message::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(%from, error = %e, "dropping undecodable message");
            return;
        }
    };
    let entry_reap = shared.config.reap_entry_interval();
    let node_reap = shared.config.node_reap_interval();
    let mut work = vec![first];
    while let Some(msg) = work.pop() {
        match msg {
            Message::Compound(frames) => {
                for frame in frames {
                    match Message::decode(&frame) {
                        Ok(sub) => work.push(sub),
                        Err(e) => debug!(%from, error = %e, "dropping undecodable sub-message"),
                    }
                }
            }
            Message::NodeEvent(ev) => {
                let reply_to = (ev.reply_requested && ev.kind == NodeEventKind::Join)
                    .then(|| SocketAddr::new(ev.addr, ev.port));
                let changed = shared
                    .state_write()
                    .apply_node_event(ev.clone(), node_reap, entry_reap);
                if changed {
                    let mut spread = ev;
                    spread.reply_requested = false;
                    if let Ok(frame) = Message::NodeEvent(spread).encode() {
                        shared.cluster_queue.queue(frame);
                    }
                }
                if let Some(to) = reply_to {
                    send_state_summary(shared, to).await;
                }
            }
            Message::NetworkEvent(ev) => {
                let changed = shared.state_write().apply_network_event(ev.clone(), entry_reap);
                if changed {
                    if let Ok(frame) = Message::NetworkEvent(ev).encode() {
                        shared.cluster_queue.queue(frame);
                    }
                }
            }
            Message::TableEvent(ev) => {
                let accepted = shared.state_write().apply_table_event(ev.clone(), entry_reap);
                if accepted {
                    // Keep the epidemic going on that network's queue.
                    let queue = {
                        let st = shared.state_read();
                        st.local_network(&ev.network_id).map(|rec| rec.broadcasts.clone())
                    };
                    if let Some(queue) = queue {
                        if let Ok(frame) = Message::TableEvent(ev).encode() {
                            queue.queue(frame);
                        }
                    }
                }
            }
            Message::BulkSyncRequest(_) | Message::BulkSyncResponse(_) => {
                debug!(%from, "ignoring bulk sync message on the gossip socket");
            }
        }
    }
}

/// Unicast a summary of the node table and every known network membership,
/// chunked into MTU-sized compounds. Sent to joiners so they bootstrap
/// without waiting for gossip to converge.
async fn send_state_summary(shared: &Arc<Shared>, to: SocketAddr) {
    use super::message::{NetworkEventKind, NetworkEventMsg, NodeEventMsg};

    let frames: Vec<Vec<u8>> = {
        let st = shared.state_read();
        let mut frames = Vec::new();
        for node in st.nodes.values() {
            let event = NodeEventMsg {
                kind: NodeEventKind::Join,
                ltime: node.ltime,
                node_id: node.node_id.clone(),
                hostname: node.hostname.clone(),
                addr: node.addr,
                port: node.port,
                reply_requested: false,
            };
            if let Ok(frame) = Message::NodeEvent(event).encode() {
                frames.push(frame);
            }
        }
        for (node_id, nets) in st.networks.iter() {
            for (network_id, rec) in nets.iter() {
                let kind = if rec.leaving {
                    NetworkEventKind::Leave
                } else {
                    NetworkEventKind::Join
                };
                let event = NetworkEventMsg {
                    kind,
                    ltime: rec.ltime,
                    node_id: node_id.clone(),
                    network_id: network_id.clone(),
                };
                if let Ok(frame) = Message::NetworkEvent(event).encode() {
                    frames.push(frame);
                }
            }
        }
        frames
    };

    let mut batch: Vec<Vec<u8>> = Vec::new();
    let mut size = 0usize;
    for frame in frames {
        if size + frame.len() > MAX_UDP_PAYLOAD && !batch.is_empty() {
            send_compound(shared, std::mem::take(&mut batch), to).await;
            size = 0;
        }
        size += frame.len();
        batch.push(frame);
    }
    if !batch.is_empty() {
        send_compound(shared, batch, to).await;
    }
}

async fn send_compound(shared: &Arc<Shared>, frames: Vec<Vec<u8>>, to: SocketAddr) {
    match Message::Compound(frames).encode() {
        Ok(bytes) => {
            if let Err(e) = shared.udp.send_to(&bytes, to).await {
                debug!(%to, error = %e, "gossip send failed");
            }
        }
        Err(e) => debug!(error = %e, "failed to encode compound"),
    }
}

/// Every tick: send the local alive heartbeat plus queued cluster events to a
/// few random peers, and drain each joined network's table-event queue toward
/// a few random members of that network.
async fn gossip_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.gossip_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => gossip_tick(&shared).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn gossip_tick(shared: &Arc<Shared>) {
    let mut sends: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
    {
        let st = shared.state_read();
        let peers: Vec<SocketAddr> = st
            .nodes
            .values()
            .filter(|n| n.node_id != st.self_id)
            .map(|n| n.socket_addr())
            .collect();
        if peers.is_empty() {
            return;
        }
        let cluster_size = st.nodes.len();
        let mut rng = rand::rng();

        // Cluster-scope compound: alive heartbeat plus node/network events.
        let mut frames = Vec::new();
        let heartbeat =
            shared.self_node_event(NodeEventKind::Join, st.network_clock.time(), false);
        if let Ok(frame) = Message::NodeEvent(heartbeat).encode() {
            frames.push(frame);
        }
        frames.extend(shared.cluster_queue.get_broadcasts(MAX_UDP_PAYLOAD / 2, cluster_size));
        if let Ok(compound) = Message::Compound(frames).encode() {
            for target in peers.choose_multiple(&mut rng, GOSSIP_FANOUT) {
                sends.push((compound.clone(), *target));
            }
        }

        // Per-network table-event gossip.
        if let Some(local) = st.networks.get(&st.self_id) {
            for (network_id, rec) in local.iter() {
                if rec.leaving || rec.broadcasts.is_empty() {
                    continue;
                }
                let members: Vec<SocketAddr> = st
                    .network_nodes
                    .get(network_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| st.nodes.get(id))
                    .map(|n| n.socket_addr())
                    .collect();
                if members.is_empty() {
                    // Keep the events queued until somebody can hear them.
                    continue;
                }
                let frames = rec
                    .broadcasts
                    .get_broadcasts(MAX_UDP_PAYLOAD, members.len() + 1);
                if frames.is_empty() {
                    continue;
                }
                if let Ok(compound) = Message::Compound(frames).encode() {
                    for target in members.choose_multiple(&mut rng, GOSSIP_FANOUT) {
                        sends.push((compound.clone(), *target));
                    }
                }
            }
        }
    }
    for (bytes, to) in sends {
        if let Err(e) = shared.udp.send_to(&bytes, to).await {
            debug!(%to, error = %e, "gossip send failed");
        }
    }
}

async fn reap_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(REAP_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.state_write().reap_tick(REAP_PERIOD),
            _ = shutdown.changed() => break,
        }
    }
}

/// Nodes silent past the failure timeout move to the failed partition and
/// start their reap countdown.
async fn failure_sweep_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let timeout = shared.config.node_failure_timeout();
    let node_reap = shared.config.node_reap_interval();
    let mut ticker = interval(REAP_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut st = shared.state_write();
                let self_id = st.self_id.clone();
                let stale: Vec<String> = st
                    .nodes
                    .values()
                    .filter(|n| n.node_id != self_id)
                    .filter(|n| now.duration_since(n.last_heard) > timeout)
                    .map(|n| n.node_id.clone())
                    .collect();
                for node_id in stale {
                    if let Some(mut rec) = st.nodes.remove(&node_id) {
                        warn!(node = %node_id, "node failed (silent past timeout)");
                        rec.reap_time = node_reap;
                        st.failed_nodes.insert(node_id, rec);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn periodic_bulk_sync_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.bulk_sync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let networks: Vec<String> = {
                    let st = shared.state_read();
                    st.networks
                        .get(&st.self_id)
                        .map(|m| {
                            m.iter()
                                .filter(|(_, rec)| !rec.leaving)
                                .map(|(id, _)| id.clone())
                                .collect()
                        })
                        .unwrap_or_default()
                };
                for network_id in networks {
                    if let Err(e) = bulk_sync::sync_network(&shared, &network_id).await {
                        debug!(network = %network_id, error = %e, "periodic bulk sync failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Islands recovery: a node that finds itself alone while it still holds a
/// bootstrap list keeps re-attempting the join for a bounded window.
async fn rejoin_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.rejoin_cluster_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let bootstrap = {
                    let st = shared.state_read();
                    if st.nodes.len() > 1 || st.bootstrap.is_empty() {
                        continue;
                    }
                    st.bootstrap.clone()
                };
                info!("no active peers left, re-attempting cluster join");
                let deadline = Instant::now() + shared.config.rejoin_cluster_duration();
                while Instant::now() < deadline {
                    if let Err(e) = send_join(&shared, &bootstrap).await {
                        debug!(error = %e, "rejoin attempt failed");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(REJOIN_ATTEMPT_PAUSE) => {}
                        _ = shutdown.changed() => return,
                    }
                    if shared.state_read().nodes.len() > 1 {
                        info!("rejoined the cluster");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn stats_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.stats_print_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first report covers a full period.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let st = shared.state_read();
                info!(
                    active = st.nodes.len(),
                    failed = st.failed_nodes.len(),
                    left = st.left_nodes.len(),
                    "cluster membership"
                );
                if let Some(local) = st.networks.get(&st.self_id) {
                    for (network_id, rec) in local.iter() {
                        info!(
                            network = %network_id,
                            entries = rec.entries_count,
                            peers = st.network_nodes.get(network_id).map_or(0, Vec::len),
                            leaving = rec.leaving,
                            "network stats"
                        );
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
