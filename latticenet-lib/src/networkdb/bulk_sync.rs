//! Point-to-point full-state exchange between two peers.
//!
//! Bulk sync backstops gossip: periodically (and right after joining a
//! network) a node picks one peer sharing a network, ships its snapshot of
//! that network's entries over TCP, tombstones and their residual reap time
//! included, and applies the peer's snapshot in return. Conflicts resolve
//! exactly as they do for gossiped events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::message::{
    BulkSyncRequestMsg, BulkSyncResponseMsg, Message, TableEventKind, TableEventMsg, WireError,
    HEADER_LEN,
};
use super::{NetworkDbError, Shared};

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Sync one network with a peer. Candidates are ordered by their recent
/// failure count (shuffled within it); a failed attempt escalates to the next
/// candidate and bumps the peer's count, a success clears it.
pub(crate) async fn sync_network(
    shared: &Arc<Shared>,
    network_id: &str,
) -> Result<(), NetworkDbError> {
    let candidates: Vec<(String, SocketAddr)> = {
        let st = shared.state_read();
        let mut with_failures: Vec<(String, SocketAddr, u32)> = st
            .network_nodes
            .get(network_id)
            .into_iter()
            .flatten()
            .filter(|id| *id != &st.self_id)
            .filter(|id| {
                // Peers marked leaving are not sync candidates.
                !st.networks
                    .get(*id)
                    .and_then(|m| m.get(network_id))
                    .is_some_and(|r| r.leaving)
            })
            .filter_map(|id| {
                st.nodes.get(id).map(|n| {
                    (
                        id.clone(),
                        n.socket_addr(),
                        st.bulk_sync_failures.get(id).copied().unwrap_or(0),
                    )
                })
            })
            .collect();
        with_failures.shuffle(&mut rand::rng());
        with_failures.sort_by_key(|(_, _, failures)| *failures);
        with_failures
            .into_iter()
            .map(|(id, addr, _)| (id, addr))
            .collect()
    };
    if candidates.is_empty() {
        return Ok(());
    }
    for (node_id, addr) in candidates {
        match sync_with(shared, network_id, addr).await {
            Ok(()) => {
                shared.state_write().bulk_sync_failures.remove(&node_id);
                debug!(network = %network_id, peer = %node_id, "bulk sync complete");
                return Ok(());
            }
            Err(e) => {
                warn!(network = %network_id, peer = %node_id, %addr, error = %e, "bulk sync failed, escalating");
                *shared
                    .state_write()
                    .bulk_sync_failures
                    .entry(node_id)
                    .or_insert(0) += 1;
            }
        }
    }
    Err(NetworkDbError::BulkSyncFailed(network_id.to_string()))
}

async fn sync_with(
    shared: &Arc<Shared>,
    network_id: &str,
    addr: SocketAddr,
) -> Result<(), NetworkDbError> {
    let networks = vec![network_id.to_string()];
    let request = Message::BulkSyncRequest(BulkSyncRequestMsg {
        ltime: shared.state_read().network_clock.time(),
        node_id: shared.config.node_id.clone(),
        networks: networks.clone(),
        payload: snapshot_payload(shared, &networks)?,
    })
    .encode()?;

    let mut stream = timeout(SYNC_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| connect_timeout(addr))??;
    stream.write_all(&request).await?;
    let reply = timeout(SYNC_TIMEOUT, read_message(&mut stream))
        .await
        .map_err(|_| connect_timeout(addr))??;
    match reply {
        Message::BulkSyncResponse(resp) => {
            apply_payload(shared, &resp.payload);
            Ok(())
        }
        _ => Err(NetworkDbError::Io(std::io::Error::other(
            "unexpected bulk sync reply",
        ))),
    }
}

/// Serve one inbound bulk-sync connection: apply the peer's snapshot and
/// answer with our own for the requested networks.
pub(crate) async fn handle_connection(shared: Arc<Shared>, mut stream: TcpStream, peer: SocketAddr) {
    let request = match timeout(SYNC_TIMEOUT, read_message(&mut stream)).await {
        Ok(Ok(Message::BulkSyncRequest(req))) => req,
        Ok(Ok(_)) => {
            debug!(%peer, "unexpected message on bulk sync connection");
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "failed to read bulk sync request");
            return;
        }
        Err(_) => {
            debug!(%peer, "bulk sync request timed out");
            return;
        }
    };
    debug!(peer = %request.node_id, networks = ?request.networks, "serving bulk sync");
    apply_payload(&shared, &request.payload);
    let response = match snapshot_payload(&shared, &request.networks) {
        Ok(payload) => Message::BulkSyncResponse(BulkSyncResponseMsg {
            node_id: shared.config.node_id.clone(),
            payload,
        }),
        Err(e) => {
            debug!(%peer, error = %e, "failed to build bulk sync snapshot");
            return;
        }
    };
    match response.encode() {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                debug!(%peer, error = %e, "failed to send bulk sync response");
            }
        }
        Err(e) => debug!(%peer, error = %e, "failed to encode bulk sync response"),
    }
}

/// Snapshot every entry of the given networks as a compound of table-event
/// frames. Tombstones travel as deletes carrying their remaining reap time so
/// a late joiner keeps suppressing stale re-creates.
fn snapshot_payload(shared: &Arc<Shared>, networks: &[String]) -> Result<Vec<u8>, WireError> {
    let st = shared.state_read();
    let mut frames = Vec::new();
    for network_id in networks {
        let start = (network_id.clone(), String::new(), String::new());
        for ((n, t, k), _) in st
            .by_network
            .range(start..)
            .take_while(|((n, _, _), _)| n == network_id)
        {
            let Some(entry) = st.by_table.get(&(t.clone(), n.clone(), k.clone())) else {
                continue;
            };
            let kind = if entry.deleting {
                TableEventKind::Delete
            } else {
                TableEventKind::Create
            };
            frames.push(
                Message::TableEvent(TableEventMsg {
                    kind,
                    ltime: entry.ltime,
                    node_id: entry.node_id.clone(),
                    network_id: n.clone(),
                    table: t.clone(),
                    key: k.clone(),
                    value: entry.value.clone(),
                    residual_reap_secs: entry.reap_time.as_secs().min(u64::from(u32::MAX)) as u32,
                })
                .encode()?,
            );
        }
    }
    Message::Compound(frames).encode()
}

fn apply_payload(shared: &Arc<Shared>, payload: &[u8]) {
    let frames = match Message::decode(payload) {
        Ok(Message::Compound(frames)) => frames,
        Ok(_) => {
            debug!("bulk sync payload was not a compound");
            return;
        }
        Err(e) => {
            debug!(error = %e, "dropping undecodable bulk sync payload");
            return;
        }
    };
    let reap = shared.config.reap_entry_interval();
    let mut st = shared.state_write();
    for frame in frames {
        match Message::decode(&frame) {
            Ok(Message::TableEvent(ev)) => {
                st.apply_table_event(ev, reap);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "dropping undecodable bulk sync entry"),
        }
    }
}

async fn read_message(stream: &mut TcpStream) -> Result<Message, NetworkDbError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let body_len = Message::frame_body_len(&header)?;
    let mut frame = vec![0u8; HEADER_LEN + body_len];
    frame[..HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(Message::decode(&frame)?)
}

fn connect_timeout(addr: SocketAddr) -> NetworkDbError {
    NetworkDbError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("bulk sync with {addr} timed out"),
    ))
}
