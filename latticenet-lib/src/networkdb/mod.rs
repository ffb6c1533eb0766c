//! NetworkDB: gossip-based eventually-consistent replication of per-network
//! table entries across a cluster of peers.
//!
//! Each node gossips membership and table events over UDP, reconciles full
//! snapshots with one peer at a time over TCP (bulk sync), and garbage
//! collects tombstones and departed nodes on reap timers. Entries are ordered
//! by Lamport time; per key, at most one node writes at any point in time.

mod broadcast;
mod bulk_sync;
mod clock;
mod cluster;
pub mod config;
mod message;
mod watch;

pub use config::{load_from_path, NetworkDbConfig};
pub use message::WireError;
pub use watch::{EntryRecord, WatchEvent};

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use ahash::AHashMap;
use thiserror::Error;
use tokio::io;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch as tokio_watch};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use broadcast::BroadcastQueue;
use clock::LamportClock;
use message::{
    Message, NetworkEventKind, NetworkEventMsg, NodeEventKind, NodeEventMsg, TableEventKind,
    TableEventMsg,
};
use watch::{Subscriber, WATCH_QUEUE_LEN};

#[derive(Error, Debug)]
pub enum NetworkDbError {
    #[error("entry in table {table} network {network_id} key {key} already exists")]
    EntryExists { table: String, network_id: String, key: String },

    #[error("entry in table {table} network {network_id} key {key} not found")]
    EntryNotFound { table: String, network_id: String, key: String },

    #[error("network {0} is not joined")]
    NetworkNotJoined(String),

    #[error("network {0} already joined")]
    AlreadyJoined(String),

    #[error("bulk sync failed with every candidate for network {0}")]
    BulkSyncFailed(String),

    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A peer as seen through the membership tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: String,
    pub hostname: String,
    pub addr: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub(crate) struct NodeRecord {
    node_id: String,
    hostname: String,
    addr: IpAddr,
    port: u16,
    ltime: u64,
    /// Countdown before a failed or departed record is purged.
    reap_time: Duration,
    last_heard: Instant,
}

impl NodeRecord {
    fn from_event(ev: &NodeEventMsg) -> Self {
        Self {
            node_id: ev.node_id.clone(),
            hostname: ev.hostname.clone(),
            addr: ev.addr,
            port: ev.port,
            ltime: ev.ltime,
            reap_time: Duration::ZERO,
            last_heard: Instant::now(),
        }
    }

    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            addr: self.addr,
            port: self.port,
        }
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Membership intent of one node in one network. For the local node the
/// record also carries the network's table clock, its table-event broadcast
/// queue, and the entry counter.
pub(crate) struct NetworkRecord {
    ltime: u64,
    leaving: bool,
    reap_time: Duration,
    entries_count: u64,
    table_clock: Arc<LamportClock>,
    broadcasts: Arc<BroadcastQueue>,
}

impl NetworkRecord {
    fn new(ltime: u64) -> Self {
        Self {
            ltime,
            leaving: false,
            reap_time: Duration::ZERO,
            entries_count: 0,
            table_clock: Arc::new(LamportClock::default()),
            broadcasts: Arc::new(BroadcastQueue::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    ltime: u64,
    /// Owner. Per key only one owner exists at any point in time.
    node_id: String,
    value: Vec<u8>,
    deleting: bool,
    reap_time: Duration,
}

/// `(table, network_id, key)` for the primary index, `(network_id, table,
/// key)` for the secondary one.
type EntryKey = (String, String, String);

/// Everything behind the instance's reader-writer lock. The event-application
/// methods are pure state transitions so they can be exercised without a
/// transport.
pub(crate) struct State {
    self_id: String,
    network_clock: LamportClock,
    nodes: AHashMap<String, NodeRecord>,
    failed_nodes: AHashMap<String, NodeRecord>,
    left_nodes: AHashMap<String, NodeRecord>,
    /// node id → network id → record.
    networks: AHashMap<String, AHashMap<String, NetworkRecord>>,
    /// network id → peers believed to be in it.
    network_nodes: AHashMap<String, Vec<String>>,
    by_table: BTreeMap<EntryKey, Entry>,
    by_network: BTreeMap<EntryKey, ()>,
    watchers: Vec<Subscriber>,
    bootstrap: Vec<SocketAddr>,
    bulk_sync_failures: AHashMap<String, u32>,
}

impl State {
    fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            network_clock: LamportClock::default(),
            nodes: AHashMap::new(),
            failed_nodes: AHashMap::new(),
            left_nodes: AHashMap::new(),
            networks: AHashMap::new(),
            network_nodes: AHashMap::new(),
            by_table: BTreeMap::new(),
            by_network: BTreeMap::new(),
            watchers: Vec::new(),
            bootstrap: Vec::new(),
            bulk_sync_failures: AHashMap::new(),
        }
    }

    fn local_network(&self, network_id: &str) -> Option<&NetworkRecord> {
        self.networks.get(&self.self_id).and_then(|m| m.get(network_id))
    }

    fn bump_entries(&mut self, network_id: &str, delta: i64) {
        let self_id = self.self_id.clone();
        if let Some(rec) = self
            .networks
            .get_mut(&self_id)
            .and_then(|m| m.get_mut(network_id))
        {
            if delta >= 0 {
                rec.entries_count += delta as u64;
            } else {
                rec.entries_count = rec.entries_count.saturating_sub((-delta) as u64);
            }
        }
    }

    fn publish(&mut self, event: WatchEvent) {
        self.watchers.retain(|sub| {
            if !sub.matches(&event.record().table, &event.record().network_id) {
                return true;
            }
            sub.deliver(event.clone())
        });
    }

    /// Apply a table event received from a peer. Returns whether the event
    /// changed local state and should keep spreading.
    ///
    /// Resolution: an existing entry with greater-or-equal Lamport time wins;
    /// a delete becomes (or refreshes) a tombstone; the watch event published
    /// reflects the transition the local store observed, not the wire op.
    pub(crate) fn apply_table_event(
        &mut self,
        ev: TableEventMsg,
        reap_entry_interval: Duration,
    ) -> bool {
        if ev.node_id == self.self_id {
            return false;
        }
        match self.local_network(&ev.network_id) {
            Some(rec) if !rec.leaving => rec.table_clock.witness(ev.ltime),
            _ => return false,
        }
        let primary = (ev.table.clone(), ev.network_id.clone(), ev.key.clone());
        let prev = self.by_table.get(&primary).cloned();
        if let Some(p) = &prev {
            if p.ltime >= ev.ltime {
                return false;
            }
        }
        let deleting = ev.kind == TableEventKind::Delete;
        let reap_time = if deleting {
            if ev.residual_reap_secs > 0 {
                Duration::from_secs(u64::from(ev.residual_reap_secs))
            } else {
                reap_entry_interval
            }
        } else {
            Duration::ZERO
        };
        self.by_table.insert(
            primary,
            Entry {
                ltime: ev.ltime,
                node_id: ev.node_id.clone(),
                value: ev.value.clone(),
                deleting,
                reap_time,
            },
        );
        self.by_network
            .insert((ev.network_id.clone(), ev.table.clone(), ev.key.clone()), ());
        if prev.is_none() {
            let network_id = ev.network_id.clone();
            self.bump_entries(&network_id, 1);
        }

        let record = EntryRecord {
            table: ev.table,
            network_id: ev.network_id,
            key: ev.key,
            value: ev.value,
        };
        match (&prev, deleting) {
            // A delete for a never-seen key is stored silently.
            (None, true) => {}
            (None, false) => self.publish(WatchEvent::Create(record)),
            (Some(p), _) if p.deleting => {
                // Re-create after a delete; another delete only refreshes
                // the tombstone's reap timer.
                if !deleting {
                    self.publish(WatchEvent::Create(record));
                }
            }
            (Some(p), true) => {
                // Watchers see the value they last observed.
                let mut rec = record;
                rec.value = p.value.clone();
                self.publish(WatchEvent::Delete(rec));
            }
            (Some(_), false) => self.publish(WatchEvent::Update(record)),
        }
        true
    }

    /// Apply a peer's network join/leave. Returns whether state changed.
    pub(crate) fn apply_network_event(
        &mut self,
        ev: NetworkEventMsg,
        reap_interval: Duration,
    ) -> bool {
        self.network_clock.witness(ev.ltime);
        if ev.node_id == self.self_id {
            return false;
        }
        let records = self.networks.entry(ev.node_id.clone()).or_default();
        if let Some(existing) = records.get(&ev.network_id) {
            if existing.ltime >= ev.ltime {
                return false;
            }
        }
        match ev.kind {
            NetworkEventKind::Join => {
                records.insert(ev.network_id.clone(), NetworkRecord::new(ev.ltime));
                let members = self.network_nodes.entry(ev.network_id.clone()).or_default();
                if !members.contains(&ev.node_id) {
                    members.push(ev.node_id.clone());
                }
                debug!(node = %ev.node_id, network = %ev.network_id, "peer joined network");
            }
            NetworkEventKind::Leave => {
                let mut record = NetworkRecord::new(ev.ltime);
                record.leaving = true;
                record.reap_time = reap_interval;
                records.insert(ev.network_id.clone(), record);
                if let Some(members) = self.network_nodes.get_mut(&ev.network_id) {
                    members.retain(|id| id != &ev.node_id);
                }
                self.tombstone_node_entries(&ev.network_id, &ev.node_id, reap_interval);
                debug!(node = %ev.node_id, network = %ev.network_id, "peer left network");
            }
        }
        true
    }

    /// Apply a node join/leave. Returns whether state changed (and the event
    /// should keep spreading).
    pub(crate) fn apply_node_event(
        &mut self,
        ev: NodeEventMsg,
        node_reap_interval: Duration,
        entry_reap_interval: Duration,
    ) -> bool {
        self.network_clock.witness(ev.ltime);
        if ev.node_id == self.self_id {
            return false;
        }
        match ev.kind {
            NodeEventKind::Join => {
                self.purge_reincarnations(&ev, entry_reap_interval);
                if let Some(rec) = self.nodes.get_mut(&ev.node_id) {
                    rec.last_heard = Instant::now();
                    if ev.ltime > rec.ltime {
                        rec.ltime = ev.ltime;
                        rec.addr = ev.addr;
                        rec.port = ev.port;
                        rec.hostname = ev.hostname;
                    }
                    return false;
                }
                if let Some(mut rec) = self
                    .failed_nodes
                    .remove(&ev.node_id)
                    .or_else(|| self.left_nodes.remove(&ev.node_id))
                {
                    info!(node = %ev.node_id, "node rejoined the cluster");
                    rec.addr = ev.addr;
                    rec.port = ev.port;
                    rec.ltime = rec.ltime.max(ev.ltime);
                    rec.reap_time = Duration::ZERO;
                    rec.last_heard = Instant::now();
                    self.nodes.insert(ev.node_id, rec);
                    return true;
                }
                info!(node = %ev.node_id, addr = %ev.addr, port = ev.port, "node joined the cluster");
                self.nodes.insert(ev.node_id.clone(), NodeRecord::from_event(&ev));
                true
            }
            NodeEventKind::Leave => {
                let Some(mut rec) = self
                    .nodes
                    .remove(&ev.node_id)
                    .or_else(|| self.failed_nodes.remove(&ev.node_id))
                else {
                    return false;
                };
                info!(node = %ev.node_id, "node left the cluster");
                rec.ltime = rec.ltime.max(ev.ltime);
                rec.reap_time = node_reap_interval;
                self.left_nodes.insert(ev.node_id.clone(), rec);
                self.remove_node_from_networks(&ev.node_id, entry_reap_interval);
                true
            }
        }
    }

    /// A node joining at an address already held by another id is a
    /// reincarnation: the prior record is purged from every partition and its
    /// entries tombstoned so they cannot be resurrected.
    fn purge_reincarnations(&mut self, ev: &NodeEventMsg, entry_reap_interval: Duration) {
        let stale: Vec<String> = self
            .nodes
            .values()
            .chain(self.failed_nodes.values())
            .chain(self.left_nodes.values())
            .filter(|r| r.addr == ev.addr && r.port == ev.port && r.node_id != ev.node_id)
            .map(|r| r.node_id.clone())
            .collect();
        for old in stale {
            warn!(old = %old, new = %ev.node_id, addr = %ev.addr, "purging reincarnated node record");
            self.nodes.remove(&old);
            self.failed_nodes.remove(&old);
            self.left_nodes.remove(&old);
            self.remove_node_from_networks(&old, entry_reap_interval);
        }
    }

    fn remove_node_from_networks(&mut self, node_id: &str, entry_reap_interval: Duration) {
        if let Some(nets) = self.networks.remove(node_id) {
            for network_id in nets.keys() {
                if let Some(members) = self.network_nodes.get_mut(network_id) {
                    members.retain(|id| id != node_id);
                }
                self.tombstone_node_entries(network_id, node_id, entry_reap_interval);
            }
        }
        self.bulk_sync_failures.remove(node_id);
    }

    /// Tombstone every live entry a node owns in a network, publishing the
    /// deletions to watchers.
    fn tombstone_node_entries(&mut self, network_id: &str, node_id: &str, reap: Duration) {
        let start = (network_id.to_string(), String::new(), String::new());
        let keys: Vec<(String, String)> = self
            .by_network
            .range(start..)
            .take_while(|((n, _, _), _)| n == network_id)
            .map(|((_, t, k), _)| (t.clone(), k.clone()))
            .collect();
        for (table, key) in keys {
            let primary = (table.clone(), network_id.to_string(), key.clone());
            let Some(entry) = self.by_table.get_mut(&primary) else { continue };
            if entry.node_id != node_id || entry.deleting {
                continue;
            }
            entry.deleting = true;
            entry.reap_time = reap;
            let value = entry.value.clone();
            self.publish(WatchEvent::Delete(EntryRecord {
                table,
                network_id: network_id.to_string(),
                key,
                value,
            }));
        }
    }

    /// One garbage-collection tick: count down tombstones, failed/left nodes
    /// and leaving network records, removing whatever reached zero.
    pub(crate) fn reap_tick(&mut self, period: Duration) {
        let mut reaped: Vec<EntryKey> = Vec::new();
        for (key, entry) in self.by_table.iter_mut() {
            if !entry.deleting {
                continue;
            }
            entry.reap_time = entry.reap_time.saturating_sub(period);
            if entry.reap_time.is_zero() {
                reaped.push(key.clone());
            }
        }
        for (table, network_id, key) in reaped {
            self.by_table.remove(&(table.clone(), network_id.clone(), key.clone()));
            self.by_network.remove(&(network_id.clone(), table, key));
            self.bump_entries(&network_id, -1);
        }

        for partition in [&mut self.failed_nodes, &mut self.left_nodes] {
            partition.retain(|node_id, rec| {
                rec.reap_time = rec.reap_time.saturating_sub(period);
                if rec.reap_time.is_zero() {
                    debug!(node = %node_id, "reaped node record");
                    return false;
                }
                true
            });
        }

        let self_id = self.self_id.clone();
        let mut purged_local: Vec<String> = Vec::new();
        for (node_id, nets) in self.networks.iter_mut() {
            nets.retain(|network_id, rec| {
                if !rec.leaving {
                    return true;
                }
                rec.reap_time = rec.reap_time.saturating_sub(period);
                if rec.reap_time.is_zero() {
                    if *node_id == self_id {
                        purged_local.push(network_id.clone());
                    }
                    return false;
                }
                true
            });
        }
        self.networks.retain(|_, nets| !nets.is_empty());
        // Once the local leave completes, whatever is still stored for the
        // network goes with it.
        for network_id in purged_local {
            self.purge_network_entries(&network_id);
            self.network_nodes.remove(&network_id);
        }
    }

    fn purge_network_entries(&mut self, network_id: &str) {
        let start = (network_id.to_string(), String::new(), String::new());
        let keys: Vec<(String, String)> = self
            .by_network
            .range(start..)
            .take_while(|((n, _, _), _)| n == network_id)
            .map(|((_, t, k), _)| (t.clone(), k.clone()))
            .collect();
        for (table, key) in keys {
            self.by_table.remove(&(table.clone(), network_id.to_string(), key.clone()));
            self.by_network.remove(&(network_id.to_string(), table, key));
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: NetworkDbConfig,
    pub(crate) state: RwLock<State>,
    pub(crate) udp: UdpSocket,
    pub(crate) advertise: SocketAddr,
    pub(crate) shutdown_tx: tokio_watch::Sender<bool>,
    pub(crate) tracker: TaskTracker,
    /// Node and network events, gossiped cluster-wide.
    pub(crate) cluster_queue: BroadcastQueue,
    next_watch_id: AtomicU64,
}

impl Shared {
    pub(crate) fn state_read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state_write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The local node's alive event as gossiped to peers.
    pub(crate) fn self_node_event(&self, kind: NodeEventKind, ltime: u64, reply: bool) -> NodeEventMsg {
        NodeEventMsg {
            kind,
            ltime,
            node_id: self.config.node_id.clone(),
            hostname: self.config.hostname.clone(),
            addr: self.advertise.ip(),
            port: self.advertise.port(),
            reply_requested: reply,
        }
    }
}

/// Handle to one NetworkDB instance. Cheap to clone; [`NetworkDb::close`]
/// stops the background loops and waits for them to exit.
#[derive(Clone)]
pub struct NetworkDb {
    shared: Arc<Shared>,
}

impl NetworkDb {
    /// Bind the gossip transports and start the background loops.
    pub async fn new(config: NetworkDbConfig) -> Result<Self, NetworkDbError> {
        config.validate()?;
        let (udp, tcp) = bind_transport(config.bind_addr, config.bind_port).await?;
        let port = udp.local_addr()?.port();
        let mut advertise_ip = config.advertise_addr.unwrap_or(config.bind_addr);
        if advertise_ip.is_unspecified() {
            advertise_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        }
        let advertise = SocketAddr::new(advertise_ip, port);

        let mut state = State::new(&config.node_id);
        state.nodes.insert(
            config.node_id.clone(),
            NodeRecord {
                node_id: config.node_id.clone(),
                hostname: config.hostname.clone(),
                addr: advertise.ip(),
                port,
                ltime: 0,
                reap_time: Duration::ZERO,
                last_heard: Instant::now(),
            },
        );
        info!(node = %config.node_id, %advertise, "networkdb starting");

        let (shutdown_tx, _) = tokio_watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            state: RwLock::new(state),
            udp,
            advertise,
            shutdown_tx,
            tracker: TaskTracker::new(),
            cluster_queue: BroadcastQueue::default(),
            next_watch_id: AtomicU64::new(0),
        });
        cluster::spawn_loops(&shared, tcp);
        Ok(Self { shared })
    }

    /// The address peers should be pointed at to join this node.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.shared.advertise
    }

    pub fn node_id(&self) -> &str {
        &self.shared.config.node_id
    }

    /// Join a cluster through the given members. The list is kept as the
    /// bootstrap set for islands recovery.
    pub async fn join(&self, members: &[SocketAddr]) -> Result<(), NetworkDbError> {
        self.shared.state_write().bootstrap = members.to_vec();
        cluster::send_join(&self.shared, members).await
    }

    /// Broadcast a clean leave, stop every background loop and wait for them.
    pub async fn close(&self) {
        if let Err(e) = cluster::send_leave(&self.shared).await {
            debug!(error = %e, "leave broadcast failed");
        }
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!(node = %self.shared.config.node_id, "networkdb closed");
    }

    /// Declare this node a member of `network_id` and sync state with a peer
    /// already in it.
    pub async fn join_network(&self, network_id: &str) -> Result<(), NetworkDbError> {
        let frame = {
            let mut st = self.shared.state_write();
            let self_id = st.self_id.clone();
            let ltime = st.network_clock.increment();
            let records = st.networks.entry(self_id.clone()).or_default();
            if records.get(network_id).is_some_and(|r| !r.leaving) {
                return Err(NetworkDbError::AlreadyJoined(network_id.to_string()));
            }
            records.insert(network_id.to_string(), NetworkRecord::new(ltime));
            Message::NetworkEvent(NetworkEventMsg {
                kind: NetworkEventKind::Join,
                ltime,
                node_id: self_id,
                network_id: network_id.to_string(),
            })
            .encode()?
        };
        self.shared.cluster_queue.queue(frame);
        info!(network = %network_id, "joined network");
        if let Err(e) = bulk_sync::sync_network(&self.shared, network_id).await {
            debug!(network = %network_id, error = %e, "initial bulk sync failed");
        }
        Ok(())
    }

    /// Leave `network_id`: the local record turns leaving until reaped and
    /// every entry this node owns in the network is tombstoned.
    pub fn leave_network(&self, network_id: &str) -> Result<(), NetworkDbError> {
        let reap = self.shared.config.reap_entry_interval();
        let frame = {
            let mut st = self.shared.state_write();
            let self_id = st.self_id.clone();
            let ltime = st.network_clock.increment();
            let Some(rec) = st
                .networks
                .get_mut(&self_id)
                .and_then(|m| m.get_mut(network_id))
                .filter(|r| !r.leaving)
            else {
                return Err(NetworkDbError::NetworkNotJoined(network_id.to_string()));
            };
            rec.ltime = ltime;
            rec.leaving = true;
            rec.reap_time = reap;
            st.tombstone_node_entries(network_id, &self_id, reap);
            Message::NetworkEvent(NetworkEventMsg {
                kind: NetworkEventKind::Leave,
                ltime,
                node_id: self_id,
                network_id: network_id.to_string(),
            })
            .encode()?
        };
        self.shared.cluster_queue.queue(frame);
        info!(network = %network_id, "left network");
        Ok(())
    }

    /// Create an entry this node owns. Fails if a live entry already exists
    /// under the key, wherever it is owned.
    pub fn create_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), NetworkDbError> {
        self.local_table_event(TableEventKind::Create, table, network_id, key, Some(value))
    }

    /// Update an entry. The entry must exist and not be tombstoned.
    pub fn update_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), NetworkDbError> {
        self.local_table_event(TableEventKind::Update, table, network_id, key, Some(value))
    }

    /// Tombstone an entry. The entry must exist and not already be deleted.
    pub fn delete_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
    ) -> Result<(), NetworkDbError> {
        self.local_table_event(TableEventKind::Delete, table, network_id, key, None)
    }

    /// Read an entry's value. Tombstoned entries read as not found.
    pub fn get_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
    ) -> Result<Vec<u8>, NetworkDbError> {
        let st = self.shared.state_read();
        let entry = st
            .by_table
            .get(&(table.to_string(), network_id.to_string(), key.to_string()))
            .filter(|e| !e.deleting)
            .ok_or_else(|| NetworkDbError::EntryNotFound {
                table: table.to_string(),
                network_id: network_id.to_string(),
                key: key.to_string(),
            })?;
        Ok(entry.value.clone())
    }

    /// Live `(key, value)` pairs of one table in one network.
    pub fn table_entries(&self, table: &str, network_id: &str) -> Vec<(String, Vec<u8>)> {
        let st = self.shared.state_read();
        let start = (table.to_string(), network_id.to_string(), String::new());
        st.by_table
            .range(start..)
            .take_while(|((t, n, _), _)| t == table && n == network_id)
            .filter(|(_, e)| !e.deleting)
            .map(|((_, _, k), e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Number of entries stored for a network, tombstones included.
    pub fn network_entry_count(&self, network_id: &str) -> u64 {
        let st = self.shared.state_read();
        if let Some(rec) = st.local_network(network_id) {
            return rec.entries_count;
        }
        let start = (network_id.to_string(), String::new(), String::new());
        st.by_network
            .range(start..)
            .take_while(|((n, _, _), _)| n == network_id)
            .count() as u64
    }

    /// Active cluster members, this node included.
    pub fn cluster_peers(&self) -> Vec<PeerInfo> {
        let st = self.shared.state_read();
        st.nodes.values().map(NodeRecord::peer_info).collect()
    }

    /// Peers believed to be in a network.
    pub fn network_peers(&self, network_id: &str) -> Vec<PeerInfo> {
        let st = self.shared.state_read();
        st.network_nodes
            .get(network_id)
            .into_iter()
            .flatten()
            .filter_map(|id| st.nodes.get(id))
            .map(NodeRecord::peer_info)
            .collect()
    }

    /// Subscribe to entry events, optionally filtered by table and network.
    ///
    /// The channel first delivers synthetic `Create` events for every
    /// currently stored entry not owned by this node and matching the
    /// filters, then live events in local apply order. Dropping the returned
    /// [`WatchCancel`] detaches the subscriber and closes the channel.
    pub fn watch(
        &self,
        table: Option<&str>,
        network_id: Option<&str>,
    ) -> (mpsc::Receiver<WatchEvent>, WatchCancel) {
        let mut st = self.shared.state_write();
        let mut snapshot = Vec::new();
        for ((t, n, k), e) in st.by_table.iter() {
            if e.deleting || e.node_id == st.self_id {
                continue;
            }
            if table.is_some_and(|f| f != t.as_str()) || network_id.is_some_and(|f| f != n.as_str()) {
                continue;
            }
            snapshot.push(WatchEvent::Create(EntryRecord {
                table: t.clone(),
                network_id: n.clone(),
                key: k.clone(),
                value: e.value.clone(),
            }));
        }
        let (tx, rx) = mpsc::channel(snapshot.len() + WATCH_QUEUE_LEN);
        for event in snapshot {
            let _ = tx.try_send(event);
        }
        let id = self.shared.next_watch_id.fetch_add(1, Ordering::Relaxed) + 1;
        st.watchers.push(Subscriber {
            id,
            table: table.map(str::to_string),
            network: network_id.map(str::to_string),
            tx,
        });
        (rx, WatchCancel { id, shared: Arc::downgrade(&self.shared) })
    }

    fn local_table_event(
        &self,
        kind: TableEventKind,
        table: &str,
        network_id: &str,
        key: &str,
        value: Option<Vec<u8>>,
    ) -> Result<(), NetworkDbError> {
        let mut st = self.shared.state_write();
        let self_id = st.self_id.clone();
        let (clock, queue) = match st.local_network(network_id).filter(|r| !r.leaving) {
            Some(rec) => (rec.table_clock.clone(), rec.broadcasts.clone()),
            None => return Err(NetworkDbError::NetworkNotJoined(network_id.to_string())),
        };
        let primary = (table.to_string(), network_id.to_string(), key.to_string());
        let existing = st.by_table.get(&primary).cloned();
        let not_found = || NetworkDbError::EntryNotFound {
            table: table.to_string(),
            network_id: network_id.to_string(),
            key: key.to_string(),
        };
        match kind {
            TableEventKind::Create => {
                if existing.as_ref().is_some_and(|e| !e.deleting) {
                    return Err(NetworkDbError::EntryExists {
                        table: table.to_string(),
                        network_id: network_id.to_string(),
                        key: key.to_string(),
                    });
                }
            }
            TableEventKind::Update | TableEventKind::Delete => {
                if !existing.as_ref().is_some_and(|e| !e.deleting) {
                    return Err(not_found());
                }
            }
        }
        let deleting = kind == TableEventKind::Delete;
        let value = match (&value, &existing) {
            // A delete keeps the last value so watchers (local and remote)
            // can relay it.
            (None, Some(e)) => e.value.clone(),
            (None, None) => Vec::new(),
            (Some(v), _) => v.clone(),
        };
        let ltime = clock.increment();
        let reap = self.shared.config.reap_entry_interval();
        st.by_table.insert(
            primary,
            Entry {
                ltime,
                node_id: self_id.clone(),
                value: value.clone(),
                deleting,
                reap_time: if deleting { reap } else { Duration::ZERO },
            },
        );
        st.by_network
            .insert((network_id.to_string(), table.to_string(), key.to_string()), ());
        if existing.is_none() {
            st.bump_entries(network_id, 1);
        }
        let record = EntryRecord {
            table: table.to_string(),
            network_id: network_id.to_string(),
            key: key.to_string(),
            value: value.clone(),
        };
        let watch_event = match kind {
            TableEventKind::Create => WatchEvent::Create(record),
            TableEventKind::Update => WatchEvent::Update(record),
            TableEventKind::Delete => WatchEvent::Delete(record),
        };
        st.publish(watch_event);
        drop(st);

        let frame = Message::TableEvent(TableEventMsg {
            kind,
            ltime,
            node_id: self_id,
            network_id: network_id.to_string(),
            table: table.to_string(),
            key: key.to_string(),
            value,
            residual_reap_secs: 0,
        })
        .encode()?;
        queue.queue(frame);
        Ok(())
    }
}

/// Detaches its watch subscriber when dropped.
pub struct WatchCancel {
    id: u64,
    shared: Weak<Shared>,
}

impl WatchCancel {
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for WatchCancel {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state_write().watchers.retain(|s| s.id != self.id);
        }
    }
}

/// Bind the UDP gossip socket and the TCP bulk-sync listener on the same
/// port. With an OS-assigned port the pair is retried until a port free for
/// both transports is found.
async fn bind_transport(addr: IpAddr, port: u16) -> Result<(UdpSocket, TcpListener), io::Error> {
    if port != 0 {
        let udp = UdpSocket::bind((addr, port)).await?;
        let tcp = TcpListener::bind((addr, port)).await?;
        return Ok((udp, tcp));
    }
    for _ in 0..10 {
        let udp = UdpSocket::bind((addr, 0)).await?;
        let chosen = udp.local_addr()?.port();
        if let Ok(tcp) = TcpListener::bind((addr, chosen)).await {
            return Ok((udp, tcp));
        }
    }
    Err(io::Error::other("no port free for both udp and tcp"))
}
