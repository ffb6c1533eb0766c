//! The default pool allocator.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bitmap::{Bitmap, BitmapError};
use crate::ipam::pool::{
    address_at, host_id, nets_overlap, num_addresses, subnet_range, PoolData,
};
use crate::ipam::{
    predefined_global_scope_networks, predefined_local_scope_networks, IpamError, PoolId,
    ALLOC_SERIAL_PREFIX, GLOBAL_ADDRESS_SPACE, LOCAL_ADDRESS_SPACE,
};
use crate::store::{DataStore, KvObject, StoreError};

/// One named address space: its master pools and the rotation state for
/// predefined-pool selection. Only the pool table is persisted; the
/// predefined list and cursor are re-derived from configuration on restart.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct AddrSpace {
    #[serde(skip)]
    name: String,
    subnets: BTreeMap<IpNet, PoolData>,
    #[serde(skip)]
    predefined: Vec<IpNet>,
    #[serde(skip)]
    predefined_start_index: usize,
    #[serde(skip)]
    db_index: u64,
}

impl AddrSpace {
    fn new(name: &str, predefined: Vec<IpNet>) -> Self {
        Self {
            name: name.to_string(),
            subnets: BTreeMap::new(),
            predefined,
            predefined_start_index: 0,
            db_index: 0,
        }
    }

    /// Rotate through the predefined list, skipping candidates of the wrong
    /// family or overlapping an allocated master. Each hit advances the
    /// cursor past the chosen pool so consecutive requests spread out.
    fn next_predefined(&mut self, v6: bool) -> Result<IpNet, IpamError> {
        let len = self.predefined.len();
        if len == 0 {
            return Err(IpamError::NoAvailablePool);
        }
        let start = self.predefined_start_index % len;
        for offset in 0..len {
            let i = (start + offset) % len;
            let candidate = self.predefined[i];
            if matches!(candidate, IpNet::V6(_)) != v6 {
                continue;
            }
            if self.subnets.keys().any(|m| nets_overlap(m, &candidate)) {
                continue;
            }
            self.predefined_start_index = (i + 1) % len;
            return Ok(candidate);
        }
        Err(IpamError::NoAvailablePool)
    }

    fn install_master(&mut self, pool: IpNet, auto_release: bool) -> Result<(), IpamError> {
        let total = num_addresses(&pool);
        let mut addrs = Bitmap::new(total);
        // The network and broadcast addresses of IPv4 pools wider than /31
        // are never handed out.
        if matches!(pool, IpNet::V4(_)) && pool.prefix_len() < 31 {
            addrs.set(0)?;
            addrs.set(total - 1)?;
        }
        self.subnets
            .insert(pool, PoolData { pool, addrs, children: Default::default(), auto_release });
        Ok(())
    }
}

impl KvObject for AddrSpace {
    fn key(&self) -> Vec<String> {
        vec!["ipam".to_string(), self.name.clone()]
    }

    fn key_prefix(&self) -> Vec<String> {
        vec!["ipam".to_string()]
    }

    fn value(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn set_value(&mut self, value: &[u8]) -> Result<(), StoreError> {
        let loaded: AddrSpace = serde_json::from_slice(value)?;
        self.subnets = loaded.subnets;
        for data in self.subnets.values_mut() {
            if data.addrs.check_consistency() {
                warn!(pool = %data.pool, "repaired inconsistent bitmap loaded from store");
            }
        }
        Ok(())
    }

    fn index(&self) -> u64 {
        self.db_index
    }

    fn set_index(&mut self, index: u64) {
        self.db_index = index;
    }
}

/// Pool allocator over a fixed set of address spaces. All operations on one
/// space serialize behind that space's mutex; when a store is attached, every
/// mutation is written through it with optimistic-concurrency retries.
pub struct Allocator {
    spaces: HashMap<String, Mutex<AddrSpace>>,
    store: Option<Arc<DataStore>>,
}

impl Allocator {
    /// Allocator with the stock predefined pools for the two well-known
    /// address spaces.
    pub fn new() -> Self {
        Self::with_predefined(
            predefined_local_scope_networks(),
            predefined_global_scope_networks(),
        )
    }

    /// Allocator with caller-supplied predefined pool lists.
    pub fn with_predefined(local: Vec<IpNet>, global: Vec<IpNet>) -> Self {
        let mut spaces = HashMap::new();
        spaces.insert(
            LOCAL_ADDRESS_SPACE.to_string(),
            Mutex::new(AddrSpace::new(LOCAL_ADDRESS_SPACE, local)),
        );
        spaces.insert(
            GLOBAL_ADDRESS_SPACE.to_string(),
            Mutex::new(AddrSpace::new(GLOBAL_ADDRESS_SPACE, global)),
        );
        Self { spaces, store: None }
    }

    /// Attach a datastore and load any previously persisted pool state.
    pub fn with_store(mut self, store: Arc<DataStore>) -> Result<Self, IpamError> {
        for (name, cell) in &self.spaces {
            let mut space = lock(cell);
            match store.get_object(&mut *space) {
                Ok(()) => info!(space = %name, pools = space.subnets.len(), "loaded ipam state"),
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store = Some(store);
        Ok(self)
    }

    /// Carve out a pool. With no `pool` given, the next predefined pool of
    /// the requested family is chosen. With a `sub_pool`, the master is
    /// created implicitly if needed and the child attached to it; a child at
    /// least as wide as its master is clamped to equal the master.
    ///
    /// Returns the pool id and the canonical master CIDR.
    pub fn request_pool(
        &self,
        address_space: &str,
        pool: Option<IpNet>,
        sub_pool: Option<IpNet>,
        v6: bool,
    ) -> Result<(PoolId, IpNet), IpamError> {
        let requested = match pool {
            None => {
                if sub_pool.is_some() {
                    return Err(IpamError::InvalidSubPool(
                        "sub pool requires an explicit pool".to_string(),
                    ));
                }
                return self.mutate_space(address_space, |space| {
                    let candidate = space.next_predefined(v6)?;
                    space.install_master(candidate, false)?;
                    debug!(space = %address_space, pool = %candidate, "allocated predefined pool");
                    Ok((PoolId::new(address_space, candidate, None), candidate))
                });
            }
            Some(p) => p.trunc(),
        };
        let child = match sub_pool {
            None => None,
            Some(sp) => {
                let mut child = sp.trunc();
                if matches!(child, IpNet::V6(_)) != matches!(requested, IpNet::V6(_)) {
                    return Err(IpamError::InvalidSubPool(
                        "address family differs from the pool".to_string(),
                    ));
                }
                if child.prefix_len() <= requested.prefix_len() {
                    child = requested;
                } else if !requested.contains(&child) {
                    return Err(IpamError::InvalidSubPool(format!(
                        "{child} is not contained in {requested}"
                    )));
                }
                Some(child)
            }
        };
        self.mutate_space(address_space, move |space| {
            if space
                .subnets
                .keys()
                .any(|m| *m != requested && nets_overlap(m, &requested))
            {
                return Err(IpamError::PoolOverlap);
            }
            match (space.subnets.contains_key(&requested), child) {
                (false, None) => {
                    space.install_master(requested, false)?;
                }
                (false, Some(c)) => {
                    space.install_master(requested, true)?;
                    if let Some(data) = space.subnets.get_mut(&requested) {
                        data.children.insert(c);
                    }
                }
                (true, None) => return Err(IpamError::PoolOverlap),
                (true, Some(c)) => {
                    let data = space
                        .subnets
                        .get_mut(&requested)
                        .ok_or(IpamError::PoolOverlap)?;
                    if !data.children.insert(c) {
                        return Err(IpamError::PoolOverlap);
                    }
                }
            }
            Ok((PoolId::new(address_space, requested, child), requested))
        })
    }

    /// Release a pool. Releasing a child detaches it and deletes an
    /// auto-created master once childless; releasing a master with children
    /// still attached defers the deletion until the last child goes away.
    pub fn release_pool(&self, id: &PoolId) -> Result<(), IpamError> {
        self.mutate_space(id.address_space(), |space| {
            let subnet = id.subnet();
            let data = space
                .subnets
                .get_mut(&subnet)
                .ok_or_else(|| IpamError::PoolNotFound(id.to_string()))?;
            match id.child_subnet() {
                Some(child) => {
                    if !data.children.remove(&child) {
                        return Err(IpamError::PoolNotFound(id.to_string()));
                    }
                    if data.children.is_empty() && data.auto_release {
                        space.subnets.remove(&subnet);
                    }
                }
                None => {
                    if data.children.is_empty() {
                        space.subnets.remove(&subnet);
                    } else {
                        data.auto_release = true;
                    }
                }
            }
            Ok(())
        })
    }

    /// Allocate one address from the pool. A preferred address must fall in
    /// the pool (or its sub-pool) and be free. `options` may carry
    /// [`ALLOC_SERIAL_PREFIX`].
    pub fn request_address(
        &self,
        id: &PoolId,
        preferred: Option<IpAddr>,
        options: &HashMap<String, String>,
    ) -> Result<IpAddr, IpamError> {
        let serial = options
            .get(ALLOC_SERIAL_PREFIX)
            .is_some_and(|v| v == "true");
        self.mutate_space(id.address_space(), move |space| {
            let data = Self::pool_data(space, id)?;
            let master = data.pool;
            let ordinal = match preferred {
                Some(ip) => {
                    let scope = id.child_subnet().unwrap_or(master);
                    if !scope.contains(&ip) {
                        return Err(IpamError::IpOutOfRange);
                    }
                    let ordinal = host_id(&ip, master.prefix_len());
                    match data.addrs.set(ordinal) {
                        Ok(()) => ordinal,
                        Err(BitmapError::BitAllocated) => {
                            return Err(IpamError::IpAlreadyAllocated)
                        }
                        Err(BitmapError::InvalidOrdinal(_)) => {
                            return Err(IpamError::IpOutOfRange)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None => {
                    let result = match id.child_subnet() {
                        None => data.addrs.set_any(serial),
                        Some(child) => {
                            let (start, end) = subnet_range(&master, &child);
                            data.addrs.set_any_in_range(start, end, serial)
                        }
                    };
                    match result {
                        Ok(ordinal) => ordinal,
                        Err(BitmapError::NoBitAvailable) => {
                            return Err(IpamError::NoAvailableIps)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            Ok(address_at(&master, ordinal))
        })
    }

    /// Release one address back to the pool. Fails if the address was not
    /// allocated.
    pub fn release_address(&self, id: &PoolId, address: IpAddr) -> Result<(), IpamError> {
        self.mutate_space(id.address_space(), move |space| {
            let data = Self::pool_data(space, id)?;
            let master = data.pool;
            let scope = id.child_subnet().unwrap_or(master);
            if !scope.contains(&address) {
                return Err(IpamError::IpOutOfRange);
            }
            let ordinal = host_id(&address, master.prefix_len());
            if !data.addrs.is_set(ordinal) {
                return Err(IpamError::AddressNotAllocated(address));
            }
            data.addrs.unset(ordinal)?;
            Ok(())
        })
    }

    fn pool_data<'a>(
        space: &'a mut AddrSpace,
        id: &PoolId,
    ) -> Result<&'a mut PoolData, IpamError> {
        let data = space
            .subnets
            .get_mut(&id.subnet())
            .ok_or_else(|| IpamError::PoolNotFound(id.to_string()))?;
        if let Some(child) = id.child_subnet() {
            if !data.children.contains(&child) {
                return Err(IpamError::PoolNotFound(id.to_string()));
            }
        }
        Ok(data)
    }

    /// Run `mutate` against a copy of the space and commit the copy, writing
    /// it through the store when one is attached. A concurrent store write
    /// reloads the live state and replays the mutation.
    fn mutate_space<R>(
        &self,
        name: &str,
        mutate: impl Fn(&mut AddrSpace) -> Result<R, IpamError>,
    ) -> Result<R, IpamError> {
        let cell = self
            .spaces
            .get(name)
            .ok_or_else(|| IpamError::InvalidAddressSpace(name.to_string()))?;
        let mut live = lock(cell);
        loop {
            let mut copy = live.clone();
            let out = mutate(&mut copy)?;
            if let Some(store) = &self.store {
                match store.put_object_atomic(&mut copy) {
                    Ok(()) => {}
                    Err(StoreError::KeyModified) => {
                        debug!(space = %name, "ipam state changed concurrently, retrying");
                        store.get_object(&mut *live)?;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            *live = copy;
            return Ok(out);
        }
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(cell: &Mutex<AddrSpace>) -> MutexGuard<'_, AddrSpace> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}
