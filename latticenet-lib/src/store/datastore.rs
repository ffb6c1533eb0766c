//! Persistence adapter: object load/store with optimistic concurrency.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{full_key, DataScope, KvPair, Store, StoreError};

/// An object the adapter can persist. Implementations serialize themselves in
/// `value` and restore from `set_value`; the index tracks the last revision
/// observed in the store and doubles as the existence marker (a zero index
/// means the object was never written).
pub trait KvObject: Clone {
    /// Path parts of the object's key, relative to the root namespace.
    fn key(&self) -> Vec<String>;
    /// Path parts of the parent prefix the object is listed under.
    fn key_prefix(&self) -> Vec<String>;
    fn value(&self) -> Result<Vec<u8>, StoreError>;
    fn set_value(&mut self, value: &[u8]) -> Result<(), StoreError>;
    fn index(&self) -> u64;
    fn set_index(&mut self, index: u64);
    fn exists(&self) -> bool {
        self.index() > 0
    }
    fn data_scope(&self) -> DataScope {
        DataScope::Local
    }
    /// Objects that opt out of persistence entirely.
    fn skip(&self) -> bool {
        false
    }
}

/// Adapter over a [`Store`] backend. Caches listed prefixes so repeated
/// lookups do not hit the backend with range queries, and keeps the cache
/// coherent across its own writes.
pub struct DataStore {
    backend: Box<dyn Store>,
    cache: Mutex<HashMap<String, HashMap<String, KvPair>>>,
}

impl DataStore {
    pub fn new(backend: Box<dyn Store>) -> Self {
        Self { backend, cache: Mutex::new(HashMap::new()) }
    }

    /// Read the object's current value from the store, updating its in-memory
    /// index.
    pub fn get_object<O: KvObject>(&self, object: &mut O) -> Result<(), StoreError> {
        let key = full_key(&object.key());
        let pair = self.backend.get(&key)?;
        object.set_value(&pair.value)?;
        object.set_index(pair.index);
        let mut cache = self.lock_cache();
        for (prefix, entries) in cache.iter_mut() {
            if key.starts_with(prefix.as_str()) {
                entries.insert(key.clone(), pair.clone());
            }
        }
        Ok(())
    }

    /// CAS-write the object at its last-known index. On success the object's
    /// index is advanced to the stored revision; on a concurrent modification
    /// the caller re-reads and retries.
    pub fn put_object_atomic<O: KvObject>(&self, object: &mut O) -> Result<(), StoreError> {
        if object.skip() {
            return Ok(());
        }
        let key = full_key(&object.key());
        let value = object.value()?;
        let previous = if object.exists() {
            Some(KvPair { key: key.clone(), value: Vec::new(), index: object.index() })
        } else {
            None
        };
        match self.backend.atomic_put(&key, &value, previous.as_ref()) {
            Ok(pair) => {
                object.set_index(pair.index);
                let mut cache = self.lock_cache();
                for (prefix, entries) in cache.iter_mut() {
                    if key.starts_with(prefix.as_str()) {
                        entries.insert(key.clone(), pair.clone());
                    }
                }
                Ok(())
            }
            // A create that lost to a concurrent create is a CAS failure too.
            Err(StoreError::KeyExists) => Err(StoreError::KeyModified),
            Err(e) => Err(e),
        }
    }

    /// CAS-delete the object at its last-known index.
    pub fn delete_object_atomic<O: KvObject>(&self, object: &O) -> Result<(), StoreError> {
        let key = full_key(&object.key());
        let previous = KvPair { key: key.clone(), value: Vec::new(), index: object.index() };
        self.backend.atomic_delete(&key, Some(&previous))?;
        let mut cache = self.lock_cache();
        for entries in cache.values_mut() {
            entries.remove(&key);
        }
        Ok(())
    }

    /// List every pair under a prefix. The first call per prefix hits the
    /// backend; later calls are served from the cache.
    pub fn list_objects(&self, prefix_parts: &[&str]) -> Result<Vec<KvPair>, StoreError> {
        let parts: Vec<String> = prefix_parts.iter().map(|s| s.to_string()).collect();
        let prefix = full_key(&parts);
        {
            let cache = self.lock_cache();
            if let Some(entries) = cache.get(&prefix) {
                return Ok(entries.values().cloned().collect());
            }
        }
        debug!(%prefix, "listing store prefix");
        let pairs = self.backend.list(&prefix)?;
        let mut cache = self.lock_cache();
        cache.insert(
            prefix,
            pairs.iter().map(|p| (p.key.clone(), p.clone())).collect(),
        );
        Ok(pairs)
    }

    /// Apply `mutate` to the object under the store's optimistic-concurrency
    /// protocol: mutate a copy, CAS it in, and on a conflict re-read the live
    /// object and retry. The copy is installed only after the write sticks.
    pub fn update<O, F>(&self, live: &mut O, mutate: F) -> Result<(), StoreError>
    where
        O: KvObject,
        F: Fn(&mut O) -> Result<(), StoreError>,
    {
        loop {
            let mut copy = live.clone();
            mutate(&mut copy)?;
            match self.put_object_atomic(&mut copy) {
                Ok(()) => {
                    *live = copy;
                    return Ok(());
                }
                Err(StoreError::KeyModified) => {
                    debug!("concurrent store write detected, retrying");
                    self.get_object(live)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, KvPair>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
