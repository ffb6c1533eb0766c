//! Index-versioned in-memory key-value backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{KvPair, Store, StoreError};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    index: u64,
}

/// In-process [`Store`]. Every successful write bumps a store-wide index
/// counter, giving each key revision a unique version for CAS comparisons.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredValue>>,
    next_index: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<KvPair, StoreError> {
        let entries = self.lock();
        let stored = entries.get(key).ok_or(StoreError::NotFound)?;
        Ok(KvPair { key: key.to_string(), value: stored.value.clone(), index: stored.index })
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let index = self.bump_index();
        self.lock()
            .insert(key.to_string(), StoredValue { value: value.to_vec(), index });
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let entries = self.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair { key: k.clone(), value: v.value.clone(), index: v.index })
            .collect())
    }

    fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
    ) -> Result<KvPair, StoreError> {
        let mut entries = self.lock();
        match (entries.get(key), previous) {
            (Some(_), None) => return Err(StoreError::KeyExists),
            (Some(cur), Some(prev)) if cur.index != prev.index => {
                return Err(StoreError::KeyModified)
            }
            (None, Some(_)) => return Err(StoreError::KeyModified),
            _ => {}
        }
        let index = self.bump_index();
        entries.insert(key.to_string(), StoredValue { value: value.to_vec(), index });
        Ok(KvPair { key: key.to_string(), value: value.to_vec(), index })
    }

    fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<(), StoreError> {
        let prev = previous.ok_or(StoreError::PreviousNotSpecified)?;
        let mut entries = self.lock();
        let cur = entries.get(key).ok_or(StoreError::NotFound)?;
        if cur.index != prev.index {
            return Err(StoreError::KeyModified);
        }
        entries.remove(key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key).map(|_| ()).ok_or(StoreError::NotFound)
    }
}
