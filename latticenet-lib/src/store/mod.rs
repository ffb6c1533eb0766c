//! Pluggable key-value persistence.
//!
//! The [`Store`] trait is the surface consumed by the persistence adapter;
//! concrete daemons sit behind it. [`MemoryStore`] is the in-process backend
//! used by default and in tests. [`DataStore`] layers object serialization,
//! a per-prefix list cache, and optimistic-concurrency retries on top.

mod datastore;
mod memory;

pub use datastore::{DataStore, KvObject};
pub use memory::MemoryStore;

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("key was modified by a concurrent writer")]
    KeyModified,

    #[error("key already exists")]
    KeyExists,

    #[error("previous k/v pair not specified")]
    PreviousNotSpecified,

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store backend: {0}")]
    Backend(String),
}

/// A value read from or written to the store, with the index the backend
/// assigned to that revision of the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub index: u64,
}

/// Persistence scope of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataScope {
    #[default]
    Local,
    Global,
}

impl fmt::Display for DataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataScope::Local => write!(f, "local"),
            DataScope::Global => write!(f, "global"),
        }
    }
}

/// Key-value backend. `atomic_*` operations implement compare-and-swap on the
/// pair's index and fail with [`StoreError::KeyModified`] when the
/// precondition no longer holds.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<KvPair, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn exists(&self, key: &str) -> Result<bool, StoreError>;
    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError>;
    /// Write `value` only if the key is still at `previous`; `None` means the
    /// key must not exist yet. Returns the stored pair with its new index.
    fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
    ) -> Result<KvPair, StoreError>;
    /// Delete the key only if it is still at `previous`.
    fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn close(&self) {}
}

/// Backends are often shared between adapters.
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<KvPair, StoreError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).put(key, value)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        (**self).list(prefix)
    }

    fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
    ) -> Result<KvPair, StoreError> {
        (**self).atomic_put(key, value, previous)
    }

    fn atomic_delete(&self, key: &str, previous: Option<&KvPair>) -> Result<(), StoreError> {
        (**self).atomic_delete(key, previous)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Root namespace under which every object key lives.
const ROOT_CHAIN: [&str; 3] = ["docker", "network", "v1.0"];

/// Join key path parts with `/`, appending a trailing `/`.
pub fn key(parts: &[&str]) -> String {
    let mut joined = parts.join("/");
    joined.push('/');
    joined
}

pub(crate) fn full_key(parts: &[String]) -> String {
    let mut all: Vec<&str> = ROOT_CHAIN.to_vec();
    all.extend(parts.iter().map(String::as_str));
    key(&all)
}
