use std::sync::Arc;

use latticenet_lib::store::{key, DataStore, KvObject, MemoryStore, Store, StoreError};

#[derive(Clone, Debug, PartialEq)]
struct Membership {
    network: String,
    members: Vec<String>,
    db_index: u64,
}

impl Membership {
    fn new(network: &str) -> Self {
        Self { network: network.to_string(), members: Vec::new(), db_index: 0 }
    }
}

impl KvObject for Membership {
    fn key(&self) -> Vec<String> {
        vec!["network".to_string(), self.network.clone()]
    }

    fn key_prefix(&self) -> Vec<String> {
        vec!["network".to_string()]
    }

    fn value(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(&self.members)?)
    }

    fn set_value(&mut self, value: &[u8]) -> Result<(), StoreError> {
        self.members = serde_json::from_slice(value)?;
        Ok(())
    }

    fn index(&self) -> u64 {
        self.db_index
    }

    fn set_index(&mut self, index: u64) {
        self.db_index = index;
    }
}

#[test]
fn key_utility_appends_trailing_slash() {
    assert_eq!(key(&["docker", "network", "v1.0", "ipam"]), "docker/network/v1.0/ipam/");
}

#[test]
fn two_adapters_converge_through_cas_retries() {
    let backend = Arc::new(MemoryStore::new());
    let left = DataStore::new(Box::new(backend.clone()));
    let right = DataStore::new(Box::new(backend));

    let mut on_left = Membership::new("overlay");
    left.put_object_atomic(&mut on_left).unwrap();

    let mut on_right = Membership::new("overlay");
    right.get_object(&mut on_right).unwrap();

    left.update(&mut on_left, |m| {
        m.members.push("node-a".to_string());
        Ok(())
    })
    .unwrap();

    // The right handle is now stale; its update retries past the conflict
    // and lands on top of the left one's write.
    right
        .update(&mut on_right, |m| {
            m.members.push("node-b".to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(on_right.members, vec!["node-a".to_string(), "node-b".to_string()]);

    let mut verify = Membership::new("overlay");
    left.get_object(&mut verify).unwrap();
    assert_eq!(verify.members, on_right.members);
}

#[test]
fn atomic_delete_requires_current_revision() {
    let backend = Arc::new(MemoryStore::new());
    let ds = DataStore::new(Box::new(backend.clone()));

    let mut obj = Membership::new("overlay");
    ds.put_object_atomic(&mut obj).unwrap();
    let stale = obj.clone();

    ds.update(&mut obj, |m| {
        m.members.push("node-a".to_string());
        Ok(())
    })
    .unwrap();

    assert!(matches!(ds.delete_object_atomic(&stale), Err(StoreError::KeyModified)));
    ds.delete_object_atomic(&obj).unwrap();
    assert!(!backend.exists("docker/network/v1.0/network/overlay/").unwrap());
}
