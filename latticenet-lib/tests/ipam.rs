use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use latticenet_lib::ipam::{
    Allocator, IpamError, PoolId, ALLOC_SERIAL_PREFIX, GLOBAL_ADDRESS_SPACE, LOCAL_ADDRESS_SPACE,
};
use latticenet_lib::store::{DataStore, MemoryStore};

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn no_options() -> HashMap<String, String> {
    HashMap::new()
}

#[test]
fn slash_24_hands_out_exactly_254_addresses() {
    let a = Allocator::new();
    let (id, pool) = a
        .request_pool(LOCAL_ADDRESS_SPACE, Some(net("192.168.59.0/24")), None, false)
        .unwrap();
    assert_eq!(pool, net("192.168.59.0/24"));

    let mut last = None;
    for _ in 0..254 {
        last = Some(a.request_address(&id, None, &no_options()).unwrap());
    }
    // Network and broadcast addresses are reserved; .254 is the last one out.
    assert_eq!(last, Some(ip("192.168.59.254")));
    assert!(matches!(
        a.request_address(&id, None, &no_options()),
        Err(IpamError::NoAvailableIps)
    ));

    a.release_address(&id, ip("192.168.59.17")).unwrap();
    assert_eq!(a.request_address(&id, None, &no_options()).unwrap(), ip("192.168.59.17"));
}

#[test]
fn network_and_broadcast_are_never_allocated() {
    let a = Allocator::new();
    let (id, _) = a
        .request_pool(LOCAL_ADDRESS_SPACE, Some(net("10.10.0.0/16")), None, false)
        .unwrap();
    assert!(matches!(
        a.request_address(&id, Some(ip("10.10.0.0")), &no_options()),
        Err(IpamError::IpAlreadyAllocated)
    ));
    assert!(matches!(
        a.request_address(&id, Some(ip("10.10.255.255")), &no_options()),
        Err(IpamError::IpAlreadyAllocated)
    ));
}

#[test]
fn sub_pool_preferred_address() {
    let a = Allocator::new();
    let (id, pool) = a
        .request_pool(
            LOCAL_ADDRESS_SPACE,
            Some(net("10.0.0.0/8")),
            Some(net("10.0.0.0/24")),
            false,
        )
        .unwrap();
    assert_eq!(pool, net("10.0.0.0/8"));
    assert_eq!(id.child_subnet(), Some(net("10.0.0.0/24")));

    assert_eq!(
        a.request_address(&id, Some(ip("10.0.0.5")), &no_options()).unwrap(),
        ip("10.0.0.5")
    );
    assert!(matches!(
        a.request_address(&id, Some(ip("10.0.0.5")), &no_options()),
        Err(IpamError::IpAlreadyAllocated)
    ));
    // Outside the sub-pool, even though inside the master.
    assert!(matches!(
        a.request_address(&id, Some(ip("10.1.0.5")), &no_options()),
        Err(IpamError::IpOutOfRange)
    ));
    // Unpreferred allocation stays inside the sub-pool's ordinal range.
    let addr = a.request_address(&id, None, &no_options()).unwrap();
    assert!(net("10.0.0.0/24").contains(&addr), "{addr} escaped the sub-pool");
}

#[test]
fn sibling_sub_pools_share_the_master_bitmap() {
    let a = Allocator::new();
    let (id1, _) = a
        .request_pool(
            LOCAL_ADDRESS_SPACE,
            Some(net("10.0.0.0/8")),
            Some(net("10.0.0.0/24")),
            false,
        )
        .unwrap();
    let (id2, _) = a
        .request_pool(
            LOCAL_ADDRESS_SPACE,
            Some(net("10.0.0.0/8")),
            Some(net("10.0.1.0/24")),
            false,
        )
        .unwrap();
    let first = a.request_address(&id1, None, &no_options()).unwrap();
    let second = a.request_address(&id2, None, &no_options()).unwrap();
    assert!(net("10.0.0.0/24").contains(&first));
    assert!(net("10.0.1.0/24").contains(&second));
}

#[test]
fn overlapping_pools_are_rejected() {
    let a = Allocator::new();
    a.request_pool(LOCAL_ADDRESS_SPACE, Some(net("10.0.0.0/8")), None, false)
        .unwrap();
    assert!(matches!(
        a.request_pool(LOCAL_ADDRESS_SPACE, Some(net("10.3.0.0/16")), None, false),
        Err(IpamError::PoolOverlap)
    ));
    // The same master twice is an overlap too.
    assert!(matches!(
        a.request_pool(LOCAL_ADDRESS_SPACE, Some(net("10.0.0.0/8")), None, false),
        Err(IpamError::PoolOverlap)
    ));
    // A different space is a different universe.
    a.request_pool(GLOBAL_ADDRESS_SPACE, Some(net("10.0.0.0/8")), None, false)
        .unwrap();
}

#[test]
fn wide_sub_pool_is_clamped_to_the_master() {
    let a = Allocator::new();
    let (id, pool) = a
        .request_pool(
            LOCAL_ADDRESS_SPACE,
            Some(net("10.20.0.0/16")),
            Some(net("10.20.0.0/12")),
            false,
        )
        .unwrap();
    assert_eq!(pool, net("10.20.0.0/16"));
    assert_eq!(id.child_subnet(), Some(net("10.20.0.0/16")));
    let addr = a.request_address(&id, None, &no_options()).unwrap();
    assert!(pool.contains(&addr));
}

#[test]
fn predefined_rotation_spreads_pools() {
    let a = Allocator::with_predefined(
        vec![net("172.17.0.0/16"), net("172.18.0.0/16"), net("172.19.0.0/16")],
        vec![],
    );
    let (_, first) = a.request_pool(LOCAL_ADDRESS_SPACE, None, None, false).unwrap();
    let (id2, second) = a.request_pool(LOCAL_ADDRESS_SPACE, None, None, false).unwrap();
    let (_, third) = a.request_pool(LOCAL_ADDRESS_SPACE, None, None, false).unwrap();
    assert_eq!(first, net("172.17.0.0/16"));
    assert_eq!(second, net("172.18.0.0/16"));
    assert_eq!(third, net("172.19.0.0/16"));
    assert!(matches!(
        a.request_pool(LOCAL_ADDRESS_SPACE, None, None, false),
        Err(IpamError::NoAvailablePool)
    ));
    // Releasing frees the candidate for the next rotation pass.
    a.release_pool(&id2).unwrap();
    let (_, again) = a.request_pool(LOCAL_ADDRESS_SPACE, None, None, false).unwrap();
    assert_eq!(again, net("172.18.0.0/16"));
}

#[test]
fn predefined_selection_respects_address_family() {
    let a = Allocator::with_predefined(
        vec![net("172.17.0.0/16"), net("2001:db8:1::/64"), net("172.18.0.0/16")],
        vec![],
    );
    let (_, v6) = a.request_pool(LOCAL_ADDRESS_SPACE, None, None, true).unwrap();
    assert_eq!(v6, net("2001:db8:1::/64"));
    let (_, v4) = a.request_pool(LOCAL_ADDRESS_SPACE, None, None, false).unwrap();
    assert!(matches!(v4, IpNet::V4(_)));
}

#[test]
fn auto_created_master_disappears_with_its_last_child() {
    let a = Allocator::new();
    let (id, _) = a
        .request_pool(
            LOCAL_ADDRESS_SPACE,
            Some(net("10.0.0.0/8")),
            Some(net("10.0.0.0/24")),
            false,
        )
        .unwrap();
    a.release_pool(&id).unwrap();
    // The implicit master went away with the child.
    assert!(matches!(
        a.request_address(&id, None, &no_options()),
        Err(IpamError::PoolNotFound(_))
    ));
    // The range is free for a new master again.
    a.request_pool(LOCAL_ADDRESS_SPACE, Some(net("10.1.0.0/16")), None, false)
        .unwrap();
}

#[test]
fn explicit_master_release_is_deferred_while_children_exist() {
    let a = Allocator::new();
    let (master_id, _) = a
        .request_pool(LOCAL_ADDRESS_SPACE, Some(net("10.0.0.0/8")), None, false)
        .unwrap();
    let (child_id, _) = a
        .request_pool(
            LOCAL_ADDRESS_SPACE,
            Some(net("10.0.0.0/8")),
            Some(net("10.0.0.0/24")),
            false,
        )
        .unwrap();
    a.release_pool(&master_id).unwrap();
    // The child keeps the master alive.
    a.request_address(&child_id, None, &no_options()).unwrap();
    a.release_pool(&child_id).unwrap();
    assert!(matches!(
        a.request_address(&child_id, None, &no_options()),
        Err(IpamError::PoolNotFound(_))
    ));
}

#[test]
fn double_release_of_an_address_fails() {
    let a = Allocator::new();
    let (id, _) = a
        .request_pool(LOCAL_ADDRESS_SPACE, Some(net("192.168.1.0/24")), None, false)
        .unwrap();
    let addr = a.request_address(&id, None, &no_options()).unwrap();
    a.release_address(&id, addr).unwrap();
    assert!(matches!(
        a.release_address(&id, addr),
        Err(IpamError::AddressNotAllocated(_))
    ));
}

#[test]
fn serial_option_advances_through_released_addresses() {
    let a = Allocator::new();
    let (id, _) = a
        .request_pool(LOCAL_ADDRESS_SPACE, Some(net("192.168.2.0/24")), None, false)
        .unwrap();
    let serial: HashMap<String, String> =
        [(ALLOC_SERIAL_PREFIX.to_string(), "true".to_string())].into();
    let first = a.request_address(&id, None, &serial).unwrap();
    assert_eq!(first, ip("192.168.2.1"));
    a.release_address(&id, first).unwrap();
    // Serial scanning does not immediately reuse the released address.
    assert_eq!(a.request_address(&id, None, &serial).unwrap(), ip("192.168.2.2"));
}

#[test]
fn unknown_spaces_and_pools_are_reported() {
    let a = Allocator::new();
    assert!(matches!(
        a.request_pool("NoSuchSpace", None, None, false),
        Err(IpamError::InvalidAddressSpace(_))
    ));
    let id: PoolId = "LocalDefault/10.9.0.0/16".parse().unwrap();
    assert!(matches!(
        a.request_address(&id, None, &no_options()),
        Err(IpamError::PoolNotFound(_))
    ));
}

#[test]
fn state_survives_a_restart_through_the_store() {
    let backend = Arc::new(MemoryStore::new());
    let store = Arc::new(DataStore::new(Box::new(backend.clone())));
    let first = Allocator::new().with_store(store).unwrap();
    let (id, _) = first
        .request_pool(LOCAL_ADDRESS_SPACE, Some(net("192.168.59.0/24")), None, false)
        .unwrap();
    let addr = first
        .request_address(&id, Some(ip("192.168.59.10")), &no_options())
        .unwrap();
    assert_eq!(addr, ip("192.168.59.10"));

    // A fresh allocator over the same backend sees the allocations.
    let store = Arc::new(DataStore::new(Box::new(backend)));
    let second = Allocator::new().with_store(store).unwrap();
    assert!(matches!(
        second.request_address(&id, Some(ip("192.168.59.10")), &no_options()),
        Err(IpamError::IpAlreadyAllocated)
    ));
    assert_eq!(
        second.request_address(&id, None, &no_options()).unwrap(),
        ip("192.168.59.1")
    );
}

#[test]
fn concurrent_writers_reconcile_through_the_store() {
    let backend = Arc::new(MemoryStore::new());
    let writer_a = Allocator::new()
        .with_store(Arc::new(DataStore::new(Box::new(backend.clone()))))
        .unwrap();
    let (id, _) = writer_a
        .request_pool(GLOBAL_ADDRESS_SPACE, Some(net("10.40.0.0/16")), None, false)
        .unwrap();

    // Writer B loads the pool before A's allocation lands.
    let writer_b = Allocator::new()
        .with_store(Arc::new(DataStore::new(Box::new(backend))))
        .unwrap();
    let a1 = writer_a.request_address(&id, None, &no_options()).unwrap();

    // B's in-memory state is now stale; the CAS conflict forces a re-read,
    // so it must not hand out the same address.
    let b1 = writer_b.request_address(&id, None, &no_options()).unwrap();
    assert_ne!(a1, b1);
}
