//! IP address management: carving CIDR pools out of named address spaces and
//! handing out individual addresses from them.

mod allocator;
mod null;
mod pool;
mod predefined;

pub use allocator::Allocator;
pub use null::NullIpam;
pub use pool::PoolId;
pub use predefined::{predefined_global_scope_networks, predefined_local_scope_networks};

use std::net::IpAddr;

use thiserror::Error;

use crate::bitmap::BitmapError;
use crate::store::StoreError;

/// Address space for host-local pools.
pub const LOCAL_ADDRESS_SPACE: &str = "LocalDefault";
/// Address space for cluster-wide pools.
pub const GLOBAL_ADDRESS_SPACE: &str = "GlobalDefault";

/// Request-address option: `"true"` makes the allocator scan serially from
/// its cursor instead of always picking the lowest free ordinal.
pub const ALLOC_SERIAL_PREFIX: &str = "AllocSerialPrefix";

#[derive(Error, Debug)]
pub enum IpamError {
    #[error("invalid address space {0:?}")]
    InvalidAddressSpace(String),

    #[error("invalid pool: {0}")]
    InvalidPool(String),

    #[error("invalid sub pool: {0}")]
    InvalidSubPool(String),

    #[error("requested pool overlaps an allocated pool")]
    PoolOverlap,

    #[error("requested address is out of range")]
    IpOutOfRange,

    #[error("requested address is already allocated")]
    IpAlreadyAllocated,

    #[error("no available addresses in pool")]
    NoAvailableIps,

    #[error("no available predefined pool for the requested address family")]
    NoAvailablePool,

    #[error("pool {0:?} not found")]
    PoolNotFound(String),

    #[error("address {0} is not allocated in the pool")]
    AddressNotAllocated(IpAddr),

    #[error("invalid pool id {0:?}")]
    InvalidPoolId(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}
