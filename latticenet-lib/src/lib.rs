#![forbid(unsafe_code)]

pub mod bitmap;
pub mod idm;
pub mod ipam;
pub mod networkdb;
pub mod store;
pub mod telemetry;

pub use bitmap::{Bitmap, BitmapError};
pub use idm::{IdManager, IdmError};
pub use ipam::{Allocator, IpamError, NullIpam, PoolId};
pub use networkdb::{
    EntryRecord, NetworkDb, NetworkDbConfig, NetworkDbError, PeerInfo, WatchCancel, WatchEvent,
};
pub use store::{DataStore, KvObject, MemoryStore, Store, StoreError};
