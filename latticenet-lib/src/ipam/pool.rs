//! Pool identifiers and CIDR/ordinal arithmetic.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::ipam::IpamError;

/// Opaque handle for an allocated pool: the owning address space, the master
/// subnet, and optionally the child sub-pool carved out of it.
///
/// String form: `"<space>/<subnet>"` or `"<space>/<subnet>/<child>"`, where
/// each CIDR is `ip/bits`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolId {
    address_space: String,
    subnet: IpNet,
    child_subnet: Option<IpNet>,
}

impl PoolId {
    pub(crate) fn new(address_space: &str, subnet: IpNet, child_subnet: Option<IpNet>) -> Self {
        Self { address_space: address_space.to_string(), subnet, child_subnet }
    }

    pub fn address_space(&self) -> &str {
        &self.address_space
    }

    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    pub fn child_subnet(&self) -> Option<IpNet> {
        self.child_subnet
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address_space, self.subnet)?;
        if let Some(child) = &self.child_subnet {
            write!(f, "/{child}")?;
        }
        Ok(())
    }
}

impl FromStr for PoolId {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IpamError::InvalidPoolId(s.to_string());
        let parts: Vec<&str> = s.split('/').collect();
        // A CIDR contains one '/', so a valid id splits into three parts, or
        // five with a child. An empty trailing child is tolerated.
        let (space, subnet, child) = match parts.as_slice() {
            [space, ip, bits] => (*space, format!("{ip}/{bits}"), None),
            [space, ip, bits, "", ""] => (*space, format!("{ip}/{bits}"), None),
            [space, ip, bits, child_ip, child_bits] => (
                *space,
                format!("{ip}/{bits}"),
                Some(format!("{child_ip}/{child_bits}")),
            ),
            _ => return Err(invalid()),
        };
        if space.is_empty() {
            return Err(invalid());
        }
        let subnet: IpNet = subnet.parse().map_err(|_| invalid())?;
        let child_subnet = match child {
            Some(c) => Some(c.parse().map_err(|_| invalid())?),
            None => None,
        };
        Ok(Self { address_space: space.to_string(), subnet, child_subnet })
    }
}

/// Per-master-pool allocation state. One bitmap sized to the master's host
/// ordinals covers the master and every child carved from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PoolData {
    pub(crate) pool: IpNet,
    pub(crate) addrs: Bitmap,
    #[serde(default)]
    pub(crate) children: BTreeSet<IpNet>,
    /// Set when the master was created implicitly to host a sub-pool; such
    /// masters are deleted once their last child is released.
    #[serde(default)]
    pub(crate) auto_release: bool,
}

/// Number of addresses covered by a subnet, saturating at `u64::MAX` (an
/// IPv6 /64 already overflows the ordinal space).
pub(crate) fn num_addresses(net: &IpNet) -> u64 {
    let host_bits = u32::from(net.max_prefix_len()) - u32::from(net.prefix_len());
    if host_bits >= 64 {
        u64::MAX
    } else {
        1u64 << host_bits
    }
}

/// The bits of `addr` below `prefix_len`, as a host ordinal.
pub(crate) fn host_id(addr: &IpAddr, prefix_len: u8) -> u64 {
    match addr {
        IpAddr::V4(v4) => {
            let value = u64::from(u32::from(*v4));
            let host_bits = 32u32.saturating_sub(u32::from(prefix_len));
            if host_bits >= 32 {
                value
            } else {
                value & ((1u64 << host_bits) - 1)
            }
        }
        IpAddr::V6(v6) => {
            let value = u128::from(*v6);
            let host_bits = 128u32.saturating_sub(u32::from(prefix_len));
            let masked = if host_bits >= 128 {
                value
            } else {
                value & ((1u128 << host_bits) - 1)
            };
            u64::try_from(masked).unwrap_or(u64::MAX)
        }
    }
}

/// The address at `ordinal` within the subnet.
pub(crate) fn address_at(net: &IpNet, ordinal: u64) -> IpAddr {
    match net.network() {
        IpAddr::V4(base) => {
            IpAddr::V4((u32::from(base).wrapping_add(ordinal as u32)).into())
        }
        IpAddr::V6(base) => {
            IpAddr::V6((u128::from(base).wrapping_add(u128::from(ordinal))).into())
        }
    }
}

/// Inclusive ordinal range a sub-pool occupies within its master.
pub(crate) fn subnet_range(master: &IpNet, sub: &IpNet) -> (u64, u64) {
    let start = host_id(&sub.network(), master.prefix_len());
    let end = start.saturating_add(num_addresses(sub).saturating_sub(1));
    (start, end)
}

/// Two CIDRs overlap exactly when one contains the other.
pub(crate) fn nets_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}
