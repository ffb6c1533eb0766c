//! IPAM variant that grants only the wildcard pool and never hands out a
//! concrete address. Used by drivers that manage addressing themselves but
//! still need to satisfy the pool-request contract.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::ipam::{IpamError, PoolId};

/// Address space served by the null allocator.
pub const NULL_ADDRESS_SPACE: &str = "null";

#[derive(Debug, Default, Clone, Copy)]
pub struct NullIpam;

impl NullIpam {
    pub fn new() -> Self {
        Self
    }

    /// Accepts only the wildcard pool (`0.0.0.0/0` or `::/0`), or no pool at
    /// all, and never a sub-pool.
    pub fn request_pool(
        &self,
        pool: Option<IpNet>,
        sub_pool: Option<IpNet>,
        v6: bool,
    ) -> Result<(PoolId, IpNet), IpamError> {
        if sub_pool.is_some() {
            return Err(IpamError::InvalidSubPool(
                "the null allocator does not support sub pools".to_string(),
            ));
        }
        let wildcard = match pool {
            Some(IpNet::V6(_)) => wildcard(true),
            Some(IpNet::V4(_)) => wildcard(false),
            None => wildcard(v6),
        };
        if let Some(p) = pool {
            if p != wildcard {
                return Err(IpamError::InvalidPool(format!(
                    "only the wildcard pool is supported, got {p}"
                )));
            }
        }
        Ok((PoolId::new(NULL_ADDRESS_SPACE, wildcard, None), wildcard))
    }

    pub fn release_pool(&self, _id: &PoolId) -> Result<(), IpamError> {
        Ok(())
    }

    /// No concrete address is ever produced.
    pub fn request_address(
        &self,
        _id: &PoolId,
        _preferred: Option<IpAddr>,
    ) -> Result<Option<IpAddr>, IpamError> {
        Ok(None)
    }

    pub fn release_address(&self, _id: &PoolId, _address: IpAddr) -> Result<(), IpamError> {
        Ok(())
    }
}

fn wildcard(v6: bool) -> IpNet {
    if v6 {
        IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 0))
    } else {
        IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0))
    }
}
