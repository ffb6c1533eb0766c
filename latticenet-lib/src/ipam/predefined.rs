//! Default candidate pools for the well-known address spaces.

use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};

/// Candidate pools for `LocalDefault`: the 172.17.0.0/16 through
/// 172.31.0.0/16 blocks followed by 192.168.0.0/16 carved into /20s.
pub fn predefined_local_scope_networks() -> Vec<IpNet> {
    let mut networks = Vec::with_capacity(31);
    for octet in 17..=31u8 {
        networks.push(IpNet::V4(Ipv4Net::new_assert(
            Ipv4Addr::new(172, octet, 0, 0),
            16,
        )));
    }
    networks.extend(split_network(
        Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 0, 0), 16),
        20,
    ));
    networks
}

/// Candidate pools for `GlobalDefault`: 10.0.0.0/8 carved into /24s.
pub fn predefined_global_scope_networks() -> Vec<IpNet> {
    split_network(Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8), 24)
}

fn split_network(base: Ipv4Net, prefix_len: u8) -> Vec<IpNet> {
    match base.subnets(prefix_len) {
        Ok(subnets) => subnets.map(IpNet::V4).collect(),
        Err(_) => vec![IpNet::V4(base)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_scope_defaults() {
        let nets = predefined_local_scope_networks();
        assert_eq!(nets.len(), 15 + 16);
        assert_eq!(nets[0].to_string(), "172.17.0.0/16");
        assert_eq!(nets[14].to_string(), "172.31.0.0/16");
        assert_eq!(nets[15].to_string(), "192.168.0.0/20");
        assert_eq!(nets[30].to_string(), "192.168.240.0/20");
    }

    #[test]
    fn global_scope_defaults() {
        let nets = predefined_global_scope_networks();
        assert_eq!(nets.len(), 1 << 16);
        assert_eq!(nets[0].to_string(), "10.0.0.0/24");
        assert_eq!(nets[nets.len() - 1].to_string(), "10.255.255.0/24");
    }
}
