// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-interface listening servers. Each server owns the contiguous
//! kernel-ID slice derived from its address's rank in the subnet, so ID
//! assignment needs no cluster coordination.

use ipnet::Ipv4Net;
use mio::Token;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub(crate) struct Server {
    pub(crate) listener: mio::net::TcpListener,
    pub(crate) net: Ipv4Net,
    pub(crate) port: u16,
    pub(crate) token: Token,
}

/// Zero-based rank of `addr` in its subnet host list and the host count.
pub(crate) fn subnet_rank(net: Ipv4Net) -> (u64, u64) {
    let base = u32::from(net.network());
    let addr = u32::from(net.addr());
    let rank = u64::from(addr.saturating_sub(base).saturating_sub(1));
    let host_bits = 32 - u32::from(net.prefix_len());
    let count = if host_bits >= 2 {
        (1u64 << host_bits) - 2
    } else {
        1
    };
    (rank, count)
}

impl Server {
    pub(crate) fn bind(net: Ipv4Net, port: u16, token: Token) -> io::Result<Self> {
        let listener =
            mio::net::TcpListener::bind(SocketAddr::V4(SocketAddrV4::new(net.addr(), port)))?;
        Ok(Self {
            listener,
            net,
            port,
            token,
        })
    }

    pub(crate) fn address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.net.addr(), self.port)
    }

    pub(crate) fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(&ip)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rank_counts_from_first_host() {
        let net: Ipv4Net = "10.0.0.1/24".parse().unwrap();
        assert_eq!(subnet_rank(net), (0, 254));
        let net: Ipv4Net = "10.0.0.4/24".parse().unwrap();
        assert_eq!(subnet_rank(net), (3, 254));
    }

    #[test]
    fn neighbouring_hosts_get_disjoint_id_ranges() {
        use kernel::IdGenerator;
        let a: Ipv4Net = "10.0.0.1/29".parse().unwrap();
        let b: Ipv4Net = "10.0.0.2/29".parse().unwrap();
        let (rank_a, count) = subnet_rank(a);
        let (rank_b, _) = subnet_rank(b);
        let (lo_a, hi_a) = IdGenerator::range_for(rank_a, count);
        let (lo_b, hi_b) = IdGenerator::range_for(rank_b, count);
        assert!(hi_a <= lo_b || hi_b <= lo_a);
    }
}
