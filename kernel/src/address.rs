// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Socket addresses as they appear on the wire.
//!
//! A peer is either an IPv4 or IPv6 endpoint or a local (UNIX-domain)
//! path. The wire tagging is fixed: family `1` = IPv4 followed by four
//! address bytes and a port, family `2` = IPv6 followed by sixteen
//! address bytes and a port, family `3` = a length-prefixed local path.
//! Family `0` encodes an absent address.

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Wire family tag for IPv4 endpoints.
pub const FAMILY_IPV4: u16 = 1;
/// Wire family tag for IPv6 endpoints.
pub const FAMILY_IPV6: u16 = 2;
/// Wire family tag for local (UNIX-domain) paths.
pub const FAMILY_LOCAL: u16 = 3;
/// Wire family tag for an absent address.
pub const FAMILY_NONE: u16 = 0;

/// A network endpoint of a peer daemon or a local control client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocketAddress {
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    /// A UNIX-domain path. Control clients that connect with an unnamed
    /// socket are assigned a synthetic path by the accepting pipeline.
    Local(String),
}

impl SocketAddress {
    #[must_use]
    pub fn family(&self) -> u16 {
        match self {
            SocketAddress::Ipv4(_) => FAMILY_IPV4,
            SocketAddress::Ipv6(_) => FAMILY_IPV6,
            SocketAddress::Local(_) => FAMILY_LOCAL,
        }
    }

    /// The IP address part, if this is an IP endpoint.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            SocketAddress::Ipv4(a) => Some(IpAddr::V4(*a.ip())),
            SocketAddress::Ipv6(a) => Some(IpAddr::V6(*a.ip())),
            SocketAddress::Local(_) => None,
        }
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            SocketAddress::Ipv4(a) => Some(a.port()),
            SocketAddress::Ipv6(a) => Some(a.port()),
            SocketAddress::Local(_) => None,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, SocketAddress::Local(_))
    }

    /// The std form of an IP endpoint, if any.
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            SocketAddress::Ipv4(a) => Some(SocketAddr::V4(*a)),
            SocketAddress::Ipv6(a) => Some(SocketAddr::V6(*a)),
            SocketAddress::Local(_) => None,
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(a) => SocketAddress::Ipv4(a),
            SocketAddr::V6(a) => SocketAddress::Ipv6(a),
        }
    }
}

impl From<SocketAddrV4> for SocketAddress {
    fn from(value: SocketAddrV4) -> Self {
        SocketAddress::Ipv4(value)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Ipv4(a) => write!(f, "{a}"),
            SocketAddress::Ipv6(a) => write!(f, "{a}"),
            SocketAddress::Local(p) => write!(f, "unix:{p}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn family_tags() {
        let v4 = SocketAddress::Ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 33333));
        assert_eq!(v4.family(), FAMILY_IPV4);
        assert_eq!(v4.port(), Some(33333));
        let local = SocketAddress::Local("/run/lattice/control.sock".into());
        assert_eq!(local.family(), FAMILY_LOCAL);
        assert_eq!(local.port(), None);
        assert!(local.is_local());
    }

    #[test]
    fn ordered_for_client_maps() {
        let a = SocketAddress::Ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 33333));
        let b = SocketAddress::Ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 33333));
        assert!(a < b);
    }
}
