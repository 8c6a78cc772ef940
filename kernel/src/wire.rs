// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Little-endian wire primitives.
//!
//! `Encoder` appends to an output buffer, `Decoder` walks a received
//! packet. Every multi-byte integer on the wire is little-endian.

use crate::address::{
    FAMILY_IPV4, FAMILY_IPV6, FAMILY_LOCAL, FAMILY_NONE, SocketAddress,
};
use crate::resources::{Resource, ResourceVector};
use bytes::{BufMut, BytesMut};
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("expected at least {expected} more bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown address family {0}")]
    BadAddressFamily(u16),
    #[error("local path is not valid utf-8")]
    BadPath,
    #[error("invalid network prefix length {0}")]
    BadPrefix(u8),
    #[error("unknown kernel type {0}")]
    UnknownType(u16),
    #[error("unknown phase {0}")]
    BadPhase(u8),
    #[error("unknown return code {0}")]
    BadReturnCode(u16),
    #[error("packet length {0} exceeds the frame limit")]
    OversizedPacket(usize),
}

/// Append-only writer over an output byte buffer.
pub struct Encoder<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// A u16-length-prefixed byte string.
    pub fn put_str(&mut self, v: &str) {
        debug_assert!(v.len() <= usize::from(u16::MAX));
        self.put_u16(v.len() as u16);
        self.buf.put_slice(v.as_bytes());
    }

    /// A tagged socket address; `None` is family 0.
    pub fn put_address(&mut self, v: Option<&SocketAddress>) {
        match v {
            None => self.put_u16(FAMILY_NONE),
            Some(SocketAddress::Ipv4(a)) => {
                self.put_u16(FAMILY_IPV4);
                self.put_bytes(&a.ip().octets());
                self.put_u16(a.port());
            }
            Some(SocketAddress::Ipv6(a)) => {
                self.put_u16(FAMILY_IPV6);
                self.put_bytes(&a.ip().octets());
                self.put_u16(a.port());
            }
            Some(SocketAddress::Local(p)) => {
                self.put_u16(FAMILY_LOCAL);
                self.put_str(p);
            }
        }
    }

    /// An IPv4 network as address bytes plus prefix length.
    pub fn put_net(&mut self, v: Ipv4Net) {
        self.put_bytes(&v.addr().octets());
        self.put_u8(v.prefix_len());
    }

    pub fn put_resources(&mut self, v: &ResourceVector) {
        for r in Resource::ALL {
            self.put_u64(v[r]);
        }
    }
}

/// Cursor over a received packet.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                expected: n,
                actual: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    pub fn get_str(&mut self) -> Result<String, WireError> {
        let len = usize::from(self.get_u16()?);
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadPath)
    }

    pub fn get_address(&mut self) -> Result<Option<SocketAddress>, WireError> {
        let family = self.get_u16()?;
        match family {
            FAMILY_NONE => Ok(None),
            FAMILY_IPV4 => {
                let raw = self.take(4)?;
                let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                let port = self.get_u16()?;
                Ok(Some(SocketAddress::Ipv4(SocketAddrV4::new(ip, port))))
            }
            FAMILY_IPV6 => {
                let raw = self.take(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                let port = self.get_u16()?;
                Ok(Some(SocketAddress::Ipv6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                ))))
            }
            FAMILY_LOCAL => Ok(Some(SocketAddress::Local(self.get_str()?))),
            other => Err(WireError::BadAddressFamily(other)),
        }
    }

    pub fn get_net(&mut self) -> Result<Ipv4Net, WireError> {
        let raw = self.take(4)?;
        let addr = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
        let prefix = self.get_u8()?;
        Ipv4Net::new(addr, prefix).map_err(|_| WireError::BadPrefix(prefix))
    }

    pub fn get_resources(&mut self) -> Result<ResourceVector, WireError> {
        let mut out = ResourceVector::default();
        for r in Resource::ALL {
            out[r] = self.get_u64()?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn integers_are_little_endian() {
        let mut buf = BytesMut::new();
        let mut enc = Encoder::new(&mut buf);
        enc.put_u16(0x1234);
        enc.put_u64(0x1122_3344_5566_7788);
        assert_eq!(&buf[..2], &[0x34, 0x12]);
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.get_u16().unwrap(), 0x1234);
        assert_eq!(dec.get_u64().unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn address_round_trip() {
        let cases = [
            None,
            Some(SocketAddress::Ipv4("10.0.0.1:33333".parse().unwrap())),
            Some(SocketAddress::Ipv6("[::1]:4000".parse().unwrap())),
            Some(SocketAddress::Local("/run/lattice/control.sock".into())),
        ];
        for case in cases {
            let mut buf = BytesMut::new();
            Encoder::new(&mut buf).put_address(case.as_ref());
            let got = Decoder::new(&buf).get_address().unwrap();
            assert_eq!(got, case);
        }
    }

    #[test]
    fn truncated_reads_fail() {
        let mut buf = BytesMut::new();
        Encoder::new(&mut buf).put_u16(7);
        let mut dec = Decoder::new(&buf);
        assert!(dec.get_u64().is_err());
    }

    #[test]
    fn net_round_trip() {
        let net: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        let mut buf = BytesMut::new();
        Encoder::new(&mut buf).put_net(net);
        assert_eq!(Decoder::new(&buf).get_net().unwrap(), net);
    }
}
