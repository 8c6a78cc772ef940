// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Length-prefixed packet framing.
//!
//! Each packet is a u32 little-endian length counting every byte after
//! the prefix, followed by the kernel header and payload. A writer
//! reserves the prefix with [`begin_packet`], serialises, then backfills
//! it with [`end_packet`]. A reader calls [`read_packet`] in a loop: a
//! packet is produced only once all of its bytes have arrived.

use crate::wire::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Upper bound on a single packet; anything larger means the stream is
/// desynchronised and the connection must be dropped.
pub const MAX_PACKET: usize = 16 * 1024 * 1024;

/// Reserve the length prefix and return its offset for [`end_packet`].
pub fn begin_packet(out: &mut BytesMut) -> usize {
    let at = out.len();
    out.put_u32_le(0);
    at
}

/// Backfill the length prefix reserved at `at`.
pub fn end_packet(out: &mut BytesMut, at: usize) {
    let len = (out.len() - at - LENGTH_PREFIX) as u32;
    out[at..at + LENGTH_PREFIX].copy_from_slice(&len.to_le_bytes());
}

/// Pop one complete packet off the input buffer, if available.
pub fn read_packet(input: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
    if input.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let mut raw = [0u8; LENGTH_PREFIX];
    raw.copy_from_slice(&input[..LENGTH_PREFIX]);
    let len = u32::from_le_bytes(raw) as usize;
    if len > MAX_PACKET {
        return Err(WireError::OversizedPacket(len));
    }
    if input.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    input.advance(LENGTH_PREFIX);
    Ok(Some(input.split_to(len).freeze()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_packets_wait_for_more_bytes() {
        let mut out = BytesMut::new();
        let at = begin_packet(&mut out);
        out.put_slice(b"hello");
        end_packet(&mut out, at);

        let mut input = BytesMut::new();
        for (i, b) in out.iter().enumerate() {
            input.put_u8(*b);
            let got = read_packet(&mut input).unwrap();
            if i + 1 < out.len() {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap().as_ref(), b"hello");
            }
        }
        assert!(input.is_empty());
    }

    #[test]
    fn back_to_back_packets() {
        let mut out = BytesMut::new();
        for payload in [b"one".as_ref(), b"two".as_ref(), b"three".as_ref()] {
            let at = begin_packet(&mut out);
            out.put_slice(payload);
            end_packet(&mut out, at);
        }
        assert_eq!(read_packet(&mut out).unwrap().unwrap().as_ref(), b"one");
        assert_eq!(read_packet(&mut out).unwrap().unwrap().as_ref(), b"two");
        assert_eq!(read_packet(&mut out).unwrap().unwrap().as_ref(), b"three");
        assert!(read_packet(&mut out).unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut input = BytesMut::new();
        input.put_u32_le(u32::MAX);
        assert!(read_packet(&mut input).is_err());
    }
}
