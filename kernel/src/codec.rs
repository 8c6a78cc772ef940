// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Kernel (de)hydration: the wire header layout plus payloads.
//!
//! Header fields, in order: flags (u16), application ID (u64, present
//! when the `HAS_APPLICATION` flag is set), source and destination
//! addresses (present when `PREPEND_SOURCE_AND_DESTINATION` is set),
//! type ID (u16), kernel ID (u64), principal ID (u64), return code
//! (u16), phase (u8). A carried parent follows the payload as type ID +
//! parent ID + parent payload.

use crate::address::SocketAddress;
use crate::kernel::{
    Kernel, KernelCore, KernelFlags, KernelPtr, ParentLink, Phase, Principal, ReturnCode,
};
use crate::registry::TypeRegistry;
use crate::wire::{Decoder, Encoder, WireError};
use bytes::{Bytes, BytesMut};

/// Decoded wire header of one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelHeader {
    pub flags: KernelFlags,
    pub application: u64,
    pub source: Option<SocketAddress>,
    pub destination: Option<SocketAddress>,
    pub wire_type: u16,
    pub id: u64,
    pub principal_id: u64,
    pub return_code: ReturnCode,
    pub phase: Phase,
}

pub fn encode_header(enc: &mut Encoder<'_>, header: &KernelHeader) {
    enc.put_u16(header.flags.bits());
    if header.flags.contains(KernelFlags::HAS_APPLICATION) {
        enc.put_u64(header.application);
    }
    if header
        .flags
        .contains(KernelFlags::PREPEND_SOURCE_AND_DESTINATION)
    {
        enc.put_address(header.source.as_ref());
        enc.put_address(header.destination.as_ref());
    }
    enc.put_u16(header.wire_type);
    enc.put_u64(header.id);
    enc.put_u64(header.principal_id);
    enc.put_u16(header.return_code as u16);
    enc.put_u8(header.phase as u8);
}

pub fn decode_header(dec: &mut Decoder<'_>) -> Result<KernelHeader, WireError> {
    let flags = KernelFlags::from_bits_truncate(dec.get_u16()?);
    let application = if flags.contains(KernelFlags::HAS_APPLICATION) {
        dec.get_u64()?
    } else {
        0
    };
    let (source, destination) = if flags.contains(KernelFlags::PREPEND_SOURCE_AND_DESTINATION) {
        (dec.get_address()?, dec.get_address()?)
    } else {
        (None, None)
    };
    let wire_type = dec.get_u16()?;
    let id = dec.get_u64()?;
    let principal_id = dec.get_u64()?;
    let return_code = ReturnCode::try_from(dec.get_u16()?)?;
    let phase = Phase::try_from(dec.get_u8()?)?;
    Ok(KernelHeader {
        flags,
        application,
        source,
        destination,
        wire_type,
        id,
        principal_id,
        return_code,
        phase,
    })
}

/// Serialise one kernel (header, payload, carried parent) into `out`.
/// Framing is the caller's job.
pub fn encode_kernel(k: &dyn Kernel, out: &mut BytesMut, prepend_src_dst: bool) {
    if let Some(fk) = k.downcast_ref::<ForeignKernel>() {
        return encode_foreign(fk, out, prepend_src_dst);
    }
    let core = k.core();
    let mut flags = core.flags() & KernelFlags::DO_NOT_DELETE;
    flags |= KernelFlags::HAS_APPLICATION;
    if prepend_src_dst {
        flags |= KernelFlags::PREPEND_SOURCE_AND_DESTINATION;
    }
    match core.parent() {
        ParentLink::Owned(_) => flags |= KernelFlags::CARRIES_PARENT,
        ParentLink::Id(_) => flags |= KernelFlags::PARENT_IS_ID,
        ParentLink::None => {}
    }
    let header = KernelHeader {
        flags,
        application: core.target_application(),
        source: core.source().cloned(),
        destination: core.destination().cloned(),
        wire_type: k.wire_type(),
        id: core.id(),
        principal_id: core.principal().id(),
        return_code: core.return_code(),
        phase: core.phase(),
    };
    let mut enc = Encoder::new(out);
    encode_header(&mut enc, &header);
    k.encode(&mut enc);
    if let ParentLink::Owned(parent) = core.parent() {
        enc.put_u16(parent.wire_type());
        enc.put_u64(parent.core().id());
        parent.encode(&mut enc);
    }
}

fn encode_foreign(fk: &ForeignKernel, out: &mut BytesMut, prepend_src_dst: bool) {
    let mut header = fk.header.clone();
    if prepend_src_dst {
        header.flags |= KernelFlags::PREPEND_SOURCE_AND_DESTINATION;
        header.source = fk.core.source().cloned();
        header.destination = fk.core.destination().cloned();
    }
    let mut enc = Encoder::new(out);
    encode_header(&mut enc, &header);
    enc.put_bytes(&fk.body);
}

/// Outcome of decoding one packet.
#[derive(Debug)]
pub enum Decoded {
    Native(KernelPtr),
    Foreign(Box<ForeignKernel>),
}

/// Decode one framed packet. `peer` is the link's remote address (used
/// as the kernel source when the header carries none);
/// `from_application` overrides the header application for kernels read
/// from a child-process pipe.
pub fn decode_kernel(
    types: &TypeRegistry,
    this_application: u64,
    peer: Option<&SocketAddress>,
    from_application: Option<u64>,
    packet: &Bytes,
) -> Result<Decoded, WireError> {
    let mut dec = Decoder::new(packet);
    let mut header = decode_header(&mut dec)?;
    if let Some(app) = from_application {
        header.application = app;
        header.flags |= KernelFlags::HAS_APPLICATION;
    }
    if header.source.is_none() {
        header.source = peer.cloned();
    }
    if header.application != this_application {
        let body = packet.slice(dec.position()..);
        return Ok(Decoded::Foreign(Box::new(ForeignKernel::new(header, body))));
    }
    let mut k = types.construct(header.wire_type, &mut dec)?;
    let carries_parent = header.flags.contains(KernelFlags::CARRIES_PARENT);
    {
        let core = k.core_mut();
        core.set_id(header.id);
        core.set_phase(header.phase);
        core.set_return_code(header.return_code);
        core.set_target_application(header.application);
        core.set_flags(header.flags);
        core.set_source(header.source);
        core.set_destination(header.destination);
        if header.principal_id != 0 {
            core.set_principal(Principal::Id(header.principal_id));
        }
    }
    if carries_parent {
        let parent_type = dec.get_u16()?;
        let parent_id = dec.get_u64()?;
        let mut parent = types.construct(parent_type, &mut dec)?;
        parent.core_mut().set_id(parent_id);
        parent
            .core_mut()
            .set_target_application(this_application);
        k.core_mut().set_parent(ParentLink::Owned(parent));
    }
    Ok(Decoded::Native(k))
}

/// A kernel whose application is not ours: header plus opaque payload
/// bytes, merely forwarded.
#[derive(Debug)]
pub struct ForeignKernel {
    core: KernelCore,
    header: KernelHeader,
    body: Bytes,
}

impl ForeignKernel {
    #[must_use]
    pub fn new(header: KernelHeader, body: Bytes) -> Self {
        let mut core = KernelCore::default();
        core.set_foreign(true);
        core.set_id(header.id);
        core.set_phase(header.phase);
        core.set_return_code(header.return_code);
        core.set_target_application(header.application);
        core.set_flags(header.flags);
        core.set_source(header.source.clone());
        core.set_destination(header.destination.clone());
        Self { core, header, body }
    }

    #[must_use]
    pub fn header(&self) -> &KernelHeader {
        &self.header
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether the opaque payload travels with its parent (judged from
    /// the header flags; the bytes themselves are not inspected).
    #[must_use]
    pub fn carries_parent(&self) -> bool {
        self.header.flags.contains(KernelFlags::CARRIES_PARENT)
    }
}

impl Kernel for ForeignKernel {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        self.header.wire_type
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_bytes(&self.body);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::Encoder;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct Echo {
        core: KernelCore,
        text: String,
    }

    impl Kernel for Echo {
        fn core(&self) -> &KernelCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut KernelCore {
            &mut self.core
        }

        fn wire_type(&self) -> u16 {
            7
        }

        fn encode(&self, enc: &mut Encoder<'_>) {
            enc.put_str(&self.text);
        }
    }

    fn decode_echo(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
        Ok(Box::new(Echo {
            core: KernelCore::default(),
            text: dec.get_str()?,
        }))
    }

    fn registry() -> TypeRegistry {
        let types = TypeRegistry::new();
        types.register(7, decode_echo).unwrap();
        types
    }

    fn frame(k: &dyn Kernel, prepend: bool) -> Bytes {
        let mut out = BytesMut::new();
        encode_kernel(k, &mut out, prepend);
        out.freeze()
    }

    #[test]
    fn header_and_payload_round_trip() {
        let types = registry();
        let mut k = Echo {
            core: KernelCore::default(),
            text: "wave".into(),
        };
        k.core_mut().set_id(99);
        k.core_mut().set_phase(Phase::PointToPoint);
        k.core_mut().set_return_code(ReturnCode::Success);
        k.core_mut().set_principal(Principal::Id(1));
        k.core_mut()
            .set_destination(Some(SocketAddress::Ipv4("10.0.0.1:33333".parse().unwrap())));

        let packet = frame(&k, true);
        let peer = SocketAddress::Ipv4("10.0.0.2:33333".parse().unwrap());
        let got = decode_kernel(&types, 0, Some(&peer), None, &packet).unwrap();
        let Decoded::Native(got) = got else {
            panic!("expected a native kernel");
        };
        let echo = got.downcast_ref::<Echo>().unwrap();
        assert_eq!(echo.text, "wave");
        assert_eq!(echo.core().id(), 99);
        assert_eq!(echo.core().phase(), Phase::PointToPoint);
        assert_eq!(echo.core().return_code(), ReturnCode::Success);
        assert_eq!(echo.core().principal().id(), 1);
        assert_eq!(
            echo.core().destination().unwrap().to_string(),
            "10.0.0.1:33333"
        );
    }

    #[test]
    fn source_defaults_to_the_link_peer() {
        let types = registry();
        let k = Echo {
            core: KernelCore::default(),
            text: String::new(),
        };
        let packet = frame(&k, false);
        let peer = SocketAddress::Ipv4("10.0.0.2:33333".parse().unwrap());
        let Decoded::Native(got) =
            decode_kernel(&types, 0, Some(&peer), None, &packet).unwrap()
        else {
            panic!("expected a native kernel");
        };
        assert_eq!(got.core().source(), Some(&peer));
    }

    #[test]
    fn carried_parent_survives_the_wire() {
        let types = registry();
        let mut parent = Box::new(Echo {
            core: KernelCore::default(),
            text: "parent".into(),
        });
        parent.core_mut().set_id(5);
        let mut child = Echo {
            core: KernelCore::default(),
            text: "child".into(),
        };
        child.core_mut().set_id(6);
        KernelCore::give_parent(child.core_mut(), parent);

        let packet = frame(&child, false);
        let Decoded::Native(got) = decode_kernel(&types, 0, None, None, &packet).unwrap() else {
            panic!("expected a native kernel");
        };
        assert!(got.core().carries_parent());
        let ParentLink::Owned(p) = got.core().parent() else {
            panic!("expected an owned parent");
        };
        assert_eq!(p.core().id(), 5);
        assert_eq!(p.downcast_ref::<Echo>().unwrap().text, "parent");
    }

    #[test]
    fn foreign_bytes_pass_through_untouched() {
        let types = registry();
        let mut k = Echo {
            core: KernelCore::default(),
            text: "opaque".into(),
        };
        k.core_mut().set_id(3);
        k.core_mut().set_target_application(42);
        let packet = frame(&k, false);

        // this node is application 0; application 42 is foreign to it
        let Decoded::Foreign(fk) = decode_kernel(&types, 0, None, None, &packet).unwrap() else {
            panic!("expected a foreign kernel");
        };
        assert_eq!(fk.header().application, 42);
        assert_eq!(fk.core().id(), 3);

        // re-encoding must reproduce the original packet
        let out = frame(fk.as_ref(), false);
        assert_eq!(out, packet);
    }
}
