// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Wire kernels of the discovery protocol.
//!
//! A `Probe` announces "I want `new_superior` instead of
//! `old_superior`" and returns with the receiver's verdict and subtree
//! resources. A `HierarchyUpdate` floods one resource vector along a
//! tree edge. The `DiscoveryTimer` is local-only and re-arms the scan.

use ipnet::Ipv4Net;
use kernel::{
    Decoder, Encoder, Kernel, KernelCore, KernelPtr, ResourceVector, SocketAddress, TypeRegistry,
    WireError,
};

pub const PROBE_WIRE_TYPE: u16 = 1;
pub const HIERARCHY_WIRE_TYPE: u16 = 2;
/// Local-only; never registered.
pub const TIMER_WIRE_TYPE: u16 = 10;

/// Register the discovery kernels with a node's type registry.
pub fn register_types(types: &TypeRegistry) {
    let _ = types.register(PROBE_WIRE_TYPE, decode_probe);
    let _ = types.register(HIERARCHY_WIRE_TYPE, decode_hierarchy_update);
}

#[derive(Debug)]
pub struct Probe {
    core: KernelCore,
    ifaddr: Ipv4Net,
    old_superior: Option<SocketAddress>,
    new_superior: Option<SocketAddress>,
    superior_resources: ResourceVector,
}

impl Probe {
    #[must_use]
    pub fn new(
        ifaddr: Ipv4Net,
        old_superior: Option<SocketAddress>,
        new_superior: SocketAddress,
    ) -> Self {
        Self {
            core: KernelCore::default(),
            ifaddr,
            old_superior,
            new_superior: Some(new_superior),
            superior_resources: ResourceVector::default(),
        }
    }

    #[must_use]
    pub fn ifaddr(&self) -> Ipv4Net {
        self.ifaddr
    }

    #[must_use]
    pub fn old_superior(&self) -> Option<&SocketAddress> {
        self.old_superior.as_ref()
    }

    #[must_use]
    pub fn new_superior(&self) -> Option<&SocketAddress> {
        self.new_superior.as_ref()
    }

    /// Subtree resources of the answering superior, set on the reply.
    #[must_use]
    pub fn superior_resources(&self) -> &ResourceVector {
        &self.superior_resources
    }

    pub fn set_superior_resources(&mut self, resources: ResourceVector) {
        self.superior_resources = resources;
    }
}

impl Kernel for Probe {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        PROBE_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_net(self.ifaddr);
        enc.put_address(self.old_superior.as_ref());
        enc.put_address(self.new_superior.as_ref());
        enc.put_resources(&self.superior_resources);
    }
}

fn decode_probe(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
    Ok(Box::new(Probe {
        core: KernelCore::default(),
        ifaddr: dec.get_net()?,
        old_superior: dec.get_address()?,
        new_superior: dec.get_address()?,
        superior_resources: dec.get_resources()?,
    }))
}

#[derive(Debug)]
pub struct HierarchyUpdate {
    core: KernelCore,
    ifaddr: Ipv4Net,
    resources: ResourceVector,
}

impl HierarchyUpdate {
    #[must_use]
    pub fn new(ifaddr: Ipv4Net, resources: ResourceVector) -> Self {
        Self {
            core: KernelCore::default(),
            ifaddr,
            resources,
        }
    }

    #[must_use]
    pub fn ifaddr(&self) -> Ipv4Net {
        self.ifaddr
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceVector {
        &self.resources
    }
}

impl Kernel for HierarchyUpdate {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        HIERARCHY_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_net(self.ifaddr);
        enc.put_resources(&self.resources);
    }
}

fn decode_hierarchy_update(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
    Ok(Box::new(HierarchyUpdate {
        core: KernelCore::default(),
        ifaddr: dec.get_net()?,
        resources: dec.get_resources()?,
    }))
}

/// Periodic scan trigger; stays inside one process.
#[derive(Debug, Default)]
pub struct DiscoveryTimer {
    core: KernelCore,
}

impl Kernel for DiscoveryTimer {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        TIMER_WIRE_TYPE
    }

    fn encode(&self, _enc: &mut Encoder<'_>) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use kernel::codec::{Decoded, decode_kernel, encode_kernel};

    #[test]
    fn probe_survives_the_wire() {
        let types = TypeRegistry::new();
        register_types(&types);
        let mut probe = Probe::new(
            "10.0.0.2/24".parse().unwrap(),
            None,
            SocketAddress::Ipv4("10.0.0.1:33333".parse().unwrap()),
        );
        probe.set_superior_resources(ResourceVector::for_node(8));

        let mut out = BytesMut::new();
        encode_kernel(&probe, &mut out, false);
        let Decoded::Native(got) = decode_kernel(&types, 0, None, None, &out.freeze()).unwrap()
        else {
            panic!("expected a native kernel");
        };
        let got = got.downcast_ref::<Probe>().unwrap();
        assert_eq!(got.ifaddr(), probe.ifaddr());
        assert_eq!(got.old_superior(), None);
        assert_eq!(got.new_superior(), probe.new_superior());
        assert_eq!(got.superior_resources(), &ResourceVector::for_node(8));
    }
}
