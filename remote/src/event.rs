// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Event kernels the socket pipeline posts to resident kernels when its
//! connection or listener set changes. These never cross the wire; the
//! discoverer uses them to notice a vanished superior or subordinate.

use kernel::{Encoder, Kernel, KernelCore, SocketAddress};

/// Wire type reserved for the event kernel; it is never registered.
pub const SOCKET_EVENT_WIRE_TYPE: u16 = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketEventKind {
    ClientAdded,
    ClientRemoved,
    ServerAdded,
    ServerRemoved,
}

#[derive(Debug)]
pub struct SocketEvent {
    core: KernelCore,
    kind: SocketEventKind,
    address: SocketAddress,
}

impl SocketEvent {
    #[must_use]
    pub fn new(kind: SocketEventKind, address: SocketAddress) -> Self {
        Self {
            core: KernelCore::default(),
            kind,
            address,
        }
    }

    #[must_use]
    pub fn kind(&self) -> SocketEventKind {
        self.kind
    }

    #[must_use]
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }
}

impl Kernel for SocketEvent {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        SOCKET_EVENT_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        // local-only kernel; encoded form is never read back
        enc.put_address(Some(&self.address));
    }
}
