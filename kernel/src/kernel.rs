// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The kernel trait and its header state.
//!
//! Kernels are trait objects; concrete types downcast at dispatch sites.
//! Every kernel embeds a [`KernelCore`] carrying the routing and
//! lifecycle fields of the wire header plus the in-process parent and
//! principal links. The parent link is *either* an owned kernel (the
//! `carries-parent` case) *or* an ID resolved through the instance
//! registry — the enum makes holding both impossible.

use crate::address::SocketAddress;
use crate::fabric::Fabric;
use crate::ids::IdGenerator;
use crate::wire::{Encoder, WireError};
use bitflags::bitflags;
use downcast_rs::{Downcast, impl_downcast};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Wire header flags.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct KernelFlags: u16 {
        /// The kernel owns its parent and the parent travels with it.
        const CARRIES_PARENT = 0x01;
        /// The parent link is an ID through the instance registry.
        const PARENT_IS_ID = 0x02;
        /// The kernel must not be dropped by queue teardown.
        const DO_NOT_DELETE = 0x04;
        /// Source and destination addresses are present in the header.
        const PREPEND_SOURCE_AND_DESTINATION = 0x08;
        /// The application ID field is present in the header.
        const HAS_APPLICATION = 0x10;
    }
}

/// Direction of travel of a kernel.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Towards its computation site.
    #[default]
    Upstream = 0,
    /// Back towards its parent.
    Downstream = 1,
    /// To a specific principal on a specific node.
    PointToPoint = 2,
    /// To every connected peer.
    Broadcast = 3,
}

impl TryFrom<u8> for Phase {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Phase::Upstream),
            1 => Ok(Phase::Downstream),
            2 => Ok(Phase::PointToPoint),
            3 => Ok(Phase::Broadcast),
            other => Err(WireError::BadPhase(other)),
        }
    }
}

/// Result a kernel reports to its parent.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ReturnCode {
    #[default]
    Undefined = 0,
    Success = 1,
    Error = 2,
    /// The socket pipeline had no upstream peer to schedule on.
    NoUpstreamServers = 3,
    /// The peer link failed and recovery re-routed the kernel.
    EndpointNotConnected = 4,
    /// The instance registry had no entry for the principal ID.
    NoPrincipalFound = 5,
}

impl TryFrom<u16> for ReturnCode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        match value {
            0 => Ok(ReturnCode::Undefined),
            1 => Ok(ReturnCode::Success),
            2 => Ok(ReturnCode::Error),
            3 => Ok(ReturnCode::NoUpstreamServers),
            4 => Ok(ReturnCode::EndpointNotConnected),
            5 => Ok(ReturnCode::NoPrincipalFound),
            other => Err(WireError::BadReturnCode(other)),
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReturnCode::Undefined => "undefined",
            ReturnCode::Success => "success",
            ReturnCode::Error => "error",
            ReturnCode::NoUpstreamServers => "no-upstream-servers-available",
            ReturnCode::EndpointNotConnected => "endpoint-not-connected",
            ReturnCode::NoPrincipalFound => "no-principal-found",
        };
        f.write_str(name)
    }
}

/// Link from a kernel to the parent awaiting it.
#[derive(Debug, Default)]
pub enum ParentLink {
    #[default]
    None,
    /// The parent lives in the instance registry under this ID.
    Id(u64),
    /// The kernel owns its parent; recovering the kernel recovers it.
    Owned(KernelPtr),
}

impl ParentLink {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, ParentLink::None)
    }

    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self, ParentLink::Owned(_))
    }
}

/// The principal a point-to-point kernel is delivered to: an ID until the
/// receiving node resolves it, a live instance afterwards — never both.
#[derive(Debug, Default, Clone)]
pub enum Principal {
    #[default]
    None,
    Id(u64),
    Instance(InstanceRef),
}

impl Principal {
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Principal::Id(id) => *id,
            _ => 0,
        }
    }
}

/// Header and lifecycle state embedded in every kernel.
#[derive(Debug, Default)]
pub struct KernelCore {
    id: u64,
    source: Option<SocketAddress>,
    destination: Option<SocketAddress>,
    source_application: u64,
    target_application: u64,
    phase: Phase,
    return_code: ReturnCode,
    flags: KernelFlags,
    parent: ParentLink,
    principal: Principal,
    children: u32,
    redeliveries: u8,
    resident: bool,
    foreign: bool,
}

impl KernelCore {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn has_id(&self) -> bool {
        self.id != 0
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Assign an ID from the generator if the kernel has none yet.
    pub fn ensure_id(&mut self, ids: &IdGenerator) -> u64 {
        if self.id == 0 {
            self.id = ids.next_id();
        }
        self.id
    }

    #[must_use]
    pub fn source(&self) -> Option<&SocketAddress> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, source: Option<SocketAddress>) {
        self.source = source;
    }

    #[must_use]
    pub fn destination(&self) -> Option<&SocketAddress> {
        self.destination.as_ref()
    }

    pub fn set_destination(&mut self, destination: Option<SocketAddress>) {
        self.destination = destination;
    }

    #[must_use]
    pub fn source_application(&self) -> u64 {
        self.source_application
    }

    pub fn set_source_application(&mut self, id: u64) {
        self.source_application = id;
    }

    #[must_use]
    pub fn target_application(&self) -> u64 {
        self.target_application
    }

    pub fn set_target_application(&mut self, id: u64) {
        self.target_application = id;
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    #[must_use]
    pub fn moves_upstream(&self) -> bool {
        self.phase == Phase::Upstream
    }

    #[must_use]
    pub fn moves_downstream(&self) -> bool {
        self.phase == Phase::Downstream
    }

    #[must_use]
    pub fn moves_somewhere(&self) -> bool {
        self.phase == Phase::PointToPoint
    }

    #[must_use]
    pub fn moves_everywhere(&self) -> bool {
        self.phase == Phase::Broadcast
    }

    #[must_use]
    pub fn return_code(&self) -> ReturnCode {
        self.return_code
    }

    pub fn set_return_code(&mut self, code: ReturnCode) {
        self.return_code = code;
    }

    /// Turn the kernel around: it now travels downstream carrying `code`
    /// to its parent.
    pub fn return_to_parent(&mut self, code: ReturnCode) {
        self.return_code = code;
        self.phase = Phase::Downstream;
    }

    #[must_use]
    pub fn flags(&self) -> KernelFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: KernelFlags) {
        self.flags = flags;
    }

    pub fn insert_flags(&mut self, flags: KernelFlags) {
        self.flags |= flags;
    }

    #[must_use]
    pub fn carries_parent(&self) -> bool {
        self.parent.is_owned()
    }

    #[must_use]
    pub fn parent(&self) -> &ParentLink {
        &self.parent
    }

    pub fn set_parent(&mut self, parent: ParentLink) {
        self.parent = parent;
    }

    pub fn parent_mut(&mut self) -> &mut ParentLink {
        &mut self.parent
    }

    pub fn take_parent(&mut self) -> ParentLink {
        std::mem::take(&mut self.parent)
    }

    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = principal;
    }

    pub fn take_principal(&mut self) -> Principal {
        std::mem::take(&mut self.principal)
    }

    /// Make `child` ours: the child gets a parent-ID link back to us and
    /// we count one more outstanding child.
    pub fn adopt(&mut self, ids: &IdGenerator, child: &mut KernelCore) {
        let id = self.ensure_id(ids);
        child.ensure_id(ids);
        child.parent = ParentLink::Id(id);
        child.insert_flags(KernelFlags::PARENT_IS_ID);
        self.children += 1;
    }

    /// Hand `child` its parent by value; the child now owns it.
    pub fn give_parent(child: &mut KernelCore, parent: KernelPtr) {
        child.parent = ParentLink::Owned(parent);
        child.insert_flags(KernelFlags::CARRIES_PARENT);
    }

    #[must_use]
    pub fn children(&self) -> u32 {
        self.children
    }

    pub fn child_returned(&mut self) {
        self.children = self.children.saturating_sub(1);
    }

    /// Count one failed local delivery attempt; the dispatcher retries
    /// a returning kernel briefly while its parent is being parked in
    /// the registry by another worker.
    pub fn bump_redeliveries(&mut self) -> u8 {
        self.redeliveries = self.redeliveries.saturating_add(1);
        self.redeliveries
    }

    /// Resident kernels (the main kernel, discoverers) stay in the
    /// instance registry for the life of the process.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub fn set_resident(&mut self, resident: bool) {
        self.resident = resident;
    }

    #[must_use]
    pub fn is_foreign(&self) -> bool {
        self.foreign
    }

    pub fn set_foreign(&mut self, foreign: bool) {
        self.foreign = foreign;
    }
}

/// A unit of work. `act` runs when the kernel reaches its computation
/// site; `react` runs on a parent when one of its children returns.
pub trait Kernel: Downcast + Send + fmt::Debug {
    fn core(&self) -> &KernelCore;

    fn core_mut(&mut self) -> &mut KernelCore;

    /// Stable numeric type code used to rehydrate the kernel on receipt.
    fn wire_type(&self) -> u16;

    /// Serialise the payload (header fields are written by the codec).
    fn encode(&self, enc: &mut Encoder<'_>);

    fn act(&mut self, fabric: &Fabric) {
        let _ = fabric;
    }

    fn react(&mut self, child: KernelPtr, fabric: &Fabric) {
        let _ = (child, fabric);
    }
}

impl_downcast!(Kernel);

pub type KernelPtr = Box<dyn Kernel>;

/// A live kernel addressable through the instance registry.
pub type InstanceRef = Arc<Mutex<KernelPtr>>;
