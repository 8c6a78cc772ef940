// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-interface discoverer: a resident kernel that probes
//! candidate superiors in iterator order, answers probes from would-be
//! subordinates, floods resource updates along the tree edges, and
//! persists its hierarchy to the cache directory.

use crate::hierarchy::{Hierarchy, HierarchyNode};
use crate::iterator::TreeHierarchyIterator;
use crate::probe::{DiscoveryTimer, HierarchyUpdate, Probe};
use ipnet::Ipv4Net;
use kernel::{
    Encoder, Fabric, Kernel, KernelCore, KernelPtr, Phase, Principal, ResourceVector, ReturnCode,
    SocketAddress, MAIN_KERNEL_ID,
};
use remote::{SocketEvent, SocketEventKind, SocketPipelineHandle};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The discoverer's side-channel into the socket pipeline for client
/// bookkeeping; a trait so tests can observe it.
pub trait ClientControl: Send + Sync {
    fn add_client(&self, address: SocketAddress, resources: ResourceVector);
    fn stop_client(&self, address: SocketAddress);
    fn set_client_weight(&self, address: SocketAddress, weight: u64);
}

impl ClientControl for SocketPipelineHandle {
    fn add_client(&self, address: SocketAddress, resources: ResourceVector) {
        SocketPipelineHandle::add_client(self, address, resources);
    }

    fn stop_client(&self, address: SocketAddress) {
        SocketPipelineHandle::stop_client(self, address);
    }

    fn set_client_weight(&self, address: SocketAddress, weight: u64) {
        SocketPipelineHandle::set_client_weight(self, address, weight);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiscovererState {
    Initial,
    Waiting,
    Probing,
}

#[derive(Debug, Clone)]
pub struct DiscovererConfig {
    pub fanout: u64,
    pub scan_interval: Duration,
    pub max_attempts: u32,
    pub cache_directory: PathBuf,
}

impl Default for DiscovererConfig {
    fn default() -> Self {
        Self {
            fanout: 2,
            scan_interval: Duration::from_secs(30),
            max_attempts: 3,
            cache_directory: PathBuf::from("/var/lib/lattice"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ProbeVerdict {
    AddSubordinate,
    RemoveSubordinate,
    Reject,
    Retain,
}

impl fmt::Display for ProbeVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeVerdict::AddSubordinate => "add",
            ProbeVerdict::RemoveSubordinate => "remove",
            ProbeVerdict::Reject => "reject",
            ProbeVerdict::Retain => "retain",
        };
        f.write_str(name)
    }
}

pub struct Discoverer {
    core: KernelCore,
    config: DiscovererConfig,
    hierarchy: Hierarchy,
    iterator: TreeHierarchyIterator,
    candidate: Option<Ipv4Addr>,
    attempts: u32,
    state: DiscovererState,
    clients: Arc<dyn ClientControl>,
}

impl fmt::Debug for Discoverer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discoverer")
            .field("hierarchy", &self.hierarchy)
            .field("state", &self.state)
            .field("candidate", &self.candidate)
            .finish_non_exhaustive()
    }
}

impl Discoverer {
    /// `instance_id` is the registry slot the main kernel reserved for
    /// this discoverer.
    #[must_use]
    pub fn new(
        instance_id: u64,
        net: Ipv4Net,
        port: u16,
        config: DiscovererConfig,
        clients: Arc<dyn ClientControl>,
    ) -> Self {
        let mut iterator = TreeHierarchyIterator::new(net, config.fanout);
        let candidate = iterator.next();
        let mut core = KernelCore::default();
        core.set_id(instance_id);
        core.set_resident(true);
        Self {
            core,
            config,
            hierarchy: Hierarchy::new(net, port),
            iterator,
            candidate,
            attempts: 0,
            state: DiscovererState::Initial,
            clients,
        }
    }

    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    #[must_use]
    pub fn state(&self) -> DiscovererState {
        self.state
    }

    #[must_use]
    pub fn net(&self) -> Ipv4Net {
        self.hierarchy.net()
    }

    /// Refresh this node's own resource vector, flooding the change.
    pub fn set_resources(&mut self, resources: ResourceVector, fabric: &Fabric) {
        if self.hierarchy.set_resources(resources) {
            self.broadcast_hierarchy(None, fabric);
        }
    }

    /// Load the cached hierarchy and reconnect to the last superior.
    pub fn read_cache(&mut self) {
        match Hierarchy::read_cache(
            self.hierarchy.net(),
            self.hierarchy.port(),
            &self.config.cache_directory,
        ) {
            Ok(Some(cached)) => {
                info!(hierarchy = %cached, "hierarchy restored from cache");
                if let Some((address, node)) = cached.superior() {
                    self.clients.add_client(address.clone(), *node.resources());
                }
                self.hierarchy = cached;
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "failed to read hierarchy cache"),
        }
    }

    fn reset_iterator(&mut self) {
        self.iterator.reset();
        self.candidate = self.iterator.next();
        self.attempts = 0;
    }

    fn advance_iterator(&mut self) {
        self.attempts = 0;
        self.candidate = self.iterator.next();
    }

    /// Probe the current candidate, or go to sleep when the iterator is
    /// exhausted.
    fn discover(&mut self, fabric: &Fabric) {
        let Some(addr) = self.candidate else {
            self.reset_iterator();
            debug!(net = %self.net(), "all candidate superiors probed");
            self.discover_later(fabric);
            return;
        };
        let new_superior =
            SocketAddress::Ipv4(SocketAddrV4::new(addr, self.hierarchy.port()));
        let old_superior = self.hierarchy.superior_socket_address().cloned();
        debug!(net = %self.net(), candidate = %new_superior, attempts = self.attempts, "probe");
        self.state = DiscovererState::Probing;
        let mut probe = Box::new(Probe::new(self.net(), old_superior, new_superior.clone()));
        self.core.adopt(fabric.ids(), probe.core_mut());
        probe.core_mut().set_phase(Phase::PointToPoint);
        probe.core_mut().set_destination(Some(new_superior));
        probe
            .core_mut()
            .set_principal(Principal::Id(MAIN_KERNEL_ID));
        fabric.remote().send(probe);
        self.attempts += 1;
        if self.attempts >= self.config.max_attempts.max(1) {
            self.advance_iterator();
        }
    }

    /// Re-probe after the scan interval.
    fn discover_later(&mut self, fabric: &Fabric) {
        self.state = DiscovererState::Waiting;
        let mut timer = Box::new(DiscoveryTimer::default());
        timer.core_mut().set_phase(Phase::PointToPoint);
        timer
            .core_mut()
            .set_principal(Principal::Id(self.core.id()));
        fabric
            .local()
            .send_after(self.config.scan_interval, timer);
    }

    fn on_timer(&mut self, fabric: &Fabric) {
        // advisory: a timer firing while probing is a no-op
        if self.state != DiscovererState::Waiting {
            return;
        }
        if self.hierarchy.has_superior() {
            self.reset_iterator();
        }
        match self.candidate {
            Some(addr) => {
                let best =
                    SocketAddress::Ipv4(SocketAddrV4::new(addr, self.hierarchy.port()));
                if self.hierarchy.superior_socket_address() != Some(&best) {
                    self.discover(fabric);
                } else {
                    self.discover_later(fabric);
                }
            }
            None => self.discover(fabric),
        }
    }

    /// Subordinate side: a peer probes us as its new (or old) superior.
    fn update_subordinates(&mut self, mut probe: Box<Probe>, fabric: &Fabric) {
        let source = probe.core().source().cloned();
        let verdict = self.judge_probe(&probe, source.as_ref());
        debug!(net = %self.net(), %verdict, subordinate = ?source, "probe received");
        let mut total = ResourceVector::default();
        if let Some(src) = source {
            match verdict {
                ProbeVerdict::AddSubordinate => {
                    total = self.hierarchy.total_resources();
                    self.add_subordinate(src, fabric);
                }
                ProbeVerdict::RemoveSubordinate => {
                    self.remove_subordinate(&src, fabric);
                    total = self.hierarchy.total_resources();
                }
                ProbeVerdict::Reject | ProbeVerdict::Retain => {}
            }
        }
        probe.set_superior_resources(total);
        let code = if verdict == ProbeVerdict::Reject {
            ReturnCode::Error
        } else {
            ReturnCode::Success
        };
        let reply_to = probe.core().source().cloned();
        let core = probe.core_mut();
        core.set_destination(reply_to);
        core.set_source(None);
        core.set_principal(Principal::None);
        core.return_to_parent(code);
        fabric.remote().send(probe);
    }

    fn judge_probe(&self, probe: &Probe, source: Option<&SocketAddress>) -> ProbeVerdict {
        if source.is_some() && source == self.hierarchy.superior_socket_address() {
            // our own superior may not become our subordinate
            return ProbeVerdict::Reject;
        }
        if probe.old_superior() != probe.new_superior() {
            let own = self.hierarchy.socket_address();
            if probe.new_superior() == Some(&own) {
                return ProbeVerdict::AddSubordinate;
            }
            if probe.old_superior() == Some(&own) {
                return ProbeVerdict::RemoveSubordinate;
            }
        }
        ProbeVerdict::Retain
    }

    /// Superior side: our own probe came back.
    fn update_superior(&mut self, probe: Box<Probe>, fabric: &Fabric) {
        if probe.core().return_code() != ReturnCode::Success {
            debug!(
                net = %self.net(),
                candidate = ?probe.new_superior(),
                code = %probe.core().return_code(),
                "probe rejected"
            );
            self.discover(fabric);
            return;
        }
        let old = probe.old_superior().cloned();
        let new = probe.new_superior().cloned();
        let responder = probe.core().source().cloned();
        // only the new superior's own answer seals the adoption; the
        // old superior acknowledging a courtesy probe must not
        let from_new = responder.is_some() && responder == new;
        if old != new && from_new {
            if let Some(old) = &old {
                self.clients.stop_client(old.clone());
            }
            if let Some(new) = new.clone() {
                info!(net = %self.net(), superior = %new, attempts = self.attempts,
                      weight = probe.superior_resources().nodes(), "superior selected");
                self.add_superior(new, *probe.superior_resources(), fabric);
            }
            if let (Some(old), Some(new)) = (old, new) {
                // courtesy probe so the old superior forgets us
                let mut courtesy =
                    Box::new(Probe::new(self.net(), Some(old.clone()), new));
                self.core.adopt(fabric.ids(), courtesy.core_mut());
                courtesy.core_mut().set_phase(Phase::PointToPoint);
                courtesy.core_mut().set_destination(Some(old));
                courtesy
                    .core_mut()
                    .set_principal(Principal::Id(MAIN_KERNEL_ID));
                fabric.remote().send(courtesy);
            }
        }
        // look for a better superior after a while
        self.discover_later(fabric);
    }

    fn add_superior(&mut self, address: SocketAddress, resources: ResourceVector, fabric: &Fabric) {
        let node = HierarchyNode::new(resources);
        if self.hierarchy.add_superior(address.clone(), node) {
            self.clients.add_client(address.clone(), resources);
            self.broadcast_hierarchy(Some(&address), fabric);
        }
    }

    fn add_subordinate(&mut self, address: SocketAddress, fabric: &Fabric) {
        if self.hierarchy.add_subordinate(address.clone()) {
            self.broadcast_hierarchy(Some(&address), fabric);
        }
    }

    fn remove_subordinate(&mut self, address: &SocketAddress, fabric: &Fabric) {
        if self.hierarchy.remove_subordinate(address) {
            self.broadcast_hierarchy(None, fabric);
        }
    }

    fn remove_superior(&mut self, fabric: &Fabric) {
        if self.hierarchy.remove_superior() {
            self.broadcast_hierarchy(None, fabric);
        }
    }

    /// Send every neighbour (except the one that caused the change) the
    /// total resources minus its own contribution, then refresh the
    /// cache.
    fn broadcast_hierarchy(&mut self, ignored: Option<&SocketAddress>, fabric: &Fabric) {
        let total = self.hierarchy.total_resources();
        let updates: Vec<(SocketAddress, ResourceVector)> = self
            .hierarchy
            .subordinates()
            .iter()
            .filter(|(address, _)| Some(*address) != ignored)
            .map(|(address, node)| (address.clone(), total.saturating_sub(node.resources())))
            .chain(
                self.hierarchy
                    .superior()
                    .filter(|(address, _)| Some(address) != ignored)
                    .map(|(address, node)| {
                        (address.clone(), total.saturating_sub(node.resources()))
                    }),
            )
            .collect();
        for (address, resources) in updates {
            self.send_resources(address, resources, fabric);
        }
        self.write_cache();
    }

    fn send_resources(
        &mut self,
        destination: SocketAddress,
        resources: ResourceVector,
        fabric: &Fabric,
    ) {
        let mut update = Box::new(HierarchyUpdate::new(self.net(), resources));
        self.core.adopt(fabric.ids(), update.core_mut());
        update.core_mut().set_phase(Phase::PointToPoint);
        update.core_mut().set_destination(Some(destination));
        update
            .core_mut()
            .set_principal(Principal::Id(MAIN_KERNEL_ID));
        fabric.remote().send(update);
    }

    /// A neighbour flooded us its side's subtree resources.
    fn update_weights(&mut self, update: &HierarchyUpdate, fabric: &Fabric) {
        if update.core().moves_downstream()
            && update.core().return_code() != ReturnCode::Success
        {
            warn!(
                net = %self.net(),
                peer = ?update.core().source(),
                code = %update.core().return_code(),
                "hierarchy update failed"
            );
            return;
        }
        let Some(source) = update.core().source().cloned() else {
            return;
        };
        let resources = *update.resources();
        let changed = if self.hierarchy.superior_is(&source) {
            self.hierarchy.set_superior_resources(resources)
        } else if self.hierarchy.has_subordinate(&source) {
            self.hierarchy.set_subordinate_resources(&source, resources)
        } else {
            false
        };
        if changed {
            debug!(net = %self.net(), peer = %source, resources = %resources, "weight updated");
            self.clients
                .set_client_weight(source.clone(), resources.nodes());
            self.broadcast_hierarchy(Some(&source), fabric);
        }
    }

    fn on_socket_event(&mut self, event: &SocketEvent, fabric: &Fabric) {
        match event.kind() {
            SocketEventKind::ClientRemoved => {
                if self.hierarchy.superior_is(event.address()) {
                    info!(net = %self.net(), superior = %event.address(), "superior lost");
                    self.remove_superior(fabric);
                    self.reset_iterator();
                    self.discover(fabric);
                } else if self.hierarchy.has_subordinate(event.address()) {
                    debug!(net = %self.net(), subordinate = %event.address(), "subordinate lost");
                    self.remove_subordinate(event.address(), fabric);
                }
            }
            SocketEventKind::ClientAdded
            | SocketEventKind::ServerAdded
            | SocketEventKind::ServerRemoved => {}
        }
    }

    fn write_cache(&self) {
        match self.hierarchy.write_cache(&self.config.cache_directory) {
            Ok(path) => debug!(path = %path.display(), hierarchy = %self.hierarchy, "cache written"),
            Err(err) => warn!(%err, "failed to write hierarchy cache"),
        }
    }
}

impl Kernel for Discoverer {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        0
    }

    fn encode(&self, _enc: &mut Encoder<'_>) {
        // resident kernels never travel
    }

    fn act(&mut self, fabric: &Fabric) {
        self.discover(fabric);
    }

    fn react(&mut self, child: KernelPtr, fabric: &Fabric) {
        let child = match child.downcast::<DiscoveryTimer>() {
            Ok(_) => {
                self.on_timer(fabric);
                return;
            }
            Err(other) => other,
        };
        let child = match child.downcast::<Probe>() {
            Ok(probe) => {
                match probe.core().phase() {
                    Phase::Downstream => self.update_superior(probe, fabric),
                    Phase::PointToPoint => self.update_subordinates(probe, fabric),
                    _ => {}
                }
                return;
            }
            Err(other) => other,
        };
        let child = match child.downcast::<HierarchyUpdate>() {
            Ok(update) => {
                self.update_weights(&update, fabric);
                return;
            }
            Err(other) => other,
        };
        match child.downcast::<SocketEvent>() {
            Ok(event) => self.on_socket_event(&event, fabric),
            Err(other) => {
                debug!(net = %self.net(), id = other.core().id(), "unexpected kernel ignored");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel::{
        FabricParts, ForeignKernel, IdGenerator, InstanceRegistry, NullPipeline, Pipeline,
        ShutdownGate, TypeRegistry,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<KernelPtr>>,
    }

    impl Pipeline for Capture {
        fn send(&self, k: KernelPtr) {
            self.sent.lock().push(k);
        }

        fn forward_foreign(&self, _fk: Box<ForeignKernel>) {}
    }

    #[derive(Default)]
    struct ClientLog {
        stopped: Mutex<Vec<SocketAddress>>,
        weights: Mutex<Vec<(SocketAddress, u64)>>,
        added: Mutex<Vec<SocketAddress>>,
    }

    impl ClientControl for ClientLog {
        fn add_client(&self, address: SocketAddress, _resources: ResourceVector) {
            self.added.lock().push(address);
        }

        fn stop_client(&self, address: SocketAddress) {
            self.stopped.lock().push(address);
        }

        fn set_client_weight(&self, address: SocketAddress, weight: u64) {
            self.weights.lock().push((address, weight));
        }
    }

    struct Rig {
        remote: Arc<Capture>,
        local: Arc<Capture>,
        clients: Arc<ClientLog>,
        fabric: Arc<Fabric>,
        tmp: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let remote = Arc::new(Capture::default());
        let local = Arc::new(Capture::default());
        let clients = Arc::new(ClientLog::default());
        let fabric = Fabric::new(FabricParts {
            local: local.clone(),
            remote: remote.clone(),
            process: Arc::new(NullPipeline),
            control: Arc::new(NullPipeline),
            types: Arc::new(TypeRegistry::new()),
            instances: Arc::new(InstanceRegistry::new()),
            ids: Arc::new(IdGenerator::unbounded()),
            this_application: 0,
            gate: ShutdownGate::new(),
        });
        Rig {
            remote,
            local,
            clients,
            fabric,
            tmp: tempfile::tempdir().unwrap(),
        }
    }

    fn discoverer(rig: &Rig, last: u8) -> Discoverer {
        let config = DiscovererConfig {
            fanout: 2,
            scan_interval: Duration::from_millis(50),
            max_attempts: 1,
            cache_directory: rig.tmp.path().to_path_buf(),
        };
        Discoverer::new(
            2,
            format!("10.0.0.{last}/24").parse().unwrap(),
            33333,
            config,
            rig.clients.clone(),
        )
    }

    fn addr(last: u8) -> SocketAddress {
        SocketAddress::Ipv4(SocketAddrV4::new([10, 0, 0, last].into(), 33333))
    }

    #[test]
    fn first_probe_targets_the_parent_candidate() {
        let rig = rig();
        let mut d = discoverer(&rig, 2);
        d.act(&rig.fabric);
        assert_eq!(d.state(), DiscovererState::Probing);
        let sent = rig.remote.sent.lock();
        assert_eq!(sent.len(), 1);
        let probe = sent[0].downcast_ref::<Probe>().unwrap();
        assert_eq!(probe.new_superior(), Some(&addr(1)));
        assert_eq!(probe.core().principal().id(), MAIN_KERNEL_ID);
        assert_eq!(probe.core().destination(), Some(&addr(1)));
    }

    #[test]
    fn root_node_waits_instead_of_probing() {
        let rig = rig();
        let mut d = discoverer(&rig, 1);
        d.act(&rig.fabric);
        assert_eq!(d.state(), DiscovererState::Waiting);
        // the timer kernel went to the local pipeline
        assert_eq!(rig.local.sent.lock().len(), 1);
        assert!(rig.remote.sent.lock().is_empty());
    }

    #[test]
    fn accepted_probe_adds_a_subordinate_and_reports_resources() {
        let rig = rig();
        let mut d = discoverer(&rig, 1);
        let mut probe = Box::new(Probe::new(
            "10.0.0.2/24".parse().unwrap(),
            None,
            addr(1),
        ));
        probe.core_mut().set_phase(Phase::PointToPoint);
        probe.core_mut().set_source(Some(addr(2)));
        d.react(probe, &rig.fabric);

        assert!(d.hierarchy().has_subordinate(&addr(2)));
        let sent = rig.remote.sent.lock();
        // the reply is the last kernel sent (updates may precede it)
        let reply = sent
            .iter()
            .find_map(|k| k.downcast_ref::<Probe>())
            .unwrap();
        assert_eq!(reply.core().return_code(), ReturnCode::Success);
        assert_eq!(reply.core().destination(), Some(&addr(2)));
        // total resources before the add: just this node
        assert_eq!(reply.superior_resources().nodes(), 1);
    }

    #[test]
    fn probe_from_own_superior_is_rejected() {
        let rig = rig();
        let mut d = discoverer(&rig, 2);
        d.add_superior(addr(1), ResourceVector::for_node(1), &rig.fabric);
        rig.remote.sent.lock().clear();

        // the superior claims we should adopt it as a subordinate
        let mut probe = Box::new(Probe::new(
            "10.0.0.1/24".parse().unwrap(),
            None,
            addr(2),
        ));
        probe.core_mut().set_phase(Phase::PointToPoint);
        probe.core_mut().set_source(Some(addr(1)));
        d.react(probe, &rig.fabric);

        let sent = rig.remote.sent.lock();
        let reply = sent
            .iter()
            .find_map(|k| k.downcast_ref::<Probe>())
            .unwrap();
        assert_eq!(reply.core().return_code(), ReturnCode::Error);
        // no hierarchy change either way
        assert!(!d.hierarchy().has_subordinate(&addr(1)));
        assert!(d.hierarchy().superior_is(&addr(1)));
    }

    #[test]
    fn successful_reply_adopts_the_superior() {
        let rig = rig();
        let mut d = discoverer(&rig, 2);
        d.act(&rig.fabric);
        rig.remote.sent.lock().clear();

        let mut reply = Box::new(Probe::new("10.0.0.2/24".parse().unwrap(), None, addr(1)));
        reply.set_superior_resources(ResourceVector::for_node(4));
        reply.core_mut().set_phase(Phase::Downstream);
        reply.core_mut().set_return_code(ReturnCode::Success);
        reply.core_mut().set_source(Some(addr(1)));
        d.react(reply, &rig.fabric);

        assert!(d.hierarchy().superior_is(&addr(1)));
        assert_eq!(d.state(), DiscovererState::Waiting);
        assert_eq!(rig.clients.added.lock().as_slice(), &[addr(1)]);
        // cache written with the new superior
        let cached = Hierarchy::read_cache(d.net(), 33333, rig.tmp.path())
            .unwrap()
            .unwrap();
        assert!(cached.superior_is(&addr(1)));
    }

    #[test]
    fn changing_superior_notifies_the_old_one() {
        let rig = rig();
        let mut d = discoverer(&rig, 2);
        d.add_superior(addr(3), ResourceVector::for_node(1), &rig.fabric);
        rig.remote.sent.lock().clear();

        let mut reply = Box::new(Probe::new(
            "10.0.0.2/24".parse().unwrap(),
            Some(addr(3)),
            addr(1),
        ));
        reply.core_mut().set_phase(Phase::Downstream);
        reply.core_mut().set_return_code(ReturnCode::Success);
        reply.core_mut().set_source(Some(addr(1)));
        d.react(reply, &rig.fabric);

        assert!(d.hierarchy().superior_is(&addr(1)));
        assert_eq!(rig.clients.stopped.lock().as_slice(), &[addr(3)]);
        let sent = rig.remote.sent.lock();
        let courtesy = sent
            .iter()
            .filter_map(|k| k.downcast_ref::<Probe>())
            .find(|p| p.core().destination() == Some(&addr(3)))
            .expect("courtesy probe to the old superior");
        assert_eq!(courtesy.old_superior(), Some(&addr(3)));
        assert_eq!(courtesy.new_superior(), Some(&addr(1)));
    }

    #[test]
    fn courtesy_reply_does_not_reopen_adoption() {
        let rig = rig();
        let mut d = discoverer(&rig, 2);
        d.add_superior(addr(1), ResourceVector::for_node(1), &rig.fabric);
        rig.remote.sent.lock().clear();
        rig.clients.stopped.lock().clear();

        // the OLD superior acknowledging a courtesy probe must not
        // re-run the adoption or spawn another courtesy probe
        let mut reply = Box::new(Probe::new(
            "10.0.0.2/24".parse().unwrap(),
            Some(addr(3)),
            addr(1),
        ));
        reply.core_mut().set_phase(Phase::Downstream);
        reply.core_mut().set_return_code(ReturnCode::Success);
        reply.core_mut().set_source(Some(addr(3)));
        d.react(reply, &rig.fabric);

        let sent = rig.remote.sent.lock();
        assert!(sent.iter().all(|k| k.downcast_ref::<Probe>().is_none()));
        assert!(rig.clients.stopped.lock().is_empty());
        assert!(d.hierarchy().superior_is(&addr(1)));
    }

    #[test]
    fn weight_update_floods_onward_but_converges() {
        let rig = rig();
        let mut d = discoverer(&rig, 2);
        d.add_superior(addr(1), ResourceVector::for_node(1), &rig.fabric);
        d.add_subordinate(addr(4), &rig.fabric);
        rig.remote.sent.lock().clear();

        let mut update = Box::new(HierarchyUpdate::new(
            "10.0.0.4/24".parse().unwrap(),
            ResourceVector::for_node(3),
        ));
        update.core_mut().set_phase(Phase::PointToPoint);
        update.core_mut().set_source(Some(addr(4)));
        d.react(update, &rig.fabric);
        assert_eq!(
            rig.clients.weights.lock().last(),
            Some(&(addr(4), 1))
        );
        // the superior hears about the grown subtree, the cause does not
        let sent: Vec<_> = {
            let lock = rig.remote.sent.lock();
            lock.iter()
                .filter_map(|k| k.downcast_ref::<HierarchyUpdate>())
                .map(|u| u.core().destination().cloned().unwrap())
                .collect()
        };
        assert!(sent.contains(&addr(1)));
        assert!(!sent.contains(&addr(4)));

        // the identical update again: no change, no re-broadcast
        rig.remote.sent.lock().clear();
        let mut update = Box::new(HierarchyUpdate::new(
            "10.0.0.4/24".parse().unwrap(),
            ResourceVector::for_node(3),
        ));
        update.core_mut().set_phase(Phase::PointToPoint);
        update.core_mut().set_source(Some(addr(4)));
        d.react(update, &rig.fabric);
        assert!(rig.remote.sent.lock().is_empty());
    }

    #[test]
    fn losing_the_superior_restarts_discovery() {
        let rig = rig();
        let mut d = discoverer(&rig, 2);
        d.add_superior(addr(1), ResourceVector::for_node(1), &rig.fabric);
        rig.remote.sent.lock().clear();

        let mut ev = Box::new(SocketEvent::new(SocketEventKind::ClientRemoved, addr(1)));
        ev.core_mut().set_phase(Phase::PointToPoint);
        d.react(ev, &rig.fabric);

        assert!(!d.hierarchy().has_superior());
        assert_eq!(d.state(), DiscovererState::Probing);
        let sent = rig.remote.sent.lock();
        assert!(
            sent.iter()
                .filter_map(|k| k.downcast_ref::<Probe>())
                .any(|p| p.new_superior() == Some(&addr(1)))
        );
    }
}
