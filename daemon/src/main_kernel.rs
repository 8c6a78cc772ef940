// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The main daemon kernel: watches host interfaces, runs one
//! discoverer per managed interface, routes discovery kernels to the
//! right discoverer, and answers control queries.

use crate::control::{
    JobStatusRequest, PipelineStatusRequest, StatusRequest, SubmitRequest, TerminateRequest,
};
use crate::{EXIT_BIND, EXIT_SPAWN};
use args::Properties;
use discovery::{Discoverer, DiscovererConfig, Hierarchy, HierarchyUpdate, Probe};
use ipnet::Ipv4Net;
use kernel::{
    Encoder, Fabric, InstanceRef, Kernel, KernelCore, KernelPtr, Phase, Principal,
    ResourceVector, ReturnCode, MAIN_KERNEL_ID,
};
use parking_lot::Mutex;
use process::{ProcessEvent, ProcessEventKind, ProcessPipelineHandle};
use remote::{SocketEvent, SocketEventKind, SocketPipelineHandle};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Local-only; never registered.
pub const NETWORK_TIMER_WIRE_TYPE: u16 = 11;

#[derive(Debug, Default)]
struct NetworkTimer {
    core: KernelCore,
}

impl Kernel for NetworkTimer {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        NETWORK_TIMER_WIRE_TYPE
    }

    fn encode(&self, _enc: &mut Encoder<'_>) {}
}

pub struct MainConfig {
    pub props: Properties,
    pub remote: Arc<SocketPipelineHandle>,
    pub process: Arc<ProcessPipelineHandle>,
    pub control: Arc<SocketPipelineHandle>,
}

pub struct Main {
    core: KernelCore,
    props: Properties,
    remote: Arc<SocketPipelineHandle>,
    process: Arc<ProcessPipelineHandle>,
    control: Arc<SocketPipelineHandle>,
    discoverers: HashMap<Ipv4Net, (u64, InstanceRef)>,
    next_instance: u64,
    resources: ResourceVector,
}

impl std::fmt::Debug for Main {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Main")
            .field("interfaces", &self.discoverers.keys().collect::<Vec<_>>())
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl Main {
    #[must_use]
    pub fn new(config: MainConfig) -> Self {
        let mut core = KernelCore::default();
        core.set_id(MAIN_KERNEL_ID);
        core.set_resident(true);
        Self {
            core,
            props: config.props,
            remote: config.remote,
            process: config.process,
            control: config.control,
            discoverers: HashMap::new(),
            next_instance: MAIN_KERNEL_ID + 1,
            resources: ResourceVector::for_node(1),
        }
    }

    fn update_resources(&mut self) {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get() as u64);
        self.resources = ResourceVector::for_node(threads);
    }

    /// Interface addresses this daemon should manage right now.
    fn enumerate_interfaces(&self) -> Vec<Ipv4Net> {
        let candidates: Vec<Ipv4Net> = if self.props.interfaces.is_empty() {
            netdev::get_interfaces()
                .iter()
                .flat_map(|iface| iface.ipv4.iter())
                .filter_map(|net| Ipv4Net::new(net.addr(), net.prefix_len()).ok())
                .collect()
        } else {
            self.props.interfaces.clone()
        };
        candidates
            .into_iter()
            .filter(|net| {
                if !self.props.allowed.is_empty() {
                    self.props.allowed.iter().any(|a| a.contains(&net.addr()))
                } else {
                    let addr = net.addr();
                    !addr.is_loopback() && addr.is_private()
                }
            })
            .collect()
    }

    fn update_discoverers(&mut self, fabric: &Fabric) {
        let nets = self.enumerate_interfaces();
        let vanished: Vec<Ipv4Net> = self
            .discoverers
            .keys()
            .filter(|net| !nets.contains(net))
            .copied()
            .collect();
        for net in vanished {
            info!(%net, "interface vanished");
            self.remote.remove_server(net);
            if let Some((id, _)) = self.discoverers.remove(&net) {
                fabric.instances().remove(id);
            }
        }
        for net in nets {
            if self.discoverers.contains_key(&net) {
                continue;
            }
            info!(%net, "interface appeared");
            if let Err(err) = self.remote.add_server(net, self.props.port) {
                error!(%net, %err, "failed to bind server");
                fabric.gate().flag(EXIT_BIND);
                continue;
            }
            let id = self.alloc_instance_id(fabric);
            let config = DiscovererConfig {
                fanout: self.props.fanout,
                scan_interval: self.props.scan_interval,
                max_attempts: self.props.max_attempts,
                cache_directory: self.props.cache_dir.clone(),
            };
            let mut discoverer =
                Discoverer::new(id, net, self.props.port, config, self.remote.clone());
            discoverer.read_cache();
            let inst: InstanceRef = Arc::new(Mutex::new(Box::new(discoverer) as KernelPtr));
            fabric.instances().insert(id, inst.clone());
            self.discoverers.insert(net, (id, inst.clone()));
            fabric.local().activate(inst);
        }
        // keep every discoverer's own resource vector fresh
        for (_, inst) in self.discoverers.values() {
            let mut guard = inst.lock();
            if let Some(d) = guard.downcast_mut::<Discoverer>() {
                d.set_resources(self.resources, fabric);
            }
        }
    }

    fn alloc_instance_id(&mut self, fabric: &Fabric) -> u64 {
        if self.next_instance < kernel::ids::RESERVED_IDS {
            let id = self.next_instance;
            self.next_instance += 1;
            id
        } else {
            fabric.ids().next_id()
        }
    }

    fn send_timer(&self, fabric: &Fabric) {
        let mut timer = Box::new(NetworkTimer::default());
        timer.core_mut().set_phase(Phase::PointToPoint);
        timer
            .core_mut()
            .set_principal(Principal::Id(MAIN_KERNEL_ID));
        fabric
            .local()
            .send_after(self.props.interface_update_interval, timer);
    }

    /// Route a discovery kernel to the discoverer of the matching
    /// interface, or bounce it back with an error.
    fn forward_to_discoverer(&self, addr: IpAddr, mut k: KernelPtr, fabric: &Fabric) {
        let IpAddr::V4(v4) = addr else {
            warn!(%addr, "discovery kernel for a non-ipv4 interface");
            return;
        };
        let target = self
            .discoverers
            .iter()
            .find(|(net, _)| net.contains(&v4))
            .map(|(_, (_, inst))| inst.clone());
        match target {
            Some(inst) => {
                k.core_mut().set_principal(Principal::Instance(inst));
                fabric.local().send(k);
            }
            None => {
                warn!(%addr, "no discoverer for interface");
                let source = k.core().source().cloned();
                let core = k.core_mut();
                core.set_destination(source);
                core.set_source(None);
                core.set_principal(Principal::None);
                core.return_to_parent(ReturnCode::Error);
                fabric.remote().send(k);
            }
        }
    }

    /// Current hierarchy of every discoverer.
    fn hierarchies(&self) -> Vec<Hierarchy> {
        self.discoverers
            .values()
            .filter_map(|(_, inst)| {
                let guard = inst.lock();
                guard.downcast_ref::<Discoverer>().map(|d| d.hierarchy().clone())
            })
            .collect()
    }

    /// Send a control reply back to the client that asked.
    fn reply_control(&self, mut k: KernelPtr, code: ReturnCode, fabric: &Fabric) {
        let dest = k.core().source().cloned();
        let core = k.core_mut();
        core.set_destination(dest);
        core.set_source(None);
        core.set_principal(Principal::None);
        core.return_to_parent(code);
        fabric.control().send(k);
    }

    /// Purge the listed applications locally and broadcast the
    /// terminate kernel to the cluster.
    fn broadcast_terminate(&self, ids: Vec<u64>, fabric: &Fabric) {
        if ids.is_empty() {
            return;
        }
        fabric.remote().drop_application(&ids);
        self.process.terminate(ids.clone());
        let mut t = Box::new(TerminateRequest::new(ids));
        t.core_mut().set_phase(Phase::Broadcast);
        fabric.remote().send(t);
    }

    fn on_status(&self, mut k: Box<StatusRequest>, fabric: &Fabric) {
        k.set_hierarchies(self.hierarchies());
        self.reply_control(k, ReturnCode::Success, fabric);
    }

    fn on_job_status(&self, mut k: Box<JobStatusRequest>, fabric: &Fabric) {
        self.broadcast_terminate(k.job_ids().to_vec(), fabric);
        k.set_jobs(self.process.jobs());
        self.reply_control(k, ReturnCode::Success, fabric);
    }

    fn on_pipeline_status(&self, mut k: Box<PipelineStatusRequest>, fabric: &Fabric) {
        let mut pipelines = Vec::new();
        for snapshot in [
            self.remote.snapshot(),
            self.process.snapshot(),
            self.control.snapshot(),
        ] {
            if let Some(snapshot) = snapshot {
                pipelines.push(snapshot);
            }
        }
        k.set_pipelines(pipelines);
        self.reply_control(k, ReturnCode::Success, fabric);
    }

    fn on_submit(&self, mut k: Box<SubmitRequest>, fabric: &Fabric) {
        let Some(mut app) = k.take_application() else {
            k.set_message("no application in request".to_string());
            self.reply_control(k, ReturnCode::Error, fabric);
            return;
        };
        if app.id == 0 {
            app.id = fabric.ids().next_id();
        }
        let id = app.id;
        match self.process.add_application(app) {
            Ok(id) => {
                info!(application = id, "job submitted");
                k.set_assigned_id(id);
                self.reply_control(k, ReturnCode::Success, fabric);
            }
            Err(err) => {
                error!(application = id, %err, "job submission failed");
                fabric.gate().flag(EXIT_SPAWN);
                k.set_message(err);
                self.reply_control(k, ReturnCode::Error, fabric);
            }
        }
    }

    fn on_socket_event(&self, event: &SocketEvent, fabric: &Fabric) {
        if !matches!(
            event.kind(),
            SocketEventKind::ClientAdded | SocketEventKind::ClientRemoved
        ) {
            return;
        }
        let Some(addr) = event.address().ip() else {
            return;
        };
        let IpAddr::V4(v4) = addr else { return };
        if let Some((_, inst)) = self
            .discoverers
            .iter()
            .find(|(net, _)| net.contains(&v4))
            .map(|(_, entry)| entry)
        {
            let mut copy = Box::new(SocketEvent::new(event.kind(), event.address().clone()));
            copy.core_mut().set_phase(Phase::PointToPoint);
            copy.core_mut()
                .set_principal(Principal::Instance(inst.clone()));
            fabric.local().send(copy);
        }
    }

    fn on_process_event(&self, event: &ProcessEvent, fabric: &Fabric) {
        match event.kind() {
            ProcessEventKind::ChildTerminated => {
                debug!(
                    application = event.application_id(),
                    code = event.exit_code(),
                    "job terminated"
                );
                self.broadcast_terminate(vec![event.application_id()], fabric);
            }
        }
    }
}

impl Kernel for Main {
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
        self.update_resources();
        self.update_discoverers(fabric);
        self.send_timer(fabric);
    }

    fn react(&mut self, child: KernelPtr, fabric: &Fabric) {
        let child = match child.downcast::<NetworkTimer>() {
            Ok(_) => {
                self.update_resources();
                self.update_discoverers(fabric);
                self.send_timer(fabric);
                return;
            }
            Err(other) => other,
        };
        if let Some(probe) = child.downcast_ref::<Probe>() {
            let addr = IpAddr::V4(probe.ifaddr().addr());
            self.forward_to_discoverer(addr, child, fabric);
            return;
        }
        if let Some(update) = child.downcast_ref::<HierarchyUpdate>() {
            let addr = IpAddr::V4(update.ifaddr().addr());
            self.forward_to_discoverer(addr, child, fabric);
            return;
        }
        let child = match child.downcast::<SocketEvent>() {
            Ok(event) => {
                self.on_socket_event(&event, fabric);
                return;
            }
            Err(other) => other,
        };
        let child = match child.downcast::<ProcessEvent>() {
            Ok(event) => {
                self.on_process_event(&event, fabric);
                return;
            }
            Err(other) => other,
        };
        let child = match child.downcast::<StatusRequest>() {
            Ok(k) => {
                self.on_status(k, fabric);
                return;
            }
            Err(other) => other,
        };
        let child = match child.downcast::<JobStatusRequest>() {
            Ok(k) => {
                self.on_job_status(k, fabric);
                return;
            }
            Err(other) => other,
        };
        let child = match child.downcast::<PipelineStatusRequest>() {
            Ok(k) => {
                self.on_pipeline_status(k, fabric);
                return;
            }
            Err(other) => other,
        };
        let child = match child.downcast::<SubmitRequest>() {
            Ok(k) => {
                self.on_submit(k, fabric);
                return;
            }
            Err(other) => other,
        };
        match child.downcast::<TerminateRequest>() {
            Ok(k) => {
                self.broadcast_terminate(k.job_ids().to_vec(), fabric);
                self.reply_control(k, ReturnCode::Success, fabric);
            }
            Err(other) => {
                debug!(id = other.core().id(), "unexpected kernel ignored");
            }
        }
    }
}
