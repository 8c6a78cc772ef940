// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The local pipeline: a bounded pool of worker threads executing
//! kernels whose destination is this process.
//!
//! Workers pop one kernel at a time and either run its `act` (fresh
//! kernels) or deliver it to the parent or principal awaiting it
//! (`react`). A kernel that spawned children is parked in the instance
//! registry until the last child returns; completion routes it onward.
//! Shutdown stops intake first, then one designated worker drains the
//! queue, then threads are joined.

#![deny(clippy::all)]

mod timer;

use crossbeam_channel::{Receiver, Sender, unbounded};
use kernel::{
    Fabric, ForeignKernel, InstanceRef, Kernel, KernelPtr, ParentLink, Pipeline, Principal,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use timer::Timer;
use tracing::{debug, trace, warn};

/// Retries for a returning kernel whose parent is not registered yet.
const MAX_REDELIVERIES: u8 = 50;

pub(crate) enum Job {
    Kernel(KernelPtr),
    Instance(InstanceRef),
    Stop,
}

/// Fixed-size worker pool with a FIFO kernel queue and a timer wheel.
pub struct LocalPipeline {
    name: &'static str,
    concurrency: usize,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    fabric: OnceCell<Arc<Fabric>>,
    stopped: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    timer: Timer,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalPipeline {
    /// `concurrency` defaults to the hardware thread count when zero.
    #[must_use]
    pub fn new(name: &'static str, concurrency: usize) -> Arc<Self> {
        let concurrency = if concurrency == 0 {
            std::thread::available_parallelism().map_or(1, usize::from)
        } else {
            concurrency
        };
        let (tx, rx) = unbounded();
        Arc::new(Self {
            name,
            concurrency,
            tx: tx.clone(),
            rx,
            fabric: OnceCell::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            timer: Timer::new(tx),
            workers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn the workers. Kernels sent before `start` stay queued.
    pub fn start(self: &Arc<Self>, fabric: Arc<Fabric>) {
        if self.fabric.set(fabric.clone()).is_err() {
            warn!(name = self.name, "pipeline started twice");
            return;
        }
        self.timer.start(self.name);
        let mut workers = self.workers.lock();
        for number in 0..self.concurrency {
            let this = Arc::clone(self);
            let fabric = fabric.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{number}", self.name))
                .spawn(move || this.run(&fabric))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
    }

    /// Stop intake, drain what is left, join the workers.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timer.stop();
        for _ in 0..self.concurrency {
            let _ = self.tx.send(Job::Stop);
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn run(&self, fabric: &Arc<Fabric>) {
        while let Ok(job) = self.rx.recv() {
            if matches!(job, Job::Stop) {
                break;
            }
            if self.stopped.load(Ordering::SeqCst) {
                continue;
            }
            match job {
                Job::Kernel(k) => self.dispatch(k, fabric),
                Job::Instance(inst) => self.run_instance(&inst, fabric),
                Job::Stop => unreachable!("handled above"),
            }
        }
        // one worker reaps whatever is still queued; dropping a kernel
        // releases its parent chain recursively
        if !self.draining.swap(true, Ordering::SeqCst) {
            let mut reaped = 0usize;
            while let Ok(job) = self.rx.try_recv() {
                drop(job);
                reaped += 1;
            }
            if reaped > 0 {
                debug!(name = self.name, reaped, "dropped queued kernels at shutdown");
            }
        }
    }

    fn dispatch(&self, mut k: KernelPtr, fabric: &Arc<Fabric>) {
        if matches!(k.core().principal(), Principal::Instance(_)) {
            let Principal::Instance(inst) = k.core_mut().take_principal() else {
                unreachable!("matched above");
            };
            self.deliver(&inst, k, false, fabric);
            return;
        }
        if k.core().moves_downstream() {
            match k.core_mut().take_parent() {
                ParentLink::Owned(mut parent) => {
                    trace!(id = k.core().id(), "react on carried parent");
                    parent.react(k, fabric);
                    self.post(parent, fabric);
                }
                ParentLink::Id(pid) => match fabric.instances().get(pid) {
                    Some(inst) => self.deliver(&inst, k, true, fabric),
                    None => {
                        // the parent may still be on its way into the
                        // registry on another worker; retry briefly
                        if k.core_mut().bump_redeliveries() <= MAX_REDELIVERIES {
                            k.core_mut().set_parent(ParentLink::Id(pid));
                            fabric
                                .local()
                                .send_after(Duration::from_millis(20), k);
                        } else {
                            warn!(id = k.core().id(), parent = pid, "parent instance vanished");
                        }
                    }
                },
                ParentLink::None => {
                    if k.core().source().is_some() || k.core().destination().is_some() {
                        // the result belongs to a remote parent
                        fabric.remote().send(k);
                    } else {
                        debug!(id = k.core().id(), "downstream kernel with no parent dropped");
                    }
                }
            }
            return;
        }
        if let Principal::Id(pid) = k.core().principal() {
            let pid = *pid;
            match fabric.instances().get(pid) {
                Some(inst) => {
                    k.core_mut().set_principal(Principal::None);
                    self.deliver(&inst, k, false, fabric);
                }
                None => warn!(id = k.core().id(), principal = pid, "no principal found"),
            }
            return;
        }
        trace!(id = k.core().id(), "act");
        k.act(fabric);
        self.post(k, fabric);
    }

    /// React `child` on a registered instance; route the instance onward
    /// if this completed it.
    fn deliver(&self, inst: &InstanceRef, child: KernelPtr, returning: bool, fabric: &Arc<Fabric>) {
        let completed = {
            let mut guard = inst.lock();
            if returning {
                guard.core_mut().child_returned();
            }
            guard.react(child, fabric);
            let core = guard.core();
            if !core.is_resident() && core.children() == 0 && core.moves_downstream() {
                Some(core.id())
            } else {
                None
            }
        };
        if let Some(id) = completed {
            if let Some(arc) = fabric.instances().remove(id) {
                match Arc::try_unwrap(arc) {
                    Ok(m) => self.post(m.into_inner(), fabric),
                    Err(_) => warn!(id, "completed instance still shared"),
                }
            }
        }
    }

    fn run_instance(&self, inst: &InstanceRef, fabric: &Arc<Fabric>) {
        let mut guard = inst.lock();
        trace!(id = guard.core().id(), "act instance");
        guard.act(fabric);
    }

    /// Decide what happens to a kernel after `act`/`react` returned:
    /// park it while children are outstanding, route it downstream if it
    /// completed, drop it otherwise.
    fn post(&self, mut k: KernelPtr, fabric: &Arc<Fabric>) {
        if k.core().children() > 0 {
            let id = k.core_mut().ensure_id(fabric.ids());
            fabric.instances().insert(id, Arc::new(Mutex::new(k)));
            return;
        }
        if k.core().moves_downstream() {
            if !k.core().parent().is_none() {
                self.send(k);
            } else if k.core().destination().is_some() || k.core().source().is_some() {
                fabric.remote().send(k);
            }
            // no parent and no provenance: the result dies here
        }
    }
}

impl Pipeline for LocalPipeline {
    fn send(&self, k: KernelPtr) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!(name = self.name, id = k.core().id(), "kernel dropped after stop");
            return;
        }
        let _ = self.tx.send(Job::Kernel(k));
    }

    fn send_after(&self, delay: Duration, k: KernelPtr) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.timer.schedule(delay, k);
    }

    fn forward_foreign(&self, fk: Box<ForeignKernel>) {
        warn!(
            name = self.name,
            id = fk.core().id(),
            "foreign kernel has no local execution path"
        );
    }

    fn activate(&self, inst: InstanceRef) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Job::Instance(inst));
    }
}

impl Drop for LocalPipeline {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.timer.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::Sender as ChanSender;
    use kernel::{
        Encoder, FabricParts, IdGenerator, InstanceRegistry, Kernel, KernelCore, NullPipeline,
        ReturnCode, ShutdownGate, TypeRegistry,
    };
    use std::time::Instant;

    #[derive(Debug)]
    struct Leaf {
        core: KernelCore,
        done: ChanSender<&'static str>,
    }

    impl Kernel for Leaf {
        fn core(&self) -> &KernelCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut KernelCore {
            &mut self.core
        }

        fn wire_type(&self) -> u16 {
            100
        }

        fn encode(&self, _enc: &mut Encoder<'_>) {}

        fn act(&mut self, _fabric: &Fabric) {
            let _ = self.done.send("leaf-acted");
            self.core.return_to_parent(ReturnCode::Success);
        }
    }

    #[derive(Debug)]
    struct Root {
        core: KernelCore,
        done: ChanSender<&'static str>,
    }

    impl Kernel for Root {
        fn core(&self) -> &KernelCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut KernelCore {
            &mut self.core
        }

        fn wire_type(&self) -> u16 {
            101
        }

        fn encode(&self, _enc: &mut Encoder<'_>) {}

        fn act(&mut self, fabric: &Fabric) {
            let mut child = Box::new(Leaf {
                core: KernelCore::default(),
                done: self.done.clone(),
            });
            self.core.adopt(fabric.ids(), child.core_mut());
            fabric.local().send(child);
        }

        fn react(&mut self, child: KernelPtr, _fabric: &Fabric) {
            assert_eq!(child.core().return_code(), ReturnCode::Success);
            let _ = self.done.send("root-reacted");
            self.core.return_to_parent(ReturnCode::Success);
        }
    }

    fn fabric_with(local: Arc<LocalPipeline>) -> Arc<Fabric> {
        Fabric::new(FabricParts {
            local: local.clone(),
            remote: Arc::new(NullPipeline),
            process: Arc::new(NullPipeline),
            control: Arc::new(NullPipeline),
            types: Arc::new(TypeRegistry::new()),
            instances: Arc::new(InstanceRegistry::new()),
            ids: Arc::new(IdGenerator::unbounded()),
            this_application: 0,
            gate: ShutdownGate::new(),
        })
    }

    #[test]
    fn child_returns_to_suspended_parent() {
        let local = LocalPipeline::new("lat-local-test", 2);
        let fabric = fabric_with(local.clone());
        local.start(fabric.clone());

        let (done, events) = unbounded();
        local.send(Box::new(Root {
            core: KernelCore::default(),
            done,
        }));

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(events.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert!(seen.contains(&"leaf-acted"));
        assert!(seen.contains(&"root-reacted"));
        // the suspended root was removed once its child returned
        std::thread::sleep(Duration::from_millis(100));
        assert!(fabric.instances().is_empty());
        local.stop();
    }

    #[test]
    fn timer_releases_kernels_when_due() {
        let local = LocalPipeline::new("lat-timer-test", 1);
        let fabric = fabric_with(local.clone());
        local.start(fabric);

        let (done, events) = unbounded();
        let started = Instant::now();
        local.send_after(
            Duration::from_millis(50),
            Box::new(Leaf {
                core: KernelCore::default(),
                done,
            }),
        );
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            "leaf-acted"
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        local.stop();
    }

    #[test]
    fn stop_drains_and_joins() {
        let local = LocalPipeline::new("lat-stop-test", 2);
        let fabric = fabric_with(local.clone());
        local.start(fabric);
        local.stop();
        // further sends are dropped quietly
        let (done, events) = unbounded();
        local.send(Box::new(Leaf {
            core: KernelCore::default(),
            done,
        }));
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
