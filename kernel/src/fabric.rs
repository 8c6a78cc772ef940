// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The collaborator bundle kernels execute against.
//!
//! A [`Fabric`] holds one handle per pipeline plus the registries and
//! the ID generator. It is assembled once at bootstrap and shared by
//! reference; nothing in it is a process-wide global, so a test can run
//! several fabrics side by side.

use crate::codec::ForeignKernel;
use crate::ids::IdGenerator;
use crate::kernel::{InstanceRef, Kernel, KernelPtr};
use crate::registry::{InstanceRegistry, TypeRegistry};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A queue of kernels with workers or transport behind it.
pub trait Pipeline: Send + Sync {
    /// Hand a kernel over; ownership moves with it.
    fn send(&self, k: KernelPtr);

    /// Deliver a kernel after a delay. Only the local pipeline keeps
    /// timers; transports deliver immediately.
    fn send_after(&self, delay: Duration, k: KernelPtr) {
        let _ = delay;
        self.send(k);
    }

    /// Route a kernel whose payload is opaque to this node.
    fn forward_foreign(&self, fk: Box<ForeignKernel>);

    /// Run `act` of a registered instance on this pipeline.
    fn activate(&self, inst: InstanceRef) {
        let _ = inst;
        warn!("pipeline cannot activate instances");
    }

    /// Discard queued and buffered kernels belonging to the listed
    /// applications.
    fn drop_application(&self, ids: &[u64]) {
        let _ = ids;
    }
}

/// Sink for slots a particular process does not wire up (a worker
/// process has no discovery, a test may have no children).
#[derive(Debug, Default)]
pub struct NullPipeline;

impl Pipeline for NullPipeline {
    fn send(&self, k: KernelPtr) {
        warn!(id = k.core().id(), "kernel dropped: pipeline not wired");
    }

    fn forward_foreign(&self, fk: Box<ForeignKernel>) {
        warn!(id = fk.core().id(), "foreign kernel dropped: pipeline not wired");
    }
}

/// Everything a kernel needs to route its children and results.
pub struct Fabric {
    local: Arc<dyn Pipeline>,
    remote: Arc<dyn Pipeline>,
    process: Arc<dyn Pipeline>,
    control: Arc<dyn Pipeline>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    ids: Arc<IdGenerator>,
    this_application: u64,
    gate: Arc<ShutdownGate>,
}

/// Construction-time wiring for [`Fabric`].
pub struct FabricParts {
    pub local: Arc<dyn Pipeline>,
    pub remote: Arc<dyn Pipeline>,
    pub process: Arc<dyn Pipeline>,
    pub control: Arc<dyn Pipeline>,
    pub types: Arc<TypeRegistry>,
    pub instances: Arc<InstanceRegistry>,
    pub ids: Arc<IdGenerator>,
    pub this_application: u64,
    pub gate: Arc<ShutdownGate>,
}

impl Fabric {
    #[must_use]
    pub fn new(parts: FabricParts) -> Arc<Self> {
        Arc::new(Self {
            local: parts.local,
            remote: parts.remote,
            process: parts.process,
            control: parts.control,
            types: parts.types,
            instances: parts.instances,
            ids: parts.ids,
            this_application: parts.this_application,
            gate: parts.gate,
        })
    }

    /// The worker-thread pipeline of this process.
    #[must_use]
    pub fn local(&self) -> &Arc<dyn Pipeline> {
        &self.local
    }

    /// The TCP pipeline towards peer daemons.
    #[must_use]
    pub fn remote(&self) -> &Arc<dyn Pipeline> {
        &self.remote
    }

    /// The child-process pipeline.
    #[must_use]
    pub fn process(&self) -> &Arc<dyn Pipeline> {
        &self.process
    }

    /// The control-socket pipeline (status replies go here).
    #[must_use]
    pub fn control(&self) -> &Arc<dyn Pipeline> {
        &self.control
    }

    #[must_use]
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    #[must_use]
    pub fn instances(&self) -> &Arc<InstanceRegistry> {
        &self.instances
    }

    #[must_use]
    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    /// Cluster-wide application ID of this process (0 = the daemon).
    #[must_use]
    pub fn this_application(&self) -> u64 {
        self.this_application
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<ShutdownGate> {
        &self.gate
    }
}

/// The shutdown promise. The main thread waits on it; whichever
/// component decides the process is done posts the exit flags.
/// Error bits can also be accumulated without ending the process; they
/// surface in the final exit code.
#[derive(Default)]
struct GateState {
    bits: i32,
    done: bool,
}

#[derive(Default)]
pub struct ShutdownGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl ShutdownGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record error bits without ending the process.
    pub fn flag(&self, bits: i32) {
        self.state.lock().bits |= bits;
    }

    /// End the process with the union of `code` and every recorded bit.
    pub fn notify(&self, code: i32) {
        let mut state = self.state.lock();
        state.bits |= code;
        state.done = true;
        self.cv.notify_all();
    }

    /// Block until some component posts an exit code.
    #[must_use]
    pub fn wait(&self) -> i32 {
        let mut state = self.state.lock();
        loop {
            if state.done {
                return state.bits;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Wait with a timeout; `None` if nothing was posted in time.
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> Option<i32> {
        let mut state = self.state.lock();
        if !state.done {
            let _ = self.cv.wait_for(&mut state, timeout);
        }
        state.done.then_some(state.bits)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gate_unions_exit_bits() {
        let gate = ShutdownGate::new();
        gate.flag(0b100);
        gate.notify(0b001);
        assert_eq!(gate.wait(), 0b101);
    }

    #[test]
    fn gate_times_out_quietly() {
        let gate = ShutdownGate::new();
        assert_eq!(gate.wait_for(Duration::from_millis(10)), None);
    }
}
