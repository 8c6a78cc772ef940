// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The foreign-kernel forwarder. A foreign kernel arriving from a peer
//! daemon is handed to the child-process pipeline; one originating in a
//! worker with a non-local destination is handed to the socket
//! pipeline. The bridge is stateless: it hands over the original header
//! and payload bytes and only counts what passes through.

use kernel::{ForeignKernel, Kernel, KernelPtr, Pipeline};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

pub struct ForeignBridge {
    target: Arc<dyn Pipeline>,
    forwarded: AtomicU64,
}

impl ForeignBridge {
    /// Bridge into `target`: the process pipeline on a daemon's peer
    /// links, the socket pipeline on its child-process links.
    #[must_use]
    pub fn into_pipeline(target: Arc<dyn Pipeline>) -> Arc<Self> {
        Arc::new(Self {
            target,
            forwarded: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl Pipeline for ForeignBridge {
    fn send(&self, k: KernelPtr) {
        self.target.send(k);
    }

    fn forward_foreign(&self, fk: Box<ForeignKernel>) {
        let n = self.forwarded.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            id = fk.core().id(),
            application = fk.header().application,
            forwarded = n,
            "bridging foreign kernel"
        );
        self.target.forward_foreign(fk);
    }

    fn drop_application(&self, ids: &[u64]) {
        self.target.drop_application(ids);
    }
}
