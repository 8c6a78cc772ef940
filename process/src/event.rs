// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Event kernel posted to resident kernels when a worker process exits.
//! The main kernel answers it with a cluster-wide terminate broadcast.

use kernel::{Encoder, Kernel, KernelCore};

/// Wire type reserved for the event kernel; it is never registered.
pub const PROCESS_EVENT_WIRE_TYPE: u16 = 9;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessEventKind {
    ChildTerminated,
}

#[derive(Debug)]
pub struct ProcessEvent {
    core: KernelCore,
    kind: ProcessEventKind,
    application_id: u64,
    exit_code: i32,
}

impl ProcessEvent {
    #[must_use]
    pub fn terminated(application_id: u64, exit_code: i32) -> Self {
        Self {
            core: KernelCore::default(),
            kind: ProcessEventKind::ChildTerminated,
            application_id,
            exit_code,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ProcessEventKind {
        self.kind
    }

    #[must_use]
    pub fn application_id(&self) -> u64 {
        self.application_id
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl Kernel for ProcessEvent {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        PROCESS_EVENT_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        // local-only kernel; encoded form is never read back
        enc.put_u64(self.application_id);
    }
}
