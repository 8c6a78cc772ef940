// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The child-process pipeline: spawns and supervises one worker process
//! per submitted application, speaks the kernel wire protocol with each
//! over a pair of pipes mapped to fixed descriptors, and bridges
//! foreign kernels between the cluster and the workers.

#![deny(clippy::all)]

mod application;
mod event;
mod forwarder;
mod pipeline;

pub use application::{Application, Role, CHILD_IN_FD, CHILD_OUT_FD, APPLICATION_ID_ENV};
pub use event::{ProcessEvent, ProcessEventKind, PROCESS_EVENT_WIRE_TYPE};
pub use forwarder::ForeignBridge;
pub use pipeline::{ProcessConfig, ProcessPipeline, ProcessPipelineHandle};
