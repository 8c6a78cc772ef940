// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Core data model of the lattice runtime.
//!
//! A *kernel* is a mobile, serialisable unit of work: it carries its own
//! state, may spawn children, and returns a result to its parent when it
//! completes. This crate defines the kernel trait and header, the
//! little-endian wire codec and packet framer, the type and instance
//! registries used to rehydrate and re-attach kernels, the per-peer link
//! protocol (buffering, parent plugging, failure recovery), and the
//! `Fabric` bundle of collaborators every pipeline receives at
//! construction.

#![deny(clippy::all)]

pub mod address;
pub mod codec;
pub mod fabric;
pub mod frame;
pub mod ids;
pub mod kernel;
pub mod link;
pub mod registry;
pub mod resources;
pub mod wire;

pub use address::SocketAddress;
pub use codec::{Decoded, ForeignKernel, KernelHeader};
pub use fabric::{Fabric, FabricParts, NullPipeline, Pipeline, ShutdownGate};
pub use ids::IdGenerator;
pub use kernel::{
    InstanceRef, Kernel, KernelCore, KernelFlags, KernelPtr, ParentLink, Phase, Principal,
    ReturnCode,
};
pub use link::{
    BufferedKernel, ConnectionSnapshot, Link, LinkEnv, LinkError, LinkFlags, PipelineSnapshot,
};
pub use registry::{InstanceRegistry, TypeRegistry, MAIN_KERNEL_ID};
pub use resources::{Resource, ResourceVector};
pub use wire::{Decoder, Encoder, WireError};
