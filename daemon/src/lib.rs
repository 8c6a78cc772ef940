// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The lattice daemon: wires the pipelines and registries into a
//! fabric, runs one discoverer per managed interface, and serves the
//! control socket.

#![deny(clippy::all)]

mod bootstrap;
pub mod control;
mod main_kernel;

pub use bootstrap::{Daemon, DaemonError, bootstrap};
pub use main_kernel::{Main, MainConfig};

/// Exit-code bit: configuration error.
pub const EXIT_CONFIG: i32 = 1;
/// Exit-code bit: a listener could not be bound.
pub const EXIT_BIND: i32 = 2;
/// Exit-code bit: a worker process could not be spawned.
pub const EXIT_SPAWN: i32 = 4;
