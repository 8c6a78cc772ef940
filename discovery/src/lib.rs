// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Hierarchy formation and maintenance.
//!
//! Every node maps its interface address to a position in a fanout-`F`
//! tree spanning the subnet, probes candidate superiors in a
//! deterministic order, and keeps an eventually-consistent view of the
//! size of every branch by flooding resource updates along the tree
//! edges. The whole module is driven by kernels; it owns no threads.

#![deny(clippy::all)]

mod discoverer;
mod hierarchy;
mod iterator;
mod position;
mod probe;

pub use discoverer::{ClientControl, Discoverer, DiscovererConfig, DiscovererState};
pub use hierarchy::{Hierarchy, HierarchyNode};
pub use iterator::TreeHierarchyIterator;
pub use position::PositionInTree;
pub use probe::{
    DiscoveryTimer, HierarchyUpdate, Probe, HIERARCHY_WIRE_TYPE, PROBE_WIRE_TYPE,
    TIMER_WIRE_TYPE, register_types,
};
