// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud-store entity services.
//!
//! Plain document services for the inventory the workflows act on. They
//! have field tables and invariants but no continuations.

pub mod cluster;
pub mod cluster_configuration;
pub mod container;
pub mod host;
pub mod vm;

pub use cluster::{ClusterService, ClusterState, ClusterStatus};
pub use cluster_configuration::{ClusterConfigurationService, ClusterConfigurationState, ClusterType};
pub use container::{ContainerService, ContainerState};
pub use host::{HostService, HostState, HostStatus, UsageTag};
pub use vm::{VmService, VmState};
