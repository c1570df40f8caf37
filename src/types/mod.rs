// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resources managed by the operator.

pub mod cluster_version;
pub mod virtual_cluster;

pub use cluster_version::{ClusterVersion, ClusterVersionSpec, ComponentTemplate};
pub use virtual_cluster::{
    AppliedClusterVersion, ClusterPhase, Condition, VirtualCluster, VirtualClusterSpec,
    VirtualClusterStatus,
};
