// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod virtual_cluster;

pub use virtual_cluster::{error_policy, reconcile, Context, ErrorTracker, VirtualClusterReconciler};
