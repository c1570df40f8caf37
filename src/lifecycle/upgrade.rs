// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Upgrade coordination.
//!
//! The ClusterVersion content last applied in full is recorded in
//! `status.appliedClusterVersion` as a content hash. A rendered bundle with a
//! different hash is only rolled out when the VirtualCluster carries the
//! upgrade label; the label is removed once the new bundle has been applied
//! and recorded.

use crate::constants::labels;
use crate::error::Result;
use crate::template::DesiredBundle;
use crate::types::{VirtualCluster, VirtualClusterStatus};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use std::fmt;
use tracing::{info, instrument};

/// How the desired bundle is brought onto the root namespace in this pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Nothing was applied in full yet; bring components up in order
    Provision,
    /// The applied version is current; repair drift
    Converge,
    /// A changed version was approved; patch everything in place
    Upgrade,
    /// A changed version waits for approval; only recreate missing objects
    Hold,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decide how to apply `bundle` given what was last applied to `vc`
pub fn decide_mode(vc: &VirtualCluster, bundle: &DesiredBundle) -> ApplyMode {
    match vc.applied_cluster_version() {
        None => ApplyMode::Provision,
        Some(applied) if *applied == bundle.applied() => ApplyMode::Converge,
        Some(_) if vc.upgrade_requested() => ApplyMode::Upgrade,
        Some(_) => ApplyMode::Hold,
    }
}

/// Whether the upgrade label can be removed: `status` records the bundle as applied
pub fn upgrade_consumed(vc: &VirtualCluster, status: &VirtualClusterStatus, bundle: &DesiredBundle) -> bool {
    vc.upgrade_requested()
        && status
            .applied_cluster_version
            .as_ref()
            .is_some_and(|applied| *applied == bundle.applied())
}

/// Remove the upgrade label from the VirtualCluster
#[instrument(skip(client, vc), fields(vc = %vc.key()))]
pub async fn consume_upgrade_label(client: &Client, vc: &VirtualCluster) -> Result<()> {
    let api: Api<VirtualCluster> = Api::namespaced(client.clone(), &vc.namespace().unwrap_or_default());
    let patch = json!({
        "metadata": {
            "labels": { (labels::READY_FOR_UPGRADE): null }
        }
    });
    api.patch(&vc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!("Upgrade applied, removed {} label", labels::READY_FOR_UPGRADE);
    Ok(())
}
