// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Finalizer bookkeeping on VirtualCluster objects.

use crate::constants::FINALIZER;
use crate::error::Result;
use crate::types::VirtualCluster;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{info, instrument};

/// Add the finalizer, keeping any finalizers set by others
#[instrument(skip(client, vc), fields(vc = %vc.key()))]
pub async fn add_finalizer(client: &Client, vc: &VirtualCluster) -> Result<()> {
    if vc.has_finalizer() {
        return Ok(());
    }
    let mut finalizers = vc.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(client, vc, finalizers).await?;
    info!("Added finalizer");
    Ok(())
}

/// Remove the finalizer, permitting the API server to delete the object
#[instrument(skip(client, vc), fields(vc = %vc.key()))]
pub async fn remove_finalizer(client: &Client, vc: &VirtualCluster) -> Result<()> {
    if !vc.has_finalizer() {
        return Ok(());
    }
    let finalizers = vc
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(client, vc, finalizers).await?;
    info!("Removed finalizer");
    Ok(())
}

// The resourceVersion precondition keeps a concurrent finalizer edit from being lost
async fn patch_finalizers(client: &Client, vc: &VirtualCluster, finalizers: Vec<String>) -> Result<()> {
    let api: Api<VirtualCluster> = Api::namespaced(client.clone(), &vc.namespace().unwrap_or_default());
    let patch = json!({
        "metadata": {
            "resourceVersion": vc.resource_version(),
            "finalizers": finalizers,
        }
    });
    api.patch(&vc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
