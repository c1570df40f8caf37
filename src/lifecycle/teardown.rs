// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Finalizer-gated teardown of a VirtualCluster.

use crate::error::Result;
use crate::kubernetes::namespaces::{delete_root_namespace, is_owned_by, NamespaceDeletion};
use crate::lifecycle::finalizer::remove_finalizer;
use crate::lifecycle::status::{patch_status, ConditionBuilder};
use crate::template::Component;
use crate::types::{ClusterPhase, VirtualCluster};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Namespace;
use kube::{api::DeleteParams, Api, Client};
use tracing::{debug, info, instrument};

/// Tear down the control plane of a deleted VirtualCluster and release it.
///
/// StatefulSets are removed in reverse bring-up order, then the root namespace
/// is deleted, which cascades to everything else in it. The finalizer is
/// removed once the namespace deletion has been issued or the namespace is
/// gone. Safe to run any number of times.
#[instrument(skip(client, vc), fields(vc = %vc.key()))]
pub async fn teardown(client: &Client, vc: &VirtualCluster) -> Result<()> {
    if !vc.has_finalizer() {
        debug!("No finalizer, nothing to tear down");
        return Ok(());
    }

    let current = mark_terminating(client, vc).await?;
    let vc = current.as_ref().unwrap_or(vc);

    if let Some(namespace) = vc.cluster_namespace() {
        let namespaces: Api<Namespace> = Api::all(client.clone());
        let owned = namespaces
            .get_opt(namespace)
            .await?
            .is_some_and(|ns| is_owned_by(&ns, vc));

        if owned {
            delete_stateful_sets(client, namespace).await?;
        }

        match delete_root_namespace(client, namespace, vc).await? {
            NamespaceDeletion::Issued => info!("Root namespace {} is being deleted", namespace),
            NamespaceDeletion::AlreadyGone => debug!("Root namespace {} already gone", namespace),
            NamespaceDeletion::NotOwned => info!("Root namespace {} left in place", namespace),
        }
    }

    remove_finalizer(client, vc).await
}

/// Record the Terminating phase; returns the updated object when a write was made
async fn mark_terminating(client: &Client, vc: &VirtualCluster) -> Result<Option<VirtualCluster>> {
    let mut status = vc.status.clone().unwrap_or_default();
    status.phase = ClusterPhase::Terminating;
    status.reason = Some("Deleting".to_string());
    status.message = Some("VirtualCluster is being deleted".to_string());
    status.conditions = ConditionBuilder::from_existing(status.conditions, vc.metadata.generation)
        .ready(false, "Deleting", "VirtualCluster is being deleted")
        .progressing(true, "Deleting", "Tearing down the control plane")
        .build();
    patch_status(client, vc, &status).await
}

async fn delete_stateful_sets(client: &Client, namespace: &str) -> Result<()> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    for component in Component::ORDERED.iter().rev() {
        match api.delete(component.name(), &DeleteParams::background()).await {
            Ok(_) => debug!("Deleted StatefulSet {}/{}", namespace, component),
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
