// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Root namespace management

use crate::constants::{labels, OPERATOR_NAME};
use crate::error::{Result, VcError};
use crate::types::VirtualCluster;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{DeleteParams, ObjectMeta, PostParams},
    Api, Client, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// What a delete call found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceDeletion {
    /// The delete request was accepted by the API server
    Issued,
    /// The namespace did not exist anymore
    AlreadyGone,
    /// The namespace belongs to someone else and was left alone
    NotOwned,
}

/// Labels tying a root namespace to its VirtualCluster
pub fn ownership_labels(vc: &VirtualCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
        (labels::VC_NAME.to_string(), vc.name_any()),
        (labels::VC_NAMESPACE.to_string(), vc.namespace().unwrap_or_default()),
        (labels::VC_UID.to_string(), vc.uid().unwrap_or_default()),
    ])
}

/// Check whether a namespace was created for the given VirtualCluster
pub fn is_owned_by(namespace: &Namespace, vc: &VirtualCluster) -> bool {
    let uid = vc.uid().unwrap_or_default();
    namespace
        .labels()
        .get(labels::VC_UID)
        .is_some_and(|v| !uid.is_empty() && *v == uid)
}

/// Ensure the root namespace of a VirtualCluster exists, create it if it doesn't.
///
/// A namespace with the same name that is labelled for a different
/// VirtualCluster is never adopted.
#[instrument(skip(client, vc), fields(vc = %vc.key()))]
pub async fn ensure_root_namespace(client: &Client, name: &str, vc: &VirtualCluster) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    match namespaces.get_opt(name).await? {
        Some(ns) if is_owned_by(&ns, vc) => {
            debug!("Namespace {} already exists", name);
            Ok(())
        }
        Some(_) => Err(VcError::NamespaceCollision(format!(
            "namespace {} exists but is not owned by VirtualCluster {}",
            name,
            vc.key()
        ))),
        None => {
            info!("Creating namespace {}", name);
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(ownership_labels(vc)),
                    ..Default::default()
                },
                ..Default::default()
            };
            let pp = PostParams {
                field_manager: Some(OPERATOR_NAME.to_string()),
                ..Default::default()
            };
            namespaces.create(&pp, &ns).await?;
            info!("Namespace {} created successfully", name);
            Ok(())
        }
    }
}

/// Delete the root namespace of a VirtualCluster. A missing namespace is success.
#[instrument(skip(client, vc), fields(vc = %vc.key()))]
pub async fn delete_root_namespace(
    client: &Client,
    name: &str,
    vc: &VirtualCluster,
) -> Result<NamespaceDeletion> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    let Some(ns) = namespaces.get_opt(name).await? else {
        debug!("Namespace {} is already gone", name);
        return Ok(NamespaceDeletion::AlreadyGone);
    };

    if !is_owned_by(&ns, vc) {
        warn!("Namespace {} is not owned by this VirtualCluster, leaving it in place", name);
        return Ok(NamespaceDeletion::NotOwned);
    }

    if ns.metadata.deletion_timestamp.is_some() {
        debug!("Namespace {} is already terminating", name);
        return Ok(NamespaceDeletion::Issued);
    }

    match namespaces.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!("Deletion of namespace {} issued", name);
            Ok(NamespaceDeletion::Issued)
        }
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(NamespaceDeletion::AlreadyGone),
        Err(e) => Err(e.into()),
    }
}
