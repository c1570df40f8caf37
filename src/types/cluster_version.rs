// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::error::Result;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Control plane "flavor" shared by many VirtualClusters.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(
    group = "tenancy.x-k8s.io",
    version = "v1alpha1",
    kind = "ClusterVersion",
    shortname = "cv"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<ComponentTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<ComponentTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_manager: Option<ComponentTemplate>,
}

/// Service and StatefulSet templates of one control plane component
#[derive(Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<StatefulSet>,
}

impl ClusterVersion {
    /// Hex encoded sha256 of the spec, used to detect template changes between upgrades
    pub fn content_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(&self.spec)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}
