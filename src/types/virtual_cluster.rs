// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{labels, FINALIZER};
use crate::error::{Result, VcError};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Longest name a namespace may carry (RFC 1123 label)
const MAX_NAMESPACE_LEN: usize = 63;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(
    group = "tenancy.x-k8s.io",
    version = "v1alpha1",
    kind = "VirtualCluster",
    shortname = "vc",
    namespaced,
    status = "VirtualClusterStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ClusterNamespace", "type":"string", "jsonPath":".status.clusterNamespace"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.clusterVersionName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterSpec {
    /// Name of the ClusterVersion the control plane is rendered from
    pub cluster_version_name: String,
    /// Validity of issued certificates in days
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pki_expire_days: Option<u32>,
    /// Overrides the operator wide cluster DNS domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, schemars::JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Creating,
    Running,
    Upgrading,
    Terminating,
    Error,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Creating => "Creating",
            ClusterPhase::Running => "Running",
            ClusterPhase::Upgrading => "Upgrading",
            ClusterPhase::Terminating => "Terminating",
            ClusterPhase::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    /// Root namespace hosting the control plane; never changes once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// ClusterVersion content last applied in full to the root namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_cluster_version: Option<AppliedClusterVersion>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppliedClusterVersion {
    pub name: String,
    pub hash: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl VirtualCluster {
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn cluster_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.cluster_namespace.as_deref())
            .filter(|ns| !ns.is_empty())
    }

    pub fn applied_cluster_version(&self) -> Option<&AppliedClusterVersion> {
        self.status.as_ref().and_then(|s| s.applied_cluster_version.as_ref())
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Check if the upgrade trigger label is set to "true"
    pub fn upgrade_requested(&self) -> bool {
        self.labels()
            .get(labels::READY_FOR_UPGRADE)
            .is_some_and(|v| v == "true")
    }

    /// `<namespace>/<name>`, used to key per-object bookkeeping
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Derive the root namespace name from namespace, uid and name.
    ///
    /// The uid hash keeps the name unique when a VirtualCluster is recreated
    /// under the same name while its previous namespace is still terminating.
    pub fn root_namespace_name(&self) -> Result<String> {
        let uid = self.uid().ok_or(VcError::MissingObjectKey(".metadata.uid"))?;
        let hash = format!("{:x}", Sha256::digest(uid.as_bytes()));

        let mut name = format!(
            "{}-{}-{}",
            self.namespace().unwrap_or_else(|| "default".to_string()),
            &hash[..6],
            self.name_any()
        );
        name.truncate(MAX_NAMESPACE_LEN);
        Ok(name.trim_end_matches('-').to_string())
    }
}
