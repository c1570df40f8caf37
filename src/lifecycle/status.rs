// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Status and conditions of VirtualCluster resources.

use crate::error::{Result, VcError};
use crate::types::{Condition, VirtualCluster, VirtualClusterStatus};
use chrono::Utc;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// Condition types reported on a VirtualCluster
pub mod condition_types {
    /// Every control plane component is ready
    pub const READY: &str = "Ready";
    /// The control plane is being provisioned or upgraded
    pub const PROGRESSING: &str = "Progressing";
    /// The referenced ClusterVersion changed and waits for the upgrade label
    pub const UPGRADE_AVAILABLE: &str = "UpgradeAvailable";
    /// The root namespace exists and is owned by this VirtualCluster
    pub const NAMESPACE_READY: &str = "NamespaceReady";
    /// All PKI secrets exist
    pub const PKI_READY: &str = "PkiReady";
}

pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

fn status_str(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Start from the conditions currently stored on the object
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition. `lastTransitionTime` only moves when the status flips.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.condition_type == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                condition_type: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, status_str(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::PROGRESSING, status_str(is_progressing), reason, message)
    }

    pub fn upgrade_available(self, available: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::UPGRADE_AVAILABLE, status_str(available), reason, message)
    }

    pub fn namespace_ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::NAMESPACE_READY, status_str(is_ready), reason, message)
    }

    pub fn pki_ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::PKI_READY, status_str(is_ready), reason, message)
    }

    /// Record a failure on the condition it belongs to
    pub fn failure(self, error: &VcError) -> Self {
        let message = error.to_string();
        match error {
            VcError::NamespaceCollision(_) => self.namespace_ready(false, error.reason(), &message),
            VcError::PkiError(_) => self.pki_ready(false, error.reason(), &message),
            _ => self.ready(false, error.reason(), &message),
        }
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(status: &'a VirtualClusterStatus, type_: &str) -> Option<&'a Condition> {
    status.conditions.iter().find(|c| c.condition_type == type_)
}

/// Write the status subresource if it differs from what is stored.
///
/// The patch carries the resourceVersion the status was computed from, so a
/// concurrent write makes it fail with a conflict instead of being overwritten.
/// Returns the updated object when a write was made.
#[instrument(skip(client, vc, status), fields(vc = %vc.key(), phase = %status.phase))]
pub async fn patch_status(
    client: &Client,
    vc: &VirtualCluster,
    status: &VirtualClusterStatus,
) -> Result<Option<VirtualCluster>> {
    if vc.status.as_ref() == Some(status) {
        debug!("Status unchanged, skipping write");
        return Ok(None);
    }

    let api: Api<VirtualCluster> = Api::namespaced(client.clone(), &vc.namespace().unwrap_or_default());
    let patch = status_patch(vc, status)?;
    let updated = api
        .patch_status(&vc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Some(updated))
}

fn status_patch(vc: &VirtualCluster, status: &VirtualClusterStatus) -> Result<Value> {
    let mut body = serde_json::to_value(status)?;
    // Merge patches keep absent keys, so cleared fields are sent as null
    if let Value::Object(map) = &mut body {
        for key in ["reason", "message"] {
            map.entry(key).or_insert(Value::Null);
        }
    }

    Ok(json!({
        "metadata": { "resourceVersion": vc.resource_version() },
        "status": body,
    }))
}
