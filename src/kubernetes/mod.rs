// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes utilities for CRD discovery, idempotent apply, and namespace management.

pub mod apply;
pub mod crd;
pub mod namespaces;

pub use apply::{create_if_absent, create_or_patch, ApplyOutcome};
pub use crd::wait_for_crds;
pub use namespaces::{delete_root_namespace, ensure_root_namespace, ownership_labels};
