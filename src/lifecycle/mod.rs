// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of a VirtualCluster: phase derivation, ordered provisioning,
//! upgrades and finalizer-gated teardown.

pub mod finalizer;
pub mod phase;
pub mod provision;
pub mod status;
pub mod teardown;
pub mod upgrade;

pub use finalizer::{add_finalizer, remove_finalizer};
pub use phase::{derive_phase, ComponentReadiness, PhaseEvent, PhaseInput};
pub use provision::{apply_bundle, ProvisionReport};
pub use status::{patch_status, ConditionBuilder};
pub use teardown::teardown;
pub use upgrade::{consume_upgrade_label, decide_mode, upgrade_consumed, ApplyMode};
