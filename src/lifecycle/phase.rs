// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! VirtualCluster phase state machine.
//!
//! The phase is re-derived on every reconcile pass from the observed state:
//! [`derive_event`] picks the event implied by a [`PhaseInput`] and
//! [`transition`] validates it against the transition table. Events are applied
//! until the phase settles, so a missed watch event is repaired by the next pass.

use crate::error::{Result, VcError};
use crate::template::Component;
use crate::types::ClusterPhase;
use k8s_openapi::api::apps::v1::StatefulSet;
use std::fmt;
use tracing::{debug, warn};

/// Upper bound on chained transitions in one derivation (Error -> Creating -> Running)
const MAX_STEPS: usize = 4;

/// Events that move a VirtualCluster between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    /// Root namespace and finalizer are in place
    ProvisioningStarted,
    /// Every component reports full readiness
    AllComponentsReady,
    /// A component of a running cluster is no longer ready
    ReadinessLost,
    /// A changed ClusterVersion was applied to a running cluster
    UpgradeApplied,
    /// A non-retryable failure persisted past the error threshold
    ReconcileFailed,
    /// The failure that put the cluster in Error is gone
    RecoveryStarted,
    /// A deletion timestamp appeared
    DeletionRequested,
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Allowed (from, event, to) triples. Terminating has no way out.
const TRANSITIONS: &[(ClusterPhase, PhaseEvent, ClusterPhase)] = &[
    (ClusterPhase::Pending, PhaseEvent::ProvisioningStarted, ClusterPhase::Creating),
    (ClusterPhase::Pending, PhaseEvent::ReconcileFailed, ClusterPhase::Error),
    (ClusterPhase::Pending, PhaseEvent::DeletionRequested, ClusterPhase::Terminating),
    (ClusterPhase::Creating, PhaseEvent::AllComponentsReady, ClusterPhase::Running),
    (ClusterPhase::Creating, PhaseEvent::ReconcileFailed, ClusterPhase::Error),
    (ClusterPhase::Creating, PhaseEvent::DeletionRequested, ClusterPhase::Terminating),
    (ClusterPhase::Running, PhaseEvent::UpgradeApplied, ClusterPhase::Upgrading),
    (ClusterPhase::Running, PhaseEvent::ReadinessLost, ClusterPhase::Creating),
    (ClusterPhase::Running, PhaseEvent::ReconcileFailed, ClusterPhase::Error),
    (ClusterPhase::Running, PhaseEvent::DeletionRequested, ClusterPhase::Terminating),
    (ClusterPhase::Upgrading, PhaseEvent::AllComponentsReady, ClusterPhase::Running),
    (ClusterPhase::Upgrading, PhaseEvent::ReconcileFailed, ClusterPhase::Error),
    (ClusterPhase::Upgrading, PhaseEvent::DeletionRequested, ClusterPhase::Terminating),
    (ClusterPhase::Error, PhaseEvent::RecoveryStarted, ClusterPhase::Creating),
    (ClusterPhase::Error, PhaseEvent::DeletionRequested, ClusterPhase::Terminating),
];

/// Validate a single step of the state machine
pub fn transition(current: ClusterPhase, event: PhaseEvent) -> Result<ClusterPhase> {
    TRANSITIONS
        .iter()
        .find(|(from, ev, _)| *from == current && *ev == event)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| VcError::InvalidPhaseTransition {
            from: current.to_string(),
            event: event.to_string(),
        })
}

pub fn can_transition(current: ClusterPhase, event: PhaseEvent) -> bool {
    transition(current, event).is_ok()
}

/// Observed readiness of one component's StatefulSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentReadiness {
    pub component: Component,
    pub exists: bool,
    pub desired: i32,
    pub replicas: i32,
    pub ready: i32,
    /// False while the StatefulSet controller has not caught up with the latest spec
    pub current: bool,
}

impl ComponentReadiness {
    pub fn missing(component: Component, desired: i32) -> Self {
        ComponentReadiness {
            component,
            exists: false,
            desired,
            replicas: 0,
            ready: 0,
            current: false,
        }
    }

    pub fn from_stateful_set(component: Component, desired: i32, sts: &StatefulSet) -> Self {
        let Some(status) = sts.status.as_ref() else {
            return ComponentReadiness {
                exists: true,
                ..Self::missing(component, desired)
            };
        };

        // Generation and rollout progress are only judged when the controller reports them
        let generation_seen = match (status.observed_generation, sts.metadata.generation) {
            (Some(observed), Some(generation)) => observed >= generation,
            _ => true,
        };
        let rolled_out = status
            .updated_replicas
            .map_or(true, |updated| updated == status.replicas);

        ComponentReadiness {
            component,
            exists: true,
            desired,
            replicas: status.replicas,
            ready: status.ready_replicas.unwrap_or(0),
            current: generation_seen && rolled_out,
        }
    }

    /// Ready means `replicas == readyReplicas == desired` on an up to date StatefulSet
    pub fn is_ready(&self) -> bool {
        self.exists && self.current && self.replicas == self.desired && self.ready == self.desired
    }
}

impl fmt::Display for ComponentReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.exists {
            return write!(f, "{}: missing", self.component);
        }
        write!(f, "{}: {}/{} ready", self.component, self.ready, self.desired)
    }
}

/// Everything the phase derivation looks at
#[derive(Debug, Clone)]
pub struct PhaseInput {
    pub current: ClusterPhase,
    pub deleting: bool,
    pub has_finalizer: bool,
    pub namespace_assigned: bool,
    /// A configuration or invariant failure has been given up on
    pub failed: bool,
    /// A changed ClusterVersion was applied during this pass
    pub upgrade_applied: bool,
    pub readiness: Vec<ComponentReadiness>,
}

impl PhaseInput {
    /// True only when every component is present and ready
    pub fn all_ready(&self) -> bool {
        self.readiness.len() == Component::ORDERED.len() && self.readiness.iter().all(|r| r.is_ready())
    }

    /// Components that are not ready yet, for status messages
    pub fn not_ready(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .readiness
            .iter()
            .filter(|r| !r.is_ready())
            .map(|r| r.to_string())
            .collect();
        for component in Component::ORDERED {
            if !self.readiness.iter().any(|r| r.component == component) {
                pending.push(format!("{}: missing", component));
            }
        }
        pending
    }
}

/// Pick the event implied by the input for the given phase, if any
pub fn derive_event(phase: ClusterPhase, input: &PhaseInput) -> Option<PhaseEvent> {
    if phase == ClusterPhase::Terminating {
        return None;
    }
    // Deletion takes priority over every other signal
    if input.deleting {
        return Some(PhaseEvent::DeletionRequested);
    }
    if input.failed {
        return (phase != ClusterPhase::Error).then_some(PhaseEvent::ReconcileFailed);
    }

    match phase {
        ClusterPhase::Pending => (input.namespace_assigned && input.has_finalizer)
            .then_some(PhaseEvent::ProvisioningStarted),
        ClusterPhase::Error => Some(PhaseEvent::RecoveryStarted),
        ClusterPhase::Creating => input.all_ready().then_some(PhaseEvent::AllComponentsReady),
        ClusterPhase::Running if input.upgrade_applied => Some(PhaseEvent::UpgradeApplied),
        ClusterPhase::Running => (!input.all_ready()).then_some(PhaseEvent::ReadinessLost),
        ClusterPhase::Upgrading => {
            (!input.upgrade_applied && input.all_ready()).then_some(PhaseEvent::AllComponentsReady)
        }
        ClusterPhase::Terminating => None,
    }
}

/// Apply derived events until the phase settles.
///
/// An event the table rejects is logged and leaves the phase where it is.
pub fn derive_phase(input: &PhaseInput) -> ClusterPhase {
    let mut phase = input.current;

    for _ in 0..MAX_STEPS {
        let Some(event) = derive_event(phase, input) else {
            break;
        };
        match transition(phase, event) {
            Ok(next) => {
                debug!("Phase {} --{}--> {}", phase, event, next);
                phase = next;
            }
            Err(e) => {
                warn!("Ignoring phase event: {}", e);
                break;
            }
        }
        // Upgrading is entered for this pass only; readiness is judged on the next one
        if phase == ClusterPhase::Upgrading && input.upgrade_applied {
            break;
        }
    }

    phase
}
