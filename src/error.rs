// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("ClusterVersion {0} not found")]
    ClusterVersionNotFound(String),

    #[error("Malformed template: {0}")]
    MalformedTemplate(String),

    #[error("Namespace collision: {0}")]
    NamespaceCollision(String),

    #[error("PKI issuance failed: {0}")]
    PkiError(String),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid phase transition from {from} on {event}")]
    InvalidPhaseTransition { from: String, event: String },
}

/// How the controller reacts to a failed reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Conflicts, timeouts and rate limits; retried with backoff, never terminal
    Transient,
    /// Unresolved or malformed ClusterVersion; retried until the error threshold is hit
    Configuration,
    /// Broken ownership invariants; reported in status and left for the operator
    InvariantViolation,
}

impl VcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VcError::KubeError(kube::Error::Api(resp)) => {
                // 409 Conflict and 429 TooManyRequests are the only retryable client errors
                if (400..500).contains(&resp.code) && resp.code != 409 && resp.code != 429 {
                    ErrorClass::Configuration
                } else {
                    ErrorClass::Transient
                }
            }
            VcError::KubeError(_) => ErrorClass::Transient,
            VcError::PkiError(_) => ErrorClass::Transient,
            VcError::ClusterVersionNotFound(_)
            | VcError::MalformedTemplate(_)
            | VcError::SerializationError(_)
            | VcError::MissingObjectKey(_) => ErrorClass::Configuration,
            VcError::NamespaceCollision(_) | VcError::InvalidPhaseTransition { .. } => {
                ErrorClass::InvariantViolation
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short machine-readable reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            VcError::KubeError(_) => "KubernetesApiError",
            VcError::SerializationError(_) => "SerializationFailed",
            VcError::ClusterVersionNotFound(_) => "ClusterVersionNotFound",
            VcError::MalformedTemplate(_) => "MalformedTemplate",
            VcError::NamespaceCollision(_) => "NamespaceCollision",
            VcError::PkiError(_) => "PkiIssuanceFailed",
            VcError::MissingObjectKey(_) => "MissingObjectKey",
            VcError::InvalidPhaseTransition { .. } => "InvalidPhaseTransition",
        }
    }
}

pub type Result<T> = std::result::Result<T, VcError>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(32) as i32);

        let jitter_range = base * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;

        let delay = (base + jitter).max(0.0).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay)
    }

    /// Invariant violations wait for the operator, everything else backs off
    pub fn delay_for_error(&self, error: &VcError, attempt: u32) -> Duration {
        match error.class() {
            ErrorClass::InvariantViolation => self.max_delay,
            _ => self.delay_for_attempt(attempt),
        }
    }
}
