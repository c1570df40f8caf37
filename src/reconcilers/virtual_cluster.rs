// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! VirtualCluster reconciler - drives each VirtualCluster from creation to a
//! running control plane in its root namespace, and tears it down on deletion.

use crate::config::Config;
use crate::constants::{labels, OPERATOR_NAME};
use crate::error::{BackoffConfig, ErrorClass, Result, VcError};
use crate::kubernetes::ensure_root_namespace;
use crate::lifecycle::{
    add_finalizer, apply_bundle, consume_upgrade_label, decide_mode, derive_phase, patch_status,
    teardown, upgrade_consumed, ApplyMode, ConditionBuilder, PhaseInput, ProvisionReport,
};
use crate::pki::{ensure_pki, CertificateIssuer, PkiReport, PkiSettings, RcgenIssuer, DEFAULT_EXPIRE_DAYS};
use crate::template::{self, DesiredBundle};
use crate::types::{ClusterPhase, ClusterVersion, VirtualCluster, VirtualClusterStatus};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
        Controller,
    },
    Api, Client, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn};

/// Shared state handed to every reconcile call
pub struct Context {
    pub client: Client,
    pub config: Config,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub errors: ErrorTracker,
    pub backoff: BackoffConfig,
}

impl Context {
    pub fn new(client: Client, config: Config) -> Self {
        Self::with_issuer(client, config, Arc::new(RcgenIssuer))
    }

    pub fn with_issuer(client: Client, config: Config, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            client,
            config,
            issuer,
            errors: ErrorTracker::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Consecutive failed reconcile passes per VirtualCluster
#[derive(Debug, Default)]
pub struct ErrorTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl ErrorTracker {
    /// Count a failure and return the number of consecutive failures
    pub fn record(&self, key: &str) -> u32 {
        let mut attempts = self.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    // A panic while holding the lock leaves plain counters behind, keep using them
    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct VirtualClusterReconciler {
    ctx: Arc<Context>,
}

impl VirtualClusterReconciler {
    pub fn new(client: Client, config: Config) -> Self {
        Self {
            ctx: Arc::new(Context::new(client, config)),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let client = self.ctx.client.clone();
        let config = &self.ctx.config;

        let virtual_clusters: Api<VirtualCluster> = Api::all(client.clone());
        let stateful_sets: Api<StatefulSet> = Api::all(client.clone());
        let cluster_versions: Api<ClusterVersion> = Api::all(client);

        let controller = Controller::new(virtual_clusters, WatcherConfig::default());
        let store = controller.store();
        let managed = WatcherConfig::default().labels(&format!("{}={}", labels::MANAGED_BY, OPERATOR_NAME));

        info!(
            "Starting VirtualCluster controller (concurrency={}, debounce={:?})",
            config.concurrency, config.debounce
        );

        controller
            .watches(stateful_sets, managed, |sts| virtual_cluster_for(&sts))
            .watches(cluster_versions, WatcherConfig::default(), move |cv| {
                referencing_virtual_clusters(store.state(), &cv.name_any())
            })
            .with_config(
                controller::Config::default()
                    .debounce(config.debounce)
                    .concurrency(config.concurrency),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.ctx.clone())
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled virtual cluster: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

/// Map a managed StatefulSet back to the VirtualCluster it belongs to
fn virtual_cluster_for(sts: &StatefulSet) -> Option<ObjectRef<VirtualCluster>> {
    let owner = sts.labels();
    let name = owner.get(labels::VC_NAME)?;
    let namespace = owner.get(labels::VC_NAMESPACE)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Every known VirtualCluster rendered from the named ClusterVersion
fn referencing_virtual_clusters(
    known: impl IntoIterator<Item = Arc<VirtualCluster>>,
    cluster_version: &str,
) -> Vec<ObjectRef<VirtualCluster>> {
    known
        .into_iter()
        .filter(|vc| vc.spec.cluster_version_name == cluster_version)
        .map(|vc| ObjectRef::from_obj(vc.as_ref()))
        .collect()
}

#[instrument(skip(vc, ctx), fields(vc = %vc.key()))]
pub async fn reconcile(vc: Arc<VirtualCluster>, ctx: Arc<Context>) -> Result<Action> {
    let key = vc.key();

    match reconcile_inner(&vc, &ctx).await {
        Ok(action) => {
            ctx.errors.reset(&key);
            Ok(action)
        }
        Err(e) => {
            let attempts = ctx.errors.record(&key);
            if !e.is_retryable() && !vc.is_deleting() {
                report_failure(&vc, &e, attempts, &ctx).await;
            }
            Err(e)
        }
    }
}

async fn reconcile_inner(vc: &VirtualCluster, ctx: &Context) -> Result<Action> {
    let client = &ctx.client;

    if vc.is_deleting() {
        teardown(client, vc).await?;
        return Ok(Action::await_change());
    }

    // The root namespace is fixed before anything is created for it
    let Some(namespace) = vc.cluster_namespace() else {
        let namespace = vc.root_namespace_name()?;
        let mut status = vc.status.clone().unwrap_or_default();
        status.cluster_namespace = Some(namespace.clone());
        status.observed_generation = vc.metadata.generation;
        patch_status(client, vc, &status).await?;
        info!("Assigned root namespace {}", namespace);
        return Ok(Action::requeue(ctx.config.progress_interval));
    };

    if !vc.has_finalizer() {
        add_finalizer(client, vc).await?;
        return Ok(Action::requeue(ctx.config.progress_interval));
    }

    let bundle = template::resolve(client, vc, namespace, ctx.config.default_replicas).await?;
    ensure_root_namespace(client, namespace, vc).await?;

    let settings = PkiSettings {
        namespace: namespace.to_string(),
        cluster_domain: vc
            .spec
            .cluster_domain
            .clone()
            .unwrap_or_else(|| ctx.config.cluster_domain.clone()),
        validity_days: vc.spec.pki_expire_days.unwrap_or(DEFAULT_EXPIRE_DAYS),
        owner: vc.name_any(),
    };
    let pki = ensure_pki(client, ctx.issuer.as_ref(), &settings).await?;

    let mode = decide_mode(vc, &bundle);
    debug!("Applying {} in {} mode", bundle.cluster_version, mode);
    let report = apply_bundle(client, &bundle, mode).await?;

    let status = desired_status(vc, &bundle, mode, &pki, &report);
    let phase = status.phase;
    if phase != vc.phase() {
        info!("Phase {} -> {}", vc.phase(), phase);
    }
    patch_status(client, vc, &status).await?;

    if upgrade_consumed(vc, &status, &bundle) {
        consume_upgrade_label(client, vc).await?;
    }

    let converged = phase == ClusterPhase::Running && mode != ApplyMode::Upgrade && report.fully_applied();
    Ok(Action::requeue(if converged {
        ctx.config.resync_interval
    } else {
        ctx.config.progress_interval
    }))
}

/// Status after a successful pass over the bundle
fn desired_status(
    vc: &VirtualCluster,
    bundle: &DesiredBundle,
    mode: ApplyMode,
    pki: &PkiReport,
    report: &ProvisionReport,
) -> VirtualClusterStatus {
    let input = PhaseInput {
        current: vc.phase(),
        deleting: false,
        has_finalizer: true,
        namespace_assigned: true,
        failed: false,
        upgrade_applied: mode == ApplyMode::Upgrade,
        readiness: report.readiness.clone(),
    };
    let phase = derive_phase(&input);
    let all_ready = input.all_ready();
    let waiting_on = input.not_ready().join(", ");

    let mut status = vc.status.clone().unwrap_or_default();
    status.phase = phase;
    status.observed_generation = vc.metadata.generation;

    // Hold leaves the previous version recorded so the change stays pending
    if mode != ApplyMode::Hold && report.fully_applied() && pki.complete() {
        status.applied_cluster_version = Some(bundle.applied());
    }

    (status.reason, status.message) = match phase {
        ClusterPhase::Running => (None, None),
        ClusterPhase::Upgrading => (
            Some("Upgrading".to_string()),
            Some(format!("Rolling out ClusterVersion {}", bundle.cluster_version)),
        ),
        _ => (
            Some("Provisioning".to_string()),
            Some(format!("Waiting for {}", waiting_on)),
        ),
    };

    let ready_message = if all_ready {
        String::new()
    } else {
        format!("Waiting for {}", waiting_on)
    };
    let progressing = matches!(phase, ClusterPhase::Creating | ClusterPhase::Upgrading);
    let held = mode == ApplyMode::Hold;

    status.conditions = ConditionBuilder::from_existing(std::mem::take(&mut status.conditions), vc.metadata.generation)
        .namespace_ready(true, "NamespaceReady", "")
        .pki_ready(pki.complete(), if pki.complete() { "SecretsPresent" } else { "SecretsMissing" }, "")
        .ready(
            all_ready,
            if all_ready { "AllComponentsReady" } else { "ComponentsNotReady" },
            &ready_message,
        )
        .progressing(progressing, &phase.to_string(), "")
        .upgrade_available(
            held,
            if held { "ClusterVersionChanged" } else { "UpToDate" },
            &if held {
                format!("Set label {}=true to roll out {}", labels::READY_FOR_UPGRADE, bundle.cluster_version)
            } else {
                String::new()
            },
        )
        .build();

    status
}

/// Status after a failed pass that is not worth retrying quietly.
///
/// Invariant violations move the VirtualCluster to Error at once, configuration
/// errors only after `threshold` consecutive failures.
fn failure_status(vc: &VirtualCluster, error: &VcError, attempts: u32, threshold: u32) -> VirtualClusterStatus {
    let give_up = match error.class() {
        ErrorClass::InvariantViolation => true,
        ErrorClass::Configuration => attempts >= threshold,
        ErrorClass::Transient => false,
    };

    let mut status = vc.status.clone().unwrap_or_default();
    if give_up {
        status.phase = derive_phase(&PhaseInput {
            current: vc.phase(),
            deleting: false,
            has_finalizer: vc.has_finalizer(),
            namespace_assigned: vc.cluster_namespace().is_some(),
            failed: true,
            upgrade_applied: false,
            readiness: Vec::new(),
        });
    }
    status.reason = Some(error.reason().to_string());
    status.message = Some(error.to_string());
    status.conditions = ConditionBuilder::from_existing(std::mem::take(&mut status.conditions), vc.metadata.generation)
        .failure(error)
        .build();
    status
}

async fn report_failure(vc: &VirtualCluster, error: &VcError, attempts: u32, ctx: &Context) {
    let status = failure_status(vc, error, attempts, ctx.config.error_threshold);
    if status.phase == ClusterPhase::Error && vc.phase() != ClusterPhase::Error {
        error!("VirtualCluster entered Error after {} attempts: {}", attempts, error);
    }
    if let Err(e) = patch_status(&ctx.client, vc, &status).await {
        warn!("Failed to record failure in status: {}", e);
    }
}

pub fn error_policy(vc: Arc<VirtualCluster>, error: &VcError, ctx: Arc<Context>) -> Action {
    let attempts = ctx.errors.attempts(&vc.key());
    let delay = ctx.backoff.delay_for_error(error, attempts.saturating_sub(1));

    if error.is_retryable() {
        warn!(
            "Reconcile of {} failed (attempt {}), retrying in {:?}: {}",
            vc.key(),
            attempts,
            delay,
            error
        );
    } else {
        error!(
            "Reconcile of {} failed (attempt {}), retrying in {:?}: {}",
            vc.key(),
            attempts,
            delay,
            error
        );
    }
    Action::requeue(delay)
}
