// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Dependency-ordered application of a desired bundle to the root namespace.

use crate::error::Result;
use crate::kubernetes::apply::{create_if_absent, create_or_patch, ApplyOutcome};
use crate::lifecycle::phase::ComponentReadiness;
use crate::lifecycle::upgrade::ApplyMode;
use crate::template::{Component, ComponentBundle, DesiredBundle};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Api, Client};
use tracing::{debug, info, instrument};

/// What one pass over the bundle achieved
#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
    /// Observed readiness of every component, in bring-up order
    pub readiness: Vec<ComponentReadiness>,
    /// Number of create or patch calls issued
    pub writes: usize,
    /// First component held back because a predecessor is not ready
    pub blocked_on: Option<Component>,
}

impl ProvisionReport {
    /// Every component of the bundle was applied in this pass
    pub fn fully_applied(&self) -> bool {
        self.blocked_on.is_none()
    }

    fn count(&mut self, outcome: ApplyOutcome) {
        if outcome.wrote() {
            self.writes += 1;
        }
    }
}

/// Apply the bundle component by component.
///
/// Outside of an upgrade a component is only applied once every component
/// before it is ready; readiness of the held back components is still observed.
/// During an upgrade everything is patched in one pass so the new version is
/// rolled out as a whole.
#[instrument(skip(client, bundle), fields(namespace = %bundle.namespace, version = %bundle.cluster_version))]
pub async fn apply_bundle(client: &Client, bundle: &DesiredBundle, mode: ApplyMode) -> Result<ProvisionReport> {
    let mut report = ProvisionReport::default();
    let gated = mode != ApplyMode::Upgrade;

    for component in &bundle.components {
        let predecessors_ready = report.readiness.iter().all(|r| r.is_ready());
        if gated && !predecessors_ready && report.blocked_on.is_none() {
            debug!("Holding back {} until its dependencies are ready", component.component);
            report.blocked_on = Some(component.component);
        }

        if report.blocked_on.is_none() {
            apply_component(client, &bundle.namespace, component, mode, &mut report).await?;
        }

        report
            .readiness
            .push(observe(client, &bundle.namespace, component).await?);
    }

    if report.writes > 0 {
        info!("Applied {} changes to {}", report.writes, bundle.namespace);
    }
    Ok(report)
}

async fn apply_component(
    client: &Client,
    namespace: &str,
    component: &ComponentBundle,
    mode: ApplyMode,
    report: &mut ProvisionReport,
) -> Result<()> {
    // Service first so the StatefulSet's pods resolve their peers from the start
    if let Some(service) = &component.service {
        let outcome = match mode {
            ApplyMode::Hold => create_if_absent(client, namespace, service).await?,
            _ => create_or_patch(client, namespace, service).await?,
        };
        report.count(outcome);
    }

    let outcome = match mode {
        ApplyMode::Hold => create_if_absent(client, namespace, &component.stateful_set).await?,
        _ => create_or_patch(client, namespace, &component.stateful_set).await?,
    };
    report.count(outcome);
    Ok(())
}

/// Read the StatefulSet of a component and judge its readiness
pub async fn observe(client: &Client, namespace: &str, component: &ComponentBundle) -> Result<ComponentReadiness> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let desired = component.desired_replicas();

    Ok(match api.get_opt(component.component.name()).await? {
        Some(sts) => ComponentReadiness::from_stateful_set(component.component, desired, &sts),
        None => ComponentReadiness::missing(component.component, desired),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kubernetes::apply::stamp_applied_hash;
    use crate::template::render;
    use crate::test_utils::{object_json, MockService};
    use crate::types::cluster_version::tests::sample_cluster_version;
    use crate::types::virtual_cluster::tests::make_vc;
    use crate::types::ClusterVersion;
    use serde_json::json;

    pub(crate) const STS_PATH: &str = "/apis/apps/v1/namespaces/vc-ns/statefulsets";
    pub(crate) const SVC_PATH: &str = "/api/v1/namespaces/vc-ns/services";

    pub(crate) fn bundle_for(cv: &ClusterVersion) -> DesiredBundle {
        render(cv, &make_vc("vc", None), "vc-ns", 1).unwrap()
    }

    /// The StatefulSet as the API server would return it, with the given readiness
    pub(crate) fn observed_sts(sts: &StatefulSet, ready: i32) -> String {
        let mut value = serde_json::to_value(stamp_applied_hash(sts).unwrap()).unwrap();
        value["metadata"]["uid"] = json!("sts-uid");
        value["status"] = json!({ "replicas": 1, "readyReplicas": ready });
        value.to_string()
    }

    /// Serve every object of the bundle as existing, with the given readiness per component
    pub(crate) fn serve_existing(mut mock: MockService, bundle: &DesiredBundle, ready: i32) -> MockService {
        for c in &bundle.components {
            mock = mock.on_get(
                &format!("{}/{}", STS_PATH, c.component.name()),
                200,
                &observed_sts(&c.stateful_set, ready),
            );
            if let (Some(svc), Some(name)) = (&c.service, c.component.service_name()) {
                mock = mock.on_get(
                    &format!("{}/{}", SVC_PATH, name),
                    200,
                    &object_json(&stamp_applied_hash(svc).unwrap()),
                );
            }
        }
        mock
    }

    #[tokio::test]
    async fn test_fresh_namespace_starts_with_etcd_only() {
        let bundle = bundle_for(&sample_cluster_version("cv"));
        let mock = MockService::new()
            .on_post(STS_PATH, 201, &object_json(&bundle.components[0].stateful_set))
            .on_post(SVC_PATH, 201, &object_json(bundle.components[0].service.as_ref().unwrap()));
        let client = mock.clone().into_client();

        let report = apply_bundle(&client, &bundle, ApplyMode::Provision).await.unwrap();

        assert_eq!(report.blocked_on, Some(Component::ApiServer));
        assert!(!report.fully_applied());
        assert_eq!(report.writes, 2);
        let paths: Vec<_> = mock.writes().into_iter().map(|w| w.path).collect();
        assert_eq!(paths, vec![SVC_PATH.to_string(), STS_PATH.to_string()]);
        assert_eq!(report.readiness.len(), 3);
    }

    #[tokio::test]
    async fn test_converged_bundle_makes_no_writes() {
        let bundle = bundle_for(&sample_cluster_version("cv"));
        let mock = serve_existing(MockService::new(), &bundle, 1);
        let client = mock.clone().into_client();

        let report = apply_bundle(&client, &bundle, ApplyMode::Converge).await.unwrap();

        assert!(report.fully_applied());
        assert_eq!(report.writes, 0);
        assert!(report.readiness.iter().all(|r| r.is_ready()));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unready_etcd_holds_back_apiserver() {
        let bundle = bundle_for(&sample_cluster_version("cv"));
        let mock = serve_existing(MockService::new(), &bundle, 0);
        let client = mock.clone().into_client();

        let report = apply_bundle(&client, &bundle, ApplyMode::Converge).await.unwrap();

        assert_eq!(report.blocked_on, Some(Component::ApiServer));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_patches_only_changed_component() {
        let old = bundle_for(&sample_cluster_version("cv"));
        let mut cv = sample_cluster_version("cv");
        let sts = cv.spec.api_server.as_mut().unwrap().stateful_set.as_mut().unwrap();
        let container = &mut sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0];
        container.args.get_or_insert_with(Vec::new).insert(0, "-v=7".to_string());
        let new = bundle_for(&cv);

        let mock = serve_existing(MockService::new(), &old, 1).on_patch(
            &format!("{}/apiserver", STS_PATH),
            200,
            &object_json(&new.components[1].stateful_set),
        );
        let client = mock.clone().into_client();

        let report = apply_bundle(&client, &new, ApplyMode::Upgrade).await.unwrap();

        assert!(report.fully_applied());
        assert_eq!(report.writes, 1);
        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].method, "PATCH");
        assert_eq!(writes[0].path, format!("{}/apiserver", STS_PATH));
    }

    #[tokio::test]
    async fn test_upgrade_removes_dropped_service_label() {
        let mut old_cv = sample_cluster_version("cv");
        old_cv
            .spec
            .api_server
            .as_mut()
            .unwrap()
            .service
            .as_mut()
            .unwrap()
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("test-label".to_string(), "test".to_string());
        let old = bundle_for(&old_cv);
        let new = bundle_for(&sample_cluster_version("cv"));
        let svc_path = format!("{}/{}", SVC_PATH, new.components[1].component.service_name().unwrap());

        let mock = serve_existing(MockService::new(), &old, 1).on_patch(
            &svc_path,
            200,
            &object_json(new.components[1].service.as_ref().unwrap()),
        );
        let client = mock.clone().into_client();

        let report = apply_bundle(&client, &new, ApplyMode::Upgrade).await.unwrap();

        assert_eq!(report.writes, 1);
        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].method, "PATCH");
        assert_eq!(writes[0].path, svc_path);
    }

    #[tokio::test]
    async fn test_hold_never_patches_existing_objects() {
        let old = bundle_for(&sample_cluster_version("cv"));
        let mut cv = sample_cluster_version("cv");
        let svc = cv.spec.api_server.as_mut().unwrap().service.as_mut().unwrap();
        svc.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("test-label".to_string(), "test".to_string());
        let new = bundle_for(&cv);

        let mock = serve_existing(MockService::new(), &old, 1);
        let client = mock.clone().into_client();

        let report = apply_bundle(&client, &new, ApplyMode::Hold).await.unwrap();

        assert_eq!(report.writes, 0);
        assert!(mock.writes().is_empty());
    }
}
