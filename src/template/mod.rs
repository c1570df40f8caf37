// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resolution of a ClusterVersion into the objects of one root namespace.

use crate::constants::{components, labels, OPERATOR_NAME};
use crate::error::{Result, VcError};
use crate::types::{AppliedClusterVersion, ClusterVersion, ClusterVersionSpec, ComponentTemplate, VirtualCluster};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::{api::ObjectMeta, Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, instrument};

/// Control plane components, in bring-up order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Etcd,
    ApiServer,
    ControllerManager,
}

impl Component {
    /// etcd must serve before the apiserver starts, which must serve before the controller-manager
    pub const ORDERED: [Component; 3] = [Component::Etcd, Component::ApiServer, Component::ControllerManager];

    /// Name of the component's StatefulSet
    pub fn name(&self) -> &'static str {
        match self {
            Component::Etcd => components::ETCD,
            Component::ApiServer => components::APISERVER,
            Component::ControllerManager => components::CONTROLLER_MANAGER,
        }
    }

    /// Name of the component's Service; the controller-manager has none
    pub fn service_name(&self) -> Option<&'static str> {
        match self {
            Component::Etcd => Some(components::ETCD_SERVICE),
            Component::ApiServer => Some(components::APISERVER_SERVICE),
            Component::ControllerManager => None,
        }
    }

    fn template<'a>(&self, spec: &'a ClusterVersionSpec) -> Option<&'a ComponentTemplate> {
        match self {
            Component::Etcd => spec.etcd.as_ref(),
            Component::ApiServer => spec.api_server.as_ref(),
            Component::ControllerManager => spec.controller_manager.as_ref(),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rendered objects of a single component
#[derive(Debug, Clone)]
pub struct ComponentBundle {
    pub component: Component,
    pub service: Option<Service>,
    pub stateful_set: StatefulSet,
}

impl ComponentBundle {
    pub fn desired_replicas(&self) -> i32 {
        self.stateful_set
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1)
    }
}

/// Everything the control plane of one VirtualCluster should consist of
#[derive(Debug, Clone)]
pub struct DesiredBundle {
    pub namespace: String,
    pub cluster_version: String,
    pub cluster_version_hash: String,
    /// One entry per component, in bring-up order
    pub components: Vec<ComponentBundle>,
}

impl DesiredBundle {
    /// Status record marking this bundle as fully applied
    pub fn applied(&self) -> AppliedClusterVersion {
        AppliedClusterVersion {
            name: self.cluster_version.clone(),
            hash: self.cluster_version_hash.clone(),
        }
    }

    pub fn component(&self, component: Component) -> Option<&ComponentBundle> {
        self.components.iter().find(|c| c.component == component)
    }
}

/// Fetch the referenced ClusterVersion and render it for the root namespace
#[instrument(skip(client, vc), fields(vc = %vc.key(), cluster_version = %vc.spec.cluster_version_name))]
pub async fn resolve(
    client: &Client,
    vc: &VirtualCluster,
    namespace: &str,
    default_replicas: i32,
) -> Result<DesiredBundle> {
    let api: Api<ClusterVersion> = Api::all(client.clone());
    let name = &vc.spec.cluster_version_name;

    let cv = api
        .get_opt(name)
        .await?
        .ok_or_else(|| VcError::ClusterVersionNotFound(name.clone()))?;

    let bundle = render(&cv, vc, namespace, default_replicas)?;
    debug!(
        "Resolved ClusterVersion {} ({}) into {} components",
        name,
        &bundle.cluster_version_hash[..12],
        bundle.components.len()
    );
    Ok(bundle)
}

/// Render a ClusterVersion into namespaced objects. Pure; performs no API calls.
pub fn render(
    cv: &ClusterVersion,
    vc: &VirtualCluster,
    namespace: &str,
    default_replicas: i32,
) -> Result<DesiredBundle> {
    let cv_name = cv.name_any();
    let mut rendered = Vec::with_capacity(Component::ORDERED.len());

    for component in Component::ORDERED {
        let template = component.template(&cv.spec).ok_or_else(|| {
            VcError::MalformedTemplate(format!("ClusterVersion {} has no {} template", cv_name, component))
        })?;
        let sts_template = template.stateful_set.as_ref().ok_or_else(|| {
            VcError::MalformedTemplate(format!(
                "ClusterVersion {} has no {} StatefulSet",
                cv_name, component
            ))
        })?;

        let owned = component_labels(component, vc);
        let stateful_set = render_stateful_set(component, sts_template, namespace, &owned, default_replicas)
            .map_err(|msg| VcError::MalformedTemplate(format!("ClusterVersion {}: {}", cv_name, msg)))?;
        let service = match (component.service_name(), template.service.as_ref()) {
            (Some(name), Some(svc)) => Some(render_service(name, svc, namespace, &owned)),
            _ => None,
        };

        rendered.push(ComponentBundle {
            component,
            service,
            stateful_set,
        });
    }

    Ok(DesiredBundle {
        namespace: namespace.to_string(),
        cluster_version: cv_name,
        cluster_version_hash: cv.content_hash()?,
        components: rendered,
    })
}

/// Labels stamped on every object rendered for a component
pub fn component_labels(component: Component, vc: &VirtualCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
        (labels::COMPONENT.to_string(), component.name().to_string()),
        (labels::VC_NAME.to_string(), vc.name_any()),
        (labels::VC_NAMESPACE.to_string(), vc.namespace().unwrap_or_default()),
    ])
}

/// Keep only the template metadata that belongs in a desired object
fn object_meta(template: &ObjectMeta, name: &str, namespace: &str, owned: &BTreeMap<String, String>) -> ObjectMeta {
    let mut merged = template.labels.clone().unwrap_or_default();
    merged.extend(owned.clone());

    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(merged),
        annotations: template.annotations.clone(),
        ..Default::default()
    }
}

fn render_service(name: &str, template: &Service, namespace: &str, owned: &BTreeMap<String, String>) -> Service {
    Service {
        metadata: object_meta(&template.metadata, name, namespace, owned),
        spec: template.spec.clone(),
        status: None,
    }
}

fn render_stateful_set(
    component: Component,
    template: &StatefulSet,
    namespace: &str,
    owned: &BTreeMap<String, String>,
    default_replicas: i32,
) -> std::result::Result<StatefulSet, String> {
    let mut spec = template
        .spec
        .clone()
        .ok_or_else(|| format!("{} StatefulSet has no spec", component))?;

    let has_containers = spec
        .template
        .spec
        .as_ref()
        .is_some_and(|pod| !pod.containers.is_empty());
    if !has_containers {
        return Err(format!("{} StatefulSet has no containers", component));
    }

    spec.replicas.get_or_insert(default_replicas);

    let selector_empty = spec.selector.match_labels.as_ref().map_or(true, |l| l.is_empty())
        && spec.selector.match_expressions.as_ref().map_or(true, |e| e.is_empty());
    if selector_empty {
        spec.selector.match_labels = Some(BTreeMap::from([(
            labels::COMPONENT.to_string(),
            component.name().to_string(),
        )]));
    }

    let pod_meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    pod_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(owned.clone());

    Ok(StatefulSet {
        metadata: object_meta(&template.metadata, component.name(), namespace, owned),
        spec: Some(spec),
        status: None,
    })
}
