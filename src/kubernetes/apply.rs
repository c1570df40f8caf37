// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Idempotent create-or-patch of namespaced objects.
//!
//! Only fields present in the desired object are compared against the
//! observed one, so defaults filled in by the API server and fields written
//! by other controllers never cause a write. Every object is stamped with a
//! hash of its owned fields, so a field dropped from the desired object shows
//! up as a changed stamp even though the observed object still carries it.
//! When a difference exists the desired object is sent as a server-side apply
//! patch under the operator's field manager. The API server then removes the
//! fields this manager no longer sets and leaves fields owned by other
//! managers untouched.

use crate::constants::{annotations, OPERATOR_NAME};
use crate::error::Result;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use tracing::{debug, info, instrument};

/// What an apply call did to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Patched,
    Unchanged,
}

impl ApplyOutcome {
    pub fn wrote(&self) -> bool {
        !matches!(self, ApplyOutcome::Unchanged)
    }
}

/// Metadata fields the operator sets on the objects it owns
const OWNED_METADATA: [&str; 2] = ["labels", "annotations"];

/// Project an object onto the fields this operator owns: labels,
/// annotations and the spec. Status and server managed metadata are dropped.
pub fn owned_fields<K: Serialize>(object: &K) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;
    let Some(map) = value.as_object_mut() else {
        return Ok(value);
    };

    map.remove("status");
    map.remove("apiVersion");
    map.remove("kind");
    if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
        metadata.retain(|k, _| OWNED_METADATA.contains(&k.as_str()));
    }

    Ok(value)
}

/// Hex encoded sha256 of the owned fields of `desired`, ignoring any stamp it already carries
pub fn applied_hash<K: Serialize>(desired: &K) -> Result<String> {
    let mut owned = owned_fields(desired)?;
    if let Some(Value::Object(notes)) = owned.pointer_mut("/metadata/annotations") {
        notes.remove(annotations::APPLIED_HASH);
    }
    let bytes = serde_json::to_vec(&owned)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Copy of `desired` carrying the hash of its owned fields as an annotation
pub fn stamp_applied_hash<K: Resource + Clone + Serialize>(desired: &K) -> Result<K> {
    let hash = applied_hash(desired)?;
    let mut stamped = desired.clone();
    stamped
        .annotations_mut()
        .insert(annotations::APPLIED_HASH.to_string(), hash);
    Ok(stamped)
}

/// Keys under which a container lists resource quantities
const QUANTITY_MAPS: [&str; 2] = ["limits", "requests"];

/// True when every field set in `desired` has the same value in `observed`.
///
/// Objects may carry extra keys on the observed side; arrays must match
/// element-wise with the same length. Resource quantities compare by value,
/// since the API server stores them in canonical form.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| match have.get(k) {
            Some(h) if QUANTITY_MAPS.contains(&k.as_str()) => quantities_match(v, h),
            Some(h) => is_subset(v, h),
            None => is_empty(v),
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (Value::Null, _) => true,
        (Value::Number(want), Value::Number(have)) => want.as_f64() == have.as_f64(),
        (want, have) => want == have,
    }
}

fn quantities_match(desired: &Value, observed: &Value) -> bool {
    let (Value::Object(want), Value::Object(have)) = (desired, observed) else {
        return is_subset(desired, observed);
    };
    want.iter().all(|(k, v)| match (have.get(k), quantity_value(v)) {
        (Some(h), Some(w)) => quantity_value(h).is_some_and(|h| approx_eq(w, h)),
        (Some(h), None) => is_subset(v, h),
        (None, _) => is_empty(v),
    })
}

fn quantity_value(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => parse_quantity(s),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= f64::EPSILON * 16.0 * a.abs().max(b.abs())
}

const BINARY_SUFFIXES: [(&str, i32); 6] = [("Ki", 10), ("Mi", 20), ("Gi", 30), ("Ti", 40), ("Pi", 50), ("Ei", 60)];

const DECIMAL_SUFFIXES: [(&str, i32); 9] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse a Kubernetes quantity such as `500m`, `1Gi` or `1e3` into its numeric value
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let finite = |v: f64| v.is_finite().then_some(v);

    if let Ok(plain) = quantity.parse::<f64>() {
        return finite(plain);
    }
    for (suffix, exp) in BINARY_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return finite(number.parse::<f64>().ok()? * 2f64.powi(exp));
        }
    }
    for (suffix, exp) in DECIMAL_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            let number = number.parse::<f64>().ok()?;
            let value = if exp < 0 { number / 10f64.powi(-exp) } else { number * 10f64.powi(exp) };
            return finite(value);
        }
    }
    None
}

// Unset, empty maps and empty lists are all omitted by the API server
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.values().all(is_empty),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Decide whether `observed` has drifted from `desired` on owned fields.
///
/// `desired` is stamped first, so an observed object applied from a different
/// desired state always needs a patch, including when fields were removed.
pub fn needs_patch<K: Resource + Clone + Serialize>(desired: &K, observed: &K) -> Result<bool> {
    let stamped = stamp_applied_hash(desired)?;
    Ok(!is_subset(&owned_fields(&stamped)?, &owned_fields(observed)?))
}

/// Create the object if absent, otherwise patch it only when an owned field differs.
#[instrument(skip(client, desired), fields(kind = %K::kind(&()), name = %desired.name_any()))]
pub async fn create_or_patch<K>(client: &Client, namespace: &str, desired: &K) -> Result<ApplyOutcome>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let name = desired.name_any();
    let stamped = stamp_applied_hash(desired)?;

    let Some(observed) = api.get_opt(&name).await? else {
        api.create(&post_params(), &stamped).await?;
        info!("Created {} {}/{}", K::kind(&()), namespace, name);
        return Ok(ApplyOutcome::Created);
    };

    if is_subset(&owned_fields(&stamped)?, &owned_fields(&observed)?) {
        debug!("{} {}/{} is up to date", K::kind(&()), namespace, name);
        return Ok(ApplyOutcome::Unchanged);
    }

    let pp = PatchParams::apply(OPERATOR_NAME).force();
    api.patch(&name, &pp, &Patch::Apply(&stamped)).await?;
    info!("Patched {} {}/{}", K::kind(&()), namespace, name);
    Ok(ApplyOutcome::Patched)
}

/// Create the object if absent; an existing object is never modified.
#[instrument(skip(client, desired), fields(kind = %K::kind(&()), name = %desired.name_any()))]
pub async fn create_if_absent<K>(client: &Client, namespace: &str, desired: &K) -> Result<ApplyOutcome>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let name = desired.name_any();

    if api.get_opt(&name).await?.is_some() {
        debug!("{} {}/{} already exists", K::kind(&()), namespace, name);
        return Ok(ApplyOutcome::Unchanged);
    }

    match api.create(&post_params(), &stamp_applied_hash(desired)?).await {
        Ok(_) => {
            info!("Created {} {}/{}", K::kind(&()), namespace, name);
            Ok(ApplyOutcome::Created)
        }
        // Lost a race against another writer; the existing object wins
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(ApplyOutcome::Unchanged),
        Err(e) => Err(e.into()),
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{conflict_json, object_json, MockService};
    use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
    use serde_json::json;

    const SVC_PATH: &str = "/api/v1/namespaces/vc-ns/services/apiserver-svc";

    fn service(labels: serde_json::Value) -> Service {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "apiserver-svc", "namespace": "vc-ns", "labels": labels },
            "spec": {
                "selector": { "component": "apiserver" },
                "ports": [{ "name": "https", "port": 6443 }]
            }
        }))
        .unwrap()
    }

    /// The same service as the API server would return it, with defaults filled in
    fn observed_service(labels: serde_json::Value) -> Service {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "apiserver-svc",
                "namespace": "vc-ns",
                "uid": "1234",
                "resourceVersion": "77",
                "labels": labels,
                "annotations": { "external.io/note": "kept" }
            },
            "spec": {
                "selector": { "component": "apiserver" },
                "ports": [{ "name": "https", "port": 6443, "protocol": "TCP", "targetPort": 6443 }],
                "clusterIP": "10.0.0.12",
                "type": "ClusterIP",
                "sessionAffinity": "None"
            },
            "status": { "loadBalancer": {} }
        }))
        .unwrap()
    }

    /// `observed` as last applied from `desired`
    fn applied_from(mut observed: Service, desired: &Service) -> Service {
        observed
            .annotations_mut()
            .insert(annotations::APPLIED_HASH.to_string(), applied_hash(desired).unwrap());
        observed
    }

    #[test]
    fn test_owned_fields_drops_status_and_server_metadata() {
        let owned = owned_fields(&observed_service(json!({"a": "b"}))).unwrap();
        assert!(owned.get("status").is_none());
        assert!(owned["metadata"].get("resourceVersion").is_none());
        assert!(owned["metadata"].get("name").is_none());
        assert_eq!(owned["metadata"]["labels"]["a"], "b");
    }

    #[test]
    fn test_is_subset_tolerates_server_defaults() {
        let desired = service(json!({"component": "apiserver"}));
        let observed = applied_from(observed_service(json!({"component": "apiserver", "extra": "x"})), &desired);
        assert!(!needs_patch(&desired, &observed).unwrap());
    }

    #[test]
    fn test_unstamped_object_needs_patch() {
        let desired = service(json!({"component": "apiserver"}));
        let observed = observed_service(json!({"component": "apiserver"}));
        assert!(needs_patch(&desired, &observed).unwrap());
    }

    #[test]
    fn test_stamp_ignores_previous_stamp() {
        let desired = service(json!({"component": "apiserver"}));
        let stamped = stamp_applied_hash(&desired).unwrap();
        assert_eq!(applied_hash(&stamped).unwrap(), applied_hash(&desired).unwrap());
        assert_eq!(stamp_applied_hash(&stamped).unwrap(), stamped);
    }

    #[test]
    fn test_dropped_label_needs_patch() {
        let previous = service(json!({"component": "apiserver", "test-label": "test"}));
        let desired = service(json!({"component": "apiserver"}));
        let observed = applied_from(observed_service(json!({"component": "apiserver", "test-label": "test"})), &previous);
        assert!(is_subset(&owned_fields(&desired).unwrap(), &owned_fields(&observed).unwrap()));
        assert!(needs_patch(&desired, &observed).unwrap());
    }

    #[test]
    fn test_dropped_resource_limit_needs_patch() {
        let with_limits = |limits: serde_json::Value| -> Pod {
            serde_json::from_value(json!({
                "metadata": { "name": "etcd-0", "namespace": "vc-ns" },
                "spec": { "containers": [{ "name": "etcd", "resources": { "limits": limits } }] }
            }))
            .unwrap()
        };
        let previous = with_limits(json!({"cpu": "1", "memory": "1Gi"}));
        let desired = with_limits(json!({"cpu": "1"}));
        let mut observed = with_limits(json!({"cpu": "1", "memory": "1Gi"}));
        observed
            .annotations_mut()
            .insert(annotations::APPLIED_HASH.to_string(), applied_hash(&previous).unwrap());

        assert!(needs_patch(&desired, &observed).unwrap());
        assert!(!needs_patch(&previous, &observed).unwrap());
    }

    #[test]
    fn test_quantities_compare_by_value() {
        let resources = |cpu: &str, memory: &str| json!({"resources": {"limits": {"cpu": cpu, "memory": memory}}});
        assert!(is_subset(&resources("0.5", "1024Mi"), &resources("500m", "1Gi")));
        assert!(is_subset(&resources("1000m", "1G"), &resources("1", "1000M")));
        assert!(!is_subset(&resources("1", "1Gi"), &resources("2", "1Gi")));
        assert!(!is_subset(&resources("1", "1Gi"), &resources("1", "1G")));
        assert!(!is_subset(
            &json!({"requests": {"cpu": "1"}}),
            &json!({"requests": {"cpu": "lots"}})
        ));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("500m"), Some(0.5));
        assert_eq!(parse_quantity("1Ki"), Some(1024.0));
        assert_eq!(parse_quantity("2k"), Some(2000.0));
        assert_eq!(parse_quantity("1e3"), Some(1000.0));
        assert_eq!(parse_quantity("inf"), None);
        assert_eq!(parse_quantity("Gi"), None);
    }

    #[test]
    fn test_is_subset_detects_new_label() {
        let desired = service(json!({"component": "apiserver", "test-label": "test"}));
        let observed = observed_service(json!({"component": "apiserver"}));
        assert!(needs_patch(&desired, &observed).unwrap());
    }

    #[test]
    fn test_is_subset_detects_array_changes() {
        assert!(!is_subset(&json!(["-v=7", "--a"]), &json!(["--a"])));
        assert!(!is_subset(&json!(["--a"]), &json!(["-v=7"])));
        assert!(is_subset(&json!([{"name": "a"}]), &json!([{"name": "a", "x": 1}])));
    }

    #[test]
    fn test_is_subset_treats_missing_empty_as_equal() {
        assert!(is_subset(&json!({"labels": {}}), &json!({})));
        assert!(is_subset(&json!({"args": []}), &json!({})));
        assert!(!is_subset(&json!({"args": ["x"]}), &json!({})));
    }

    #[test]
    fn test_is_subset_compares_numbers_by_value() {
        assert!(is_subset(&json!({"replicas": 1}), &json!({"replicas": 1.0})));
        assert!(!is_subset(&json!({"replicas": 1}), &json!({"replicas": 3})));
    }

    #[tokio::test]
    async fn test_create_or_patch_creates_missing_object() {
        let desired = service(json!({"component": "apiserver"}));
        let mock = MockService::new().on_post(
            "/api/v1/namespaces/vc-ns/services",
            201,
            &object_json(&desired),
        );
        let client = mock.clone().into_client();

        let outcome = create_or_patch(&client, "vc-ns", &desired).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Created);
        assert_eq!(mock.writes().len(), 1);
        assert_eq!(mock.writes()[0].method, "POST");
    }

    #[tokio::test]
    async fn test_create_or_patch_converged_object_makes_no_write() {
        let desired = service(json!({"component": "apiserver"}));
        let observed = applied_from(observed_service(json!({"component": "apiserver"})), &desired);
        let mock = MockService::new().on_get(SVC_PATH, 200, &object_json(&observed));
        let client = mock.clone().into_client();

        let first = create_or_patch(&client, "vc-ns", &desired).await.unwrap();
        let second = create_or_patch(&client, "vc-ns", &desired).await.unwrap();

        assert_eq!(first, ApplyOutcome::Unchanged);
        assert_eq!(second, ApplyOutcome::Unchanged);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_create_or_patch_patches_drifted_object() {
        let desired = service(json!({"component": "apiserver", "test-label": "test"}));
        let observed = observed_service(json!({"component": "apiserver"}));
        let mock = MockService::new()
            .on_get(SVC_PATH, 200, &object_json(&observed))
            .on_patch(SVC_PATH, 200, &object_json(&desired));
        let client = mock.clone().into_client();

        let outcome = create_or_patch(&client, "vc-ns", &desired).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Patched);
        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].method, "PATCH");
        assert_eq!(writes[0].path, SVC_PATH);
    }

    #[tokio::test]
    async fn test_create_or_patch_patches_when_label_dropped() {
        let previous = service(json!({"component": "apiserver", "test-label": "test"}));
        let desired = service(json!({"component": "apiserver"}));
        let observed = applied_from(observed_service(json!({"component": "apiserver", "test-label": "test"})), &previous);
        let mock = MockService::new()
            .on_get(SVC_PATH, 200, &object_json(&observed))
            .on_patch(SVC_PATH, 200, &object_json(&desired));
        let client = mock.clone().into_client();

        let outcome = create_or_patch(&client, "vc-ns", &desired).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Patched);
        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].method, "PATCH");
        assert_eq!(writes[0].path, SVC_PATH);
    }

    #[tokio::test]
    async fn test_create_if_absent_never_touches_existing() {
        let existing: ConfigMap = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "vc-ns" },
            "data": { "old": "value" }
        }))
        .unwrap();
        let mut desired = existing.clone();
        desired.data = Some([("new".to_string(), "value".to_string())].into());
        let mock = MockService::new().on_get(
            "/api/v1/namespaces/vc-ns/configmaps/cm",
            200,
            &object_json(&existing),
        );
        let client = mock.clone().into_client();

        let outcome = create_if_absent(&client, "vc-ns", &desired).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_create_if_absent_tolerates_create_race() {
        let desired: ConfigMap = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "vc-ns" }
        }))
        .unwrap();
        let mock = MockService::new().on_post(
            "/api/v1/namespaces/vc-ns/configmaps",
            409,
            &conflict_json("cm"),
        );
        let client = mock.clone().into_client();

        let outcome = create_if_absent(&client, "vc-ns", &desired).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }
}
