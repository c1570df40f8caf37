// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! PKI secret materialization for a virtual control plane.
//!
//! Every root namespace carries six secrets. Each one is created once, when
//! absent, and is never rewritten afterwards: running workloads hold
//! certificates chained to the stored CA, so regenerating it would break them.

pub mod issuer;

pub use issuer::{CertBundle, CertificateIssuer, IssueRequest, PkiRole, RcgenIssuer};

use crate::constants::{components, labels, OPERATOR_NAME};
use crate::error::{Result, VcError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Certificate validity when a VirtualCluster does not set one
pub const DEFAULT_EXPIRE_DAYS: u32 = 365;

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const CA_CERT_KEY: &str = "ca.crt";
const PUBLIC_KEY_KEY: &str = "tls.pub";
const KUBECONFIG_KEY: &str = "kubeconfig";

/// Inputs shared by every secret of one root namespace
#[derive(Debug, Clone)]
pub struct PkiSettings {
    pub namespace: String,
    pub cluster_domain: String,
    pub validity_days: u32,
    /// Name of the owning VirtualCluster, stamped as a label
    pub owner: String,
}

impl PkiSettings {
    /// In-cluster URL of the virtual apiserver
    pub fn server_url(&self) -> String {
        format!(
            "https://{}.{}:{}",
            components::APISERVER_SERVICE,
            self.namespace,
            components::APISERVER_PORT
        )
    }

    /// Subject alternative names of a serving certificate
    pub fn dns_names(&self, role: PkiRole) -> Vec<String> {
        let service = match role {
            PkiRole::ApiServerCa => components::APISERVER_SERVICE,
            PkiRole::EtcdCa => components::ETCD_SERVICE,
            _ => return Vec::new(),
        };
        let ns = &self.namespace;
        let mut names = vec![
            service.to_string(),
            format!("{}.{}", service, ns),
            format!("{}.{}.svc", service, ns),
            format!("{}.{}.svc.{}", service, ns, self.cluster_domain),
        ];
        match role {
            PkiRole::ApiServerCa => {
                names.push("kubernetes".to_string());
                names.push("kubernetes.default".to_string());
                names.push("kubernetes.default.svc".to_string());
                names.push("localhost".to_string());
                names.push("127.0.0.1".to_string());
            }
            // Peer URLs of the etcd StatefulSet pods resolve through the headless service
            _ => {
                names.push(format!("*.{}.{}.svc", service, ns));
                names.push(format!("*.{}.{}.svc.{}", service, ns, self.cluster_domain));
                names.push("localhost".to_string());
                names.push("127.0.0.1".to_string());
            }
        }
        names
    }
}

/// Result of one materialization pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PkiReport {
    pub created: Vec<&'static str>,
    pub existing: Vec<&'static str>,
}

impl PkiReport {
    /// True once every required secret is known to exist
    pub fn complete(&self) -> bool {
        PkiRole::ALL.iter().all(|role| {
            let name = role.secret_name();
            self.created.contains(&name) || self.existing.contains(&name)
        })
    }

    fn record(&mut self, role: PkiRole, created: bool) {
        if created {
            self.created.push(role.secret_name());
        } else {
            self.existing.push(role.secret_name());
        }
    }
}

/// Ensure all six PKI secrets exist in the root namespace.
///
/// Missing secrets are issued through `issuer`; the root CA is read back from
/// its secret whenever it already exists so newly issued certificates chain to
/// the CA that running workloads trust.
#[instrument(skip(client, issuer, settings), fields(namespace = %settings.namespace))]
pub async fn ensure_pki(
    client: &Client,
    issuer: &dyn CertificateIssuer,
    settings: &PkiSettings,
) -> Result<PkiReport> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &settings.namespace);
    let mut report = PkiReport::default();

    let (root_ca, created) = ensure_root_ca(&api, issuer, settings).await?;
    report.record(PkiRole::RootCa, created);

    for role in PkiRole::ALL.into_iter().skip(1) {
        if api.get_opt(role.secret_name()).await?.is_some() {
            debug!("Secret {} already exists", role.secret_name());
            report.record(role, false);
            continue;
        }

        let request = IssueRequest::new(role, settings.validity_days)
            .with_dns_names(settings.dns_names(role))
            .signed_by(root_ca.clone());
        let bundle = issuer.issue(&request)?;
        let secret = build_secret(role, settings, &bundle, &root_ca.cert_pem)?;
        let created = create_secret(&api, &secret).await?;
        report.record(role, created);
    }

    if !report.created.is_empty() {
        info!("Created PKI secrets {:?} in {}", report.created, settings.namespace);
    }
    Ok(report)
}

async fn ensure_root_ca(
    api: &Api<Secret>,
    issuer: &dyn CertificateIssuer,
    settings: &PkiSettings,
) -> Result<(CertBundle, bool)> {
    if let Some(existing) = api.get_opt(PkiRole::RootCa.secret_name()).await? {
        return Ok((bundle_from_secret(&existing)?, false));
    }

    let bundle = issuer.issue(&IssueRequest::new(PkiRole::RootCa, settings.validity_days))?;
    let secret = build_secret(PkiRole::RootCa, settings, &bundle, &bundle.cert_pem)?;
    if create_secret(api, &secret).await? {
        return Ok((bundle, true));
    }

    // Another writer won the race; chain to its CA instead of ours
    let stored = api.get(PkiRole::RootCa.secret_name()).await?;
    Ok((bundle_from_secret(&stored)?, false))
}

/// Create a secret, treating an existing one as success. Returns whether it was created.
async fn create_secret(api: &Api<Secret>, secret: &Secret) -> Result<bool> {
    let pp = PostParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    };
    match api.create(&pp, secret).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read the certificate and key stored in a CA secret
pub fn bundle_from_secret(secret: &Secret) -> Result<CertBundle> {
    let field = |key: &str| -> Result<String> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .ok_or_else(|| VcError::PkiError(format!("secret is missing {}", key)))?;
        String::from_utf8(bytes.0.clone())
            .map_err(|e| VcError::PkiError(format!("{} is not valid UTF-8: {}", key, e)))
    };

    Ok(CertBundle {
        cert_pem: field(TLS_CERT_KEY)?,
        key_pem: field(TLS_KEY_KEY)?,
    })
}

/// Build the immutable secret holding the material of one role
pub fn build_secret(
    role: PkiRole,
    settings: &PkiSettings,
    bundle: &CertBundle,
    ca_cert_pem: &str,
) -> Result<Secret> {
    let mut data = BTreeMap::new();
    let mut put = |key: &str, value: &str| {
        data.insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
    };

    let secret_type = match role {
        PkiRole::ServiceAccount => {
            put(TLS_KEY_KEY, &bundle.key_pem);
            put(PUBLIC_KEY_KEY, &bundle.cert_pem);
            "Opaque"
        }
        kubeconfig_role if kubeconfig_role.is_kubeconfig() => {
            let kubeconfig = render_kubeconfig(role, settings, bundle, ca_cert_pem)?;
            put(KUBECONFIG_KEY, &kubeconfig);
            "Opaque"
        }
        _ => {
            put(TLS_CERT_KEY, &bundle.cert_pem);
            put(TLS_KEY_KEY, &bundle.key_pem);
            put(CA_CERT_KEY, ca_cert_pem);
            "kubernetes.io/tls"
        }
    };

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(role.secret_name().to_string()),
            namespace: Some(settings.namespace.clone()),
            labels: Some(BTreeMap::from([
                (labels::MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
                (labels::COMPONENT.to_string(), "pki".to_string()),
                (labels::VC_NAME.to_string(), settings.owner.clone()),
            ])),
            ..Default::default()
        },
        immutable: Some(true),
        type_: Some(secret_type.to_string()),
        data: Some(data),
        ..Default::default()
    })
}

/// Render a kubeconfig authenticating with the role's client certificate
pub fn render_kubeconfig(
    role: PkiRole,
    settings: &PkiSettings,
    bundle: &CertBundle,
    ca_cert_pem: &str,
) -> Result<String> {
    let (user, _) = role.subject();
    let cluster = settings.namespace.as_str();
    let context = format!("{}@{}", user, cluster);

    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": settings.server_url(),
                "certificate-authority-data": STANDARD.encode(ca_cert_pem),
            }
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate-data": STANDARD.encode(&bundle.cert_pem),
                "client-key-data": STANDARD.encode(&bundle.key_pem),
            }
        }],
        "contexts": [{
            "name": context,
            "context": { "cluster": cluster, "user": user }
        }],
        "current-context": context,
    });

    serde_yaml::to_string(&config)
        .map_err(|e| VcError::PkiError(format!("failed to render kubeconfig: {}", e)))
}
