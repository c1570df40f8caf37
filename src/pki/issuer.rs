// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Certificate issuance for the control plane PKI.
//!
//! The operator only decides which certificates are needed and where they
//! are stored; producing key material is delegated to a [`CertificateIssuer`].
//! [`RcgenIssuer`] is the in-process default: it issues a self-signed root CA
//! and signs every other role with it.

use crate::constants::secrets;
use crate::error::{Result, VcError};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};

/// One entry of the PKI secret set of a virtual control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PkiRole {
    RootCa,
    ApiServerCa,
    EtcdCa,
    ControllerManager,
    Admin,
    ServiceAccount,
}

impl PkiRole {
    /// Every role, root CA first since all others are signed by it
    pub const ALL: [PkiRole; 6] = [
        PkiRole::RootCa,
        PkiRole::ApiServerCa,
        PkiRole::EtcdCa,
        PkiRole::ControllerManager,
        PkiRole::Admin,
        PkiRole::ServiceAccount,
    ];

    pub fn secret_name(&self) -> &'static str {
        match self {
            PkiRole::RootCa => secrets::ROOT_CA,
            PkiRole::ApiServerCa => secrets::APISERVER_CA,
            PkiRole::EtcdCa => secrets::ETCD_CA,
            PkiRole::ControllerManager => secrets::CONTROLLER_MANAGER,
            PkiRole::Admin => secrets::ADMIN,
            PkiRole::ServiceAccount => secrets::SERVICE_ACCOUNT,
        }
    }

    /// Subject common name and organization of the issued certificate
    pub fn subject(&self) -> (&'static str, Option<&'static str>) {
        match self {
            PkiRole::RootCa => ("kubernetes", None),
            PkiRole::ApiServerCa => ("kube-apiserver", None),
            PkiRole::EtcdCa => ("etcd", None),
            PkiRole::ControllerManager => ("system:kube-controller-manager", None),
            PkiRole::Admin => ("admin", Some("system:masters")),
            PkiRole::ServiceAccount => ("service-accounts", None),
        }
    }

    /// Roles whose secret holds a kubeconfig instead of a bare certificate
    pub fn is_kubeconfig(&self) -> bool {
        matches!(self, PkiRole::ControllerManager | PkiRole::Admin)
    }

    fn is_server(&self) -> bool {
        matches!(self, PkiRole::ApiServerCa | PkiRole::EtcdCa)
    }
}

/// PEM encoded certificate (or public key) and private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub role: PkiRole,
    pub common_name: String,
    pub organization: Option<String>,
    /// Subject alternative names; IP addresses are recognised as such
    pub dns_names: Vec<String>,
    pub validity_days: u32,
    /// CA used to sign the certificate, `None` for a self-signed CA
    pub signer: Option<CertBundle>,
}

impl IssueRequest {
    pub fn new(role: PkiRole, validity_days: u32) -> Self {
        let (cn, org) = role.subject();
        IssueRequest {
            role,
            common_name: cn.to_string(),
            organization: org.map(str::to_string),
            dns_names: Vec::new(),
            validity_days,
            signer: None,
        }
    }

    pub fn with_dns_names(mut self, dns_names: Vec<String>) -> Self {
        self.dns_names = dns_names;
        self
    }

    pub fn signed_by(mut self, signer: CertBundle) -> Self {
        self.signer = Some(signer);
        self
    }
}

/// Produces key material for a single PKI role
pub trait CertificateIssuer: Send + Sync {
    fn issue(&self, request: &IssueRequest) -> Result<CertBundle>;
}

/// Issues certificates in-process with rcgen
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenIssuer;

impl CertificateIssuer for RcgenIssuer {
    fn issue(&self, request: &IssueRequest) -> Result<CertBundle> {
        let key_pair = KeyPair::generate()
            .map_err(|e| VcError::PkiError(format!("failed to generate key: {}", e)))?;
        let key_pem = key_pair.serialize_pem();

        // The service account signing key is a bare key pair
        if request.role == PkiRole::ServiceAccount {
            return Ok(CertBundle {
                cert_pem: key_pair.public_key_pem(),
                key_pem,
            });
        }

        let params = certificate_params(request)?;
        let cert = match &request.signer {
            Some(signer) => {
                let ca_key = KeyPair::from_pem(&signer.key_pem)
                    .map_err(|e| VcError::PkiError(format!("failed to parse CA key: {}", e)))?;
                let issuer = Issuer::from_ca_cert_pem(&signer.cert_pem, &ca_key)
                    .map_err(|e| VcError::PkiError(format!("failed to load CA certificate: {}", e)))?;
                params.signed_by(&key_pair, &issuer)
            }
            None if request.role == PkiRole::RootCa => params.self_signed(&key_pair),
            None => {
                return Err(VcError::PkiError(format!(
                    "{:?} certificate requires a signing CA",
                    request.role
                )))
            }
        }
        .map_err(|e| VcError::PkiError(format!("failed to issue {:?} certificate: {}", request.role, e)))?;

        Ok(CertBundle {
            cert_pem: cert.pem(),
            key_pem,
        })
    }
}

fn certificate_params(request: &IssueRequest) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(request.dns_names.clone())
        .map_err(|e| VcError::PkiError(format!("invalid subject alternative name: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(request.common_name.clone()));
    if let Some(org) = &request.organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    params.distinguished_name = dn;

    if request.role == PkiRole::RootCa {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
    } else {
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        // etcd peers and the apiserver both serve and dial with the same certificate
        params.extended_key_usages = if request.role.is_server() {
            vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth]
        } else {
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        };
    }

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(request.validity_days));

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::pem::parse_x509_pem;

    fn root() -> CertBundle {
        RcgenIssuer.issue(&IssueRequest::new(PkiRole::RootCa, 365)).unwrap()
    }

    #[test]
    fn test_every_role_has_a_distinct_secret() {
        let mut names: Vec<_> = PkiRole::ALL.iter().map(|r| r.secret_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 6);
        assert_eq!(PkiRole::ALL[0], PkiRole::RootCa);
    }

    #[test]
    fn test_root_ca_is_self_signed_ca() {
        let ca = root();
        assert!(ca.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));

        let (_, pem) = parse_x509_pem(ca.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let constraints = cert.basic_constraints().unwrap().unwrap();
        assert!(constraints.value.ca);

        // The stored PEM pair must be usable to sign further certificates
        let key = KeyPair::from_pem(&ca.key_pem).unwrap();
        assert!(Issuer::from_ca_cert_pem(&ca.cert_pem, key).is_ok());
    }

    #[test]
    fn test_signed_certificate_is_not_a_ca() {
        let request = IssueRequest::new(PkiRole::ApiServerCa, 30)
            .with_dns_names(vec!["apiserver-svc.vc-ns".to_string(), "127.0.0.1".to_string()])
            .signed_by(root());

        let bundle = RcgenIssuer.issue(&request).unwrap();

        let (_, pem) = parse_x509_pem(bundle.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let is_ca = cert.basic_constraints().unwrap().is_some_and(|bc| bc.value.ca);
        assert!(!is_ca);
        let sans = cert.subject_alternative_name().unwrap().unwrap();
        assert_eq!(sans.value.general_names.len(), 2);
    }

    #[test]
    fn test_leaf_without_signer_is_rejected() {
        let result = RcgenIssuer.issue(&IssueRequest::new(PkiRole::Admin, 30));
        assert!(matches!(result, Err(VcError::PkiError(_))));
    }

    #[test]
    fn test_service_account_is_a_key_pair() {
        let bundle = RcgenIssuer
            .issue(&IssueRequest::new(PkiRole::ServiceAccount, 30))
            .unwrap();
        assert!(bundle.cert_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(bundle.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_only_client_roles_carry_kubeconfigs() {
        let kubeconfigs: Vec<_> = PkiRole::ALL.into_iter().filter(PkiRole::is_kubeconfig).collect();
        assert_eq!(kubeconfigs, vec![PkiRole::ControllerManager, PkiRole::Admin]);
    }

    #[test]
    fn test_admin_subject_is_system_masters() {
        let request = IssueRequest::new(PkiRole::Admin, 30);
        assert_eq!(request.common_name, "admin");
        assert_eq!(request.organization.as_deref(), Some("system:masters"));
    }
}
