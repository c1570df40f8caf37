// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// API group of the ClusterVersion and VirtualCluster CRDs
pub const API_GROUP: &str = "tenancy.x-k8s.io";

/// API version of the ClusterVersion and VirtualCluster CRDs
pub const API_VERSION: &str = "v1alpha1";

/// The operator name used for server-side apply and as field manager
pub const OPERATOR_NAME: &str = "vc-manager";

/// Finalizer guarding VirtualCluster removal until teardown has been issued
pub const FINALIZER: &str = "tenancy.x-k8s.io/virtualcluster";

/// Kubernetes label keys used by the VirtualCluster controller
pub mod labels {
    /// Marks every object created by this operator
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Control plane component an object belongs to
    pub const COMPONENT: &str = "app.kubernetes.io/component";
    /// Name of the owning VirtualCluster
    pub const VC_NAME: &str = "tenancy.x-k8s.io/vc-name";
    /// Namespace of the owning VirtualCluster
    pub const VC_NAMESPACE: &str = "tenancy.x-k8s.io/vc-namespace";
    /// UID of the owning VirtualCluster, set on the root namespace
    pub const VC_UID: &str = "tenancy.x-k8s.io/vc-uid";
    /// When set to "true" on a VirtualCluster, allows an upgrade to a changed ClusterVersion
    pub const READY_FOR_UPGRADE: &str = "tenancy.x-k8s.io/ready-for-upgrade";
}

/// Kubernetes annotation keys used by the VirtualCluster controller
pub mod annotations {
    /// Hash of the owned fields last applied to a control plane object
    pub const APPLIED_HASH: &str = "tenancy.x-k8s.io/applied-hash";
}

/// Names of the PKI secrets created in every root namespace
pub mod secrets {
    pub const ROOT_CA: &str = "root-ca";
    pub const APISERVER_CA: &str = "apiserver-ca";
    pub const ETCD_CA: &str = "etcd-ca";
    pub const CONTROLLER_MANAGER: &str = "controller-manager-kubeconfig";
    pub const ADMIN: &str = "admin-kubeconfig";
    pub const SERVICE_ACCOUNT: &str = "serviceaccount-rsa";
}

/// Canonical names of the control plane objects in a root namespace
pub mod components {
    pub const ETCD: &str = "etcd";
    pub const APISERVER: &str = "apiserver";
    pub const CONTROLLER_MANAGER: &str = "controller-manager";
    pub const ETCD_SERVICE: &str = "etcd";
    pub const APISERVER_SERVICE: &str = "apiserver-svc";
    /// Secure port served by the apiserver service
    pub const APISERVER_PORT: u16 = 6443;
}

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}
