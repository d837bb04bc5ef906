//! Operations against the provisioned Kubernetes cluster
//!
//! The workflow talks to the cluster only through [`ClusterOps`], obtained
//! from a [`KubeConnector`] once a kubeconfig exists. [`KubeClientConnector`] and
//! [`KubeClusterOps`] are the kube-rs backed defaults.

mod kube_ops;
mod observer;
mod resources;

pub use kube_ops::{KubeClusterOps, KubeClientConnector};
pub use observer::{describe_pod_issue, observe_controller};
pub use resources::{
    aws_auth_config_map, controller_config_map, controller_deployment, parse_install_progress,
    secret, tenants_config_map, InstallProgress,
};

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::config::{ControllerConfig, TenantsConfig};
use crate::Result;

/// Namespace the controller and its configuration live in
pub const CONTROLLER_NAMESPACE: &str = "cluster-controller";
/// Name of the controller Deployment and ServiceAccount
pub const CONTROLLER_DEPLOYMENT: &str = "cluster-controller";
/// Secret holding the system tenant credential
pub const SYSTEM_SECRET_NAME: &str = "system-tenant-auth";
/// Key of the credential inside [`SYSTEM_SECRET_NAME`]
pub const SYSTEM_SECRET_KEY: &str = "token";
/// Stored in place of the system credential when auth is disabled
pub const AUTH_PLACEHOLDER: &str = "auth-disabled";
/// ConfigMap carrying the tenant list
pub const TENANTS_CONFIG_MAP: &str = "tenants-config";
/// ConfigMap carrying the controller configuration
pub const CONTROLLER_CONFIG_MAP: &str = "controller-config";
/// ConfigMap the controller reports installation progress in
pub const PROGRESS_CONFIG_MAP: &str = "install-progress";

/// Opens a session against a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeConnector: Send + Sync {
    /// Build a client from kubeconfig YAML
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterOps>>;
}

/// Cluster-side operations used by the creation workflow
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Names of all namespaces; doubles as a reachability check
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Apply the tenant list ConfigMap
    async fn apply_tenants_config(&self, tenants: &TenantsConfig) -> Result<()>;

    /// Apply the controller ConfigMap, plus the node role mapping on AWS
    async fn apply_controller_config(
        &self,
        config: &ControllerConfig,
        node_role_arn: Option<String>,
    ) -> Result<()>;

    /// Store a single-key secret in the controller namespace
    async fn store_secret(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Apply the controller ServiceAccount and Deployment
    async fn deploy_controller(&self, image: &str, replicas: u32) -> Result<()>;

    /// Watch the controller's workloads and log what happens to them
    ///
    /// Runs until the future is dropped.
    async fn run_observers(&self) -> Result<()>;

    /// Wait until the controller Deployment is available
    async fn wait_for_controller_ready(&self) -> Result<()>;

    /// Wait until the controller reports installation complete
    async fn wait_for_installation_progress(&self) -> Result<()>;
}
