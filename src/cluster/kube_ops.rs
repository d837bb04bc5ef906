//! kube-rs backed cluster operations

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, info};

use super::resources::{self, controller_service_account, InstallProgress};
use super::{
    observer, ClusterOps, KubeConnector, CONTROLLER_DEPLOYMENT, CONTROLLER_NAMESPACE,
    PROGRESS_CONFIG_MAP,
};
use crate::config::{ControllerConfig, TenantsConfig};
use crate::kube_utils::{
    apply_namespaced, client_from_kubeconfig, ensure_namespace, wait_for_deployment,
    DEFAULT_POLL_INTERVAL,
};
use crate::{Error, Result};

/// Upper bound for the controller readiness waits
///
/// The attempt deadline normally ends the wait first.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Connector creating [`KubeClusterOps`] sessions
#[derive(Clone, Debug)]
pub struct KubeClientConnector {
    ready_timeout: Duration,
}

impl Default for KubeClientConnector {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

#[async_trait]
impl KubeConnector for KubeClientConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterOps>> {
        let client = client_from_kubeconfig(kubeconfig).await?;
        Ok(Arc::new(KubeClusterOps::new(client, self.ready_timeout)))
    }
}

/// Cluster operations over a kube client
#[derive(Clone)]
pub struct KubeClusterOps {
    client: Client,
    ready_timeout: Duration,
}

impl KubeClusterOps {
    /// Wrap an existing client
    pub fn new(client: Client, ready_timeout: Duration) -> Self {
        Self {
            client,
            ready_timeout,
        }
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(|e| {
            Error::internal_with_context("list_namespaces", format!("failed to list namespaces: {}", e))
        })?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn apply_tenants_config(&self, tenants: &TenantsConfig) -> Result<()> {
        ensure_namespace(&self.client, CONTROLLER_NAMESPACE).await?;
        let cm = resources::tenants_config_map(tenants)?;
        apply_namespaced(&self.client, CONTROLLER_NAMESPACE, &cm).await
    }

    async fn apply_controller_config(
        &self,
        config: &ControllerConfig,
        node_role_arn: Option<String>,
    ) -> Result<()> {
        ensure_namespace(&self.client, CONTROLLER_NAMESPACE).await?;
        let cm = resources::controller_config_map(config)?;
        apply_namespaced(&self.client, CONTROLLER_NAMESPACE, &cm).await?;

        if let Some(role) = node_role_arn {
            info!(role = %role, "Mapping worker node role into aws-auth");
            apply_namespaced(&self.client, "kube-system", &resources::aws_auth_config_map(&role))
                .await?;
        }
        Ok(())
    }

    async fn store_secret(&self, name: &str, key: &str, value: &str) -> Result<()> {
        ensure_namespace(&self.client, CONTROLLER_NAMESPACE).await?;
        apply_namespaced(
            &self.client,
            CONTROLLER_NAMESPACE,
            &resources::secret(name, key, value),
        )
        .await
    }

    async fn deploy_controller(&self, image: &str, replicas: u32) -> Result<()> {
        let deployment = resources::controller_deployment(image, replicas)?;
        let to_deploy_error = |e: Error| Error::controller_deploy(e.to_string());

        apply_namespaced(&self.client, CONTROLLER_NAMESPACE, &controller_service_account())
            .await
            .map_err(to_deploy_error)?;
        apply_namespaced(&self.client, CONTROLLER_NAMESPACE, &deployment)
            .await
            .map_err(to_deploy_error)
    }

    async fn run_observers(&self) -> Result<()> {
        observer::observe_controller(self.client.clone(), CONTROLLER_NAMESPACE).await
    }

    async fn wait_for_controller_ready(&self) -> Result<()> {
        wait_for_deployment(
            &self.client,
            CONTROLLER_DEPLOYMENT,
            CONTROLLER_NAMESPACE,
            self.ready_timeout,
        )
        .await
        .map_err(|e| Error::controller_deploy(e.to_string()))
    }

    async fn wait_for_installation_progress(&self) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), CONTROLLER_NAMESPACE);
        let start = Instant::now();
        let mut last_reported = InstallProgress::NotStarted;

        loop {
            match api.get_opt(PROGRESS_CONFIG_MAP).await {
                Ok(cm) => {
                    let progress =
                        resources::parse_install_progress(cm.as_ref().and_then(|c| c.data.as_ref()));
                    match &progress {
                        InstallProgress::Complete => {
                            info!("Controller reports installation complete");
                            return Ok(());
                        }
                        InstallProgress::Failed(message) => {
                            return Err(Error::controller_deploy(format!(
                                "installation failed: {}",
                                message
                            )));
                        }
                        InstallProgress::InProgress { phase, percent } if progress != last_reported => {
                            info!(phase = %phase, percent = ?percent, "Installation in progress");
                        }
                        InstallProgress::InProgress { .. } => {}
                        InstallProgress::NotStarted => debug!("No installation progress reported yet"),
                    }
                    last_reported = progress;
                }
                Err(e) => debug!(error = %e, "Failed to read installation progress"),
            }

            if start.elapsed() > self.ready_timeout {
                return Err(Error::controller_deploy(format!(
                    "installation did not complete within {:?}",
                    self.ready_timeout
                )));
            }
            tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        }
    }
}
