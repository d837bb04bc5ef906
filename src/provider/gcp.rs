//! GKE provisioning through `gcloud`

use async_trait::async_trait;
use tracing::info;

use super::{read_kubeconfig, run_cli, run_cli_checked, InfraProvisioner, ProvisionedInfra};
use crate::config::{ClusterConfig, FirewallConfig, GcpServiceAccount, ProviderCredentials};
use crate::workflow::WorkflowContext;
use crate::{Error, Result};

const GCLOUD: &str = "gcloud";

/// Provisions a regional GKE cluster plus its ingress firewall rule
#[derive(Clone, Debug)]
pub struct GcpProvisioner {
    binary: String,
}

impl Default for GcpProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl GcpProvisioner {
    /// Provisioner using `gcloud` from `PATH`
    pub fn new() -> Self {
        Self {
            binary: GCLOUD.to_string(),
        }
    }

    fn service_account<'a>(&self, ctx: &'a WorkflowContext) -> Result<&'a GcpServiceAccount> {
        match &ctx.credentials {
            ProviderCredentials::Gcp(sa) => Ok(sa),
            ProviderCredentials::Aws(_) => Err(Error::provisioning(
                &ctx.config.name,
                "gcp",
                "GCP provisioning requires a service account key",
            )),
        }
    }
}

fn env_for(sa: &GcpServiceAccount) -> Vec<(&'static str, String)> {
    let mut envs = vec![("CLOUDSDK_CORE_PROJECT", sa.project_id.clone())];
    if let Some(ref key_file) = sa.key_file {
        envs.push((
            "CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE",
            key_file.display().to_string(),
        ));
    }
    envs
}

pub(crate) fn describe_cluster_args(config: &ClusterConfig, project: &str) -> Vec<String> {
    vec![
        "container".into(),
        "clusters".into(),
        "describe".into(),
        config.name.clone(),
        format!("--region={}", config.region),
        format!("--project={}", project),
        "--format=value(status)".into(),
    ]
}

pub(crate) fn create_cluster_args(config: &ClusterConfig, project: &str) -> Vec<String> {
    let mut args = vec![
        "container".into(),
        "clusters".into(),
        "create".into(),
        config.name.clone(),
        format!("--region={}", config.region),
        format!("--project={}", project),
        format!("--num-nodes={}", config.nodes.count),
        "--quiet".into(),
    ];
    if let Some(ref machine_type) = config.nodes.machine_type {
        args.push(format!("--machine-type={}", machine_type));
    }
    args
}

pub(crate) fn create_firewall_args(firewall: &FirewallConfig, project: &str) -> Vec<String> {
    let allow = firewall
        .ports
        .iter()
        .map(|p| format!("tcp:{}", p))
        .collect::<Vec<_>>()
        .join(",");
    vec![
        "compute".into(),
        "firewall-rules".into(),
        "create".into(),
        firewall.rule_name.clone(),
        format!("--project={}", project),
        format!("--allow={}", allow),
        format!("--source-ranges={}", firewall.source_ranges.join(",")),
        "--quiet".into(),
    ]
}

fn get_credentials_args(config: &ClusterConfig, project: &str) -> Vec<String> {
    vec![
        "container".into(),
        "clusters".into(),
        "get-credentials".into(),
        config.name.clone(),
        format!("--region={}", config.region),
        format!("--project={}", project),
    ]
}

#[async_trait]
impl InfraProvisioner for GcpProvisioner {
    async fn ensure_infra_exists(&self, ctx: &WorkflowContext) -> Result<ProvisionedInfra> {
        let config = &ctx.config;
        let sa = self.service_account(ctx)?;
        let project = sa.project_id.as_str();
        let envs = env_for(sa);

        let describe = run_cli(&self.binary, &describe_cluster_args(config, project), &envs)
            .await
            .map_err(|e| {
                Error::provisioning(&config.name, "gcp", format!("failed to run gcloud: {}", e))
            })?;

        if describe.status.success() {
            let status = String::from_utf8_lossy(&describe.stdout).trim().to_string();
            info!(cluster = %config.name, status = %status, "GKE cluster already exists");
        } else {
            info!(cluster = %config.name, region = %config.region, "Creating GKE cluster");
            run_cli_checked(ctx, &self.binary, &create_cluster_args(config, project), &envs)
                .await?;
        }

        let firewall = config.firewall_config();
        let describe_rule = vec![
            "compute".into(),
            "firewall-rules".into(),
            "describe".into(),
            firewall.rule_name.clone(),
            format!("--project={}", project),
        ];
        let rule_exists = run_cli(&self.binary, &describe_rule, &envs)
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !rule_exists {
            info!(rule = %firewall.rule_name, "Creating ingress firewall rule");
            run_cli_checked(ctx, &self.binary, &create_firewall_args(&firewall, project), &envs)
                .await?;
        }

        let dir = tempfile::tempdir().map_err(|e| {
            Error::provisioning(&config.name, "gcp", format!("failed to create temp dir: {}", e))
        })?;
        let kubeconfig_path = dir.path().join("config");
        let mut kube_envs = envs.clone();
        kube_envs.push(("KUBECONFIG", kubeconfig_path.display().to_string()));
        run_cli_checked(ctx, &self.binary, &get_credentials_args(config, project), &kube_envs)
            .await?;

        Ok(ProvisionedInfra::Gcp {
            kubeconfig: read_kubeconfig(&kubeconfig_path).await,
        })
    }
}
