//! EKS provisioning through `eksctl` and the `aws` CLI

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{read_kubeconfig, run_cli, run_cli_checked, InfraProvisioner, ProvisionedInfra};
use crate::config::{AwsCredentials, ClusterConfig, ProviderCredentials};
use crate::workflow::WorkflowContext;
use crate::{Error, Result};

const EKSCTL: &str = "eksctl";
const AWS: &str = "aws";

/// Provisions an EKS cluster with one managed node group
#[derive(Clone, Debug)]
pub struct AwsProvisioner {
    eksctl: String,
    aws: String,
}

impl Default for AwsProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsProvisioner {
    /// Provisioner using `eksctl` and `aws` from `PATH`
    pub fn new() -> Self {
        Self {
            eksctl: EKSCTL.to_string(),
            aws: AWS.to_string(),
        }
    }

    fn credentials<'a>(&self, ctx: &'a WorkflowContext) -> Result<&'a AwsCredentials> {
        match &ctx.credentials {
            ProviderCredentials::Aws(creds) => Ok(creds),
            ProviderCredentials::Gcp(_) => Err(Error::provisioning(
                &ctx.config.name,
                "aws",
                "AWS provisioning requires access keys",
            )),
        }
    }
}

pub(crate) fn nodegroup_name(config: &ClusterConfig) -> String {
    format!("{}-workers", config.name)
}

fn env_for(config: &ClusterConfig, creds: &AwsCredentials) -> Vec<(&'static str, String)> {
    let mut envs = creds.env_vars();
    envs.push(("AWS_REGION", config.region.clone()));
    envs
}

pub(crate) fn create_cluster_args(config: &ClusterConfig) -> Vec<String> {
    let mut args = vec![
        "create".into(),
        "cluster".into(),
        format!("--name={}", config.name),
        format!("--region={}", config.region),
        format!("--nodegroup-name={}", nodegroup_name(config)),
        format!("--nodes={}", config.nodes.count),
        "--managed".into(),
    ];
    if let Some(ref machine_type) = config.nodes.machine_type {
        args.push(format!("--node-type={}", machine_type));
    }
    args
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodegroupEnvelope {
    nodegroup: Nodegroup,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Nodegroup {
    node_role: Option<String>,
}

/// Extract the node role ARN from `aws eks describe-nodegroup` output
pub(crate) fn parse_node_role(json: &str) -> Option<String> {
    serde_json::from_str::<NodegroupEnvelope>(json)
        .ok()
        .and_then(|env| env.nodegroup.node_role)
}

#[async_trait]
impl InfraProvisioner for AwsProvisioner {
    async fn ensure_infra_exists(&self, ctx: &WorkflowContext) -> Result<ProvisionedInfra> {
        let config = &ctx.config;
        let envs = env_for(config, self.credentials(ctx)?);

        let get = vec![
            "get".into(),
            "cluster".into(),
            format!("--name={}", config.name),
            format!("--region={}", config.region),
            "--output=json".into(),
        ];
        let exists = run_cli(&self.eksctl, &get, &envs)
            .await
            .map_err(|e| {
                Error::provisioning(&config.name, "aws", format!("failed to run eksctl: {}", e))
            })?
            .status
            .success();

        if exists {
            info!(cluster = %config.name, "EKS cluster already exists");
        } else {
            info!(cluster = %config.name, region = %config.region, "Creating EKS cluster");
            run_cli_checked(ctx, &self.eksctl, &create_cluster_args(config), &envs).await?;
        }

        let describe_nodegroup = vec![
            "eks".into(),
            "describe-nodegroup".into(),
            format!("--cluster-name={}", config.name),
            format!("--nodegroup-name={}", nodegroup_name(config)),
            "--output=json".into(),
        ];
        let node_role_arn = match run_cli(&self.aws, &describe_nodegroup, &envs).await {
            Ok(output) if output.status.success() => {
                parse_node_role(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(
                    cluster = %config.name,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Could not resolve node role"
                );
                None
            }
            Err(e) => {
                warn!(cluster = %config.name, error = %e, "Could not resolve node role");
                None
            }
        };

        let dir = tempfile::tempdir().map_err(|e| {
            Error::provisioning(&config.name, "aws", format!("failed to create temp dir: {}", e))
        })?;
        let kubeconfig_path = dir.path().join("config");
        let update = vec![
            "eks".into(),
            "update-kubeconfig".into(),
            format!("--name={}", config.name),
            format!("--kubeconfig={}", kubeconfig_path.display()),
        ];
        run_cli_checked(ctx, &self.aws, &update, &envs).await?;

        Ok(ProvisionedInfra::Aws {
            kubeconfig: read_kubeconfig(&kubeconfig_path).await,
            node_role_arn,
        })
    }
}
