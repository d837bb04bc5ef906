//! Infrastructure provisioning
//!
//! Each provider brings up a managed Kubernetes cluster by driving the
//! vendor CLI (`gcloud`, `eksctl`/`aws`) and hands back the kubeconfig.
//! Every step is describe-then-create, so a retried attempt picks up
//! whatever an earlier attempt left behind.

mod aws;
mod gcp;

pub use aws::AwsProvisioner;
pub use gcp::GcpProvisioner;

use std::path::Path;
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::ProviderType;
use crate::workflow::WorkflowContext;
use crate::{Error, Result};

/// Result of base infrastructure provisioning
#[derive(Clone, Debug, PartialEq)]
pub enum ProvisionedInfra {
    /// GKE cluster
    Gcp {
        /// Kubeconfig YAML, if the provider produced one
        kubeconfig: Option<String>,
    },
    /// EKS cluster
    Aws {
        /// Kubeconfig YAML, if the provider produced one
        kubeconfig: Option<String>,
        /// IAM role of the worker nodes, mapped into `aws-auth`
        node_role_arn: Option<String>,
    },
}

impl ProvisionedInfra {
    /// Provider that produced this result
    pub fn provider(&self) -> ProviderType {
        match self {
            ProvisionedInfra::Gcp { .. } => ProviderType::Gcp,
            ProvisionedInfra::Aws { .. } => ProviderType::Aws,
        }
    }

    /// Kubeconfig YAML, if any
    pub fn kubeconfig(&self) -> Option<&str> {
        match self {
            ProvisionedInfra::Gcp { kubeconfig } | ProvisionedInfra::Aws { kubeconfig, .. } => {
                kubeconfig.as_deref().filter(|k| !k.trim().is_empty())
            }
        }
    }

    /// Worker node role (AWS only)
    pub fn node_role_arn(&self) -> Option<&str> {
        match self {
            ProvisionedInfra::Aws { node_role_arn, .. } => node_role_arn.as_deref(),
            ProvisionedInfra::Gcp { .. } => None,
        }
    }
}

/// Brings base cloud infrastructure into existence
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraProvisioner: Send + Sync {
    /// Create or reconcile the cluster and return how to reach it
    ///
    /// Fails with `InfraProvisioningFailed`.
    async fn ensure_infra_exists(&self, ctx: &WorkflowContext) -> Result<ProvisionedInfra>;
}

/// CLI-backed provisioner for a provider
pub fn default_provisioner(provider: ProviderType) -> Arc<dyn InfraProvisioner> {
    match provider {
        ProviderType::Gcp => Arc::new(GcpProvisioner::new()),
        ProviderType::Aws => Arc::new(AwsProvisioner::new()),
    }
}

/// Run a provider CLI to completion
///
/// The child is killed if the calling task is cancelled. A non-zero exit is
/// returned as `Ok` so callers can treat "not found" as a signal.
pub(crate) async fn run_cli(
    program: &str,
    args: &[String],
    envs: &[(&'static str, String)],
) -> std::io::Result<Output> {
    debug!(program = %program, args = ?args, "Running provider CLI");
    let output = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
        .kill_on_drop(true)
        .output()
        .await?;
    trace!(program = %program, status = ?output.status, "Provider CLI exited");
    Ok(output)
}

/// Run a CLI and require success, mapping failures to provisioning errors
pub(crate) async fn run_cli_checked(
    ctx: &WorkflowContext,
    program: &str,
    args: &[String],
    envs: &[(&'static str, String)],
) -> Result<Output> {
    let provider = ctx.config.provider.to_string();
    let output = run_cli(program, args, envs).await.map_err(|e| {
        Error::provisioning(&ctx.config.name, &provider, format!("failed to run {}: {}", program, e))
    })?;

    if !output.status.success() {
        return Err(Error::provisioning(
            &ctx.config.name,
            &provider,
            format!(
                "{} {} failed: {}",
                program,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(output)
}

/// Read a kubeconfig written by a CLI, `None` if absent or empty
pub(crate) async fn read_kubeconfig(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if !content.trim().is_empty() => Some(content),
        Ok(_) => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No kubeconfig written");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_kubeconfig_counts_as_missing() {
        let infra = ProvisionedInfra::Gcp {
            kubeconfig: Some("  \n".into()),
        };
        assert_eq!(infra.kubeconfig(), None);

        let infra = ProvisionedInfra::Aws {
            kubeconfig: Some("apiVersion: v1".into()),
            node_role_arn: Some("arn:aws:iam::1:role/nodes".into()),
        };
        assert_eq!(infra.kubeconfig(), Some("apiVersion: v1"));
        assert_eq!(infra.node_role_arn(), Some("arn:aws:iam::1:role/nodes"));
        assert_eq!(infra.provider(), ProviderType::Aws);
    }

    #[tokio::test]
    async fn run_cli_reports_exit_status() {
        let output = run_cli("sh", &["-c".into(), "exit 3".into()], &[])
            .await
            .unwrap();
        assert_eq!(output.status.code(), Some(3));
    }

    #[tokio::test]
    async fn read_kubeconfig_handles_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_kubeconfig(&dir.path().join("config")).await, None);

        let path = dir.path().join("written");
        tokio::fs::write(&path, "apiVersion: v1\n").await.unwrap();
        assert_eq!(
            read_kubeconfig(&path).await.as_deref(),
            Some("apiVersion: v1\n")
        );
    }
}
