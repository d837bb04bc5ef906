//! Resolved inputs shared by every attempt

use std::path::Path;

use tracing::info;

use crate::config::{load_credentials, ClusterConfig, ProviderCredentials};
use crate::Result;

/// Configuration and credentials for one bring-up
///
/// Built once per process and shared read-only (behind an `Arc`) by all
/// attempts.
#[derive(Clone, Debug)]
pub struct WorkflowContext {
    /// Validated cluster definition
    pub config: ClusterConfig,
    /// Provider credentials
    pub credentials: ProviderCredentials,
}

impl WorkflowContext {
    /// Bundle an already loaded config and credentials
    pub fn new(config: ClusterConfig, credentials: ProviderCredentials) -> Self {
        Self {
            config,
            credentials,
        }
    }

    /// Load the cluster definition and credentials from disk
    pub async fn resolve(config_path: &Path, credentials_path: &Path) -> Result<Self> {
        let config = ClusterConfig::load(config_path).await?;
        let credentials = load_credentials(credentials_path).await?;
        info!(
            cluster = %config.name,
            provider = %config.provider,
            region = %config.region,
            tenants = config.tenants.len(),
            "Resolved cluster configuration"
        );
        Ok(Self::new(config, credentials))
    }
}
