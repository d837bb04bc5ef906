//! Controller configuration derived from the cluster config
//!
//! The controller reads this document from a ConfigMap at startup and rejects
//! keys it does not know, so the same strictness is applied here before
//! anything is deployed.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ClusterConfig, ProviderCredentials, ProviderType};
use crate::{Error, Result};

fn default_log_level() -> String {
    "info".to_string()
}

fn default_replicas() -> u32 {
    1
}

/// Configuration document consumed by the cluster controller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerConfig {
    /// Cluster name
    pub cluster_name: String,
    /// Provider the cluster runs on
    pub provider: ProviderType,
    /// Cloud region
    pub region: String,
    /// Base DNS name for tenant endpoints
    pub dns_name: String,
    /// Retention in days
    pub retention_days: u32,
    /// Whether tenant endpoints require bearer tokens
    pub auth_enabled: bool,
    /// Tenant names including the system tenant
    pub tenants: Vec<String>,
    /// GCP project, only on GCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_project: Option<String>,
    /// Controller log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Controller replica count
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

/// Build and strictly validate the controller configuration
///
/// Overrides from the cluster config are merged last. Unknown keys, type
/// mismatches and a provider/credential mismatch all fail with
/// `ConfigInvalid`.
pub fn derive_controller_config(
    config: &ClusterConfig,
    credentials: &ProviderCredentials,
) -> Result<ControllerConfig> {
    if credentials.provider() != config.provider {
        return Err(Error::config_invalid_field(
            "provider",
            format!(
                "cluster provider is {} but credentials are for {}",
                config.provider,
                credentials.provider()
            ),
        ));
    }

    let gcp_project = match credentials {
        ProviderCredentials::Gcp(sa) => Some(sa.project_id.clone()),
        ProviderCredentials::Aws(_) => None,
    };

    let mut document = json!({
        "clusterName": config.name,
        "provider": config.provider,
        "region": config.region,
        "dnsName": config.dns_name,
        "retentionDays": config.retention_days,
        "authEnabled": config.auth.enabled,
        "tenants": config.all_tenants(),
    });
    if let (Some(project), Some(map)) = (gcp_project, document.as_object_mut()) {
        map.insert("gcpProject".to_string(), json!(project));
    }

    if let Some(map) = document.as_object_mut() {
        for (key, value) in &config.controller_overrides {
            map.insert(key.clone(), value.clone());
        }
    }

    let derived: ControllerConfig = serde_json::from_value(document).map_err(|e| {
        Error::config_invalid_field(
            "controllerOverrides",
            format!("controller configuration rejected: {}", e),
        )
    })?;

    if derived.replicas == 0 {
        return Err(Error::config_invalid_field(
            "controllerOverrides.replicas",
            "controller needs at least one replica",
        ));
    }

    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::credentials::parse_credentials;
    use crate::config::tests::sample_config;
    use crate::ErrorKind;

    fn gcp_creds() -> ProviderCredentials {
        parse_credentials(
            r#"{"type": "service_account", "project_id": "p1", "client_email": "a@b", "private_key": "k"}"#,
        )
        .unwrap()
    }

    fn aws_creds() -> ProviderCredentials {
        parse_credentials(r#"{"aws_access_key_id": "A", "aws_secret_access_key": "S"}"#).unwrap()
    }

    #[test]
    fn derives_from_cluster_config() {
        let derived = derive_controller_config(&sample_config(), &gcp_creds()).unwrap();
        assert_eq!(derived.cluster_name, "prod-eu");
        assert_eq!(derived.tenants, vec!["system", "acme", "globex"]);
        assert_eq!(derived.gcp_project.as_deref(), Some("p1"));
        assert_eq!(derived.log_level, "info");
        assert_eq!(derived.replicas, 1);
    }

    #[test]
    fn provider_mismatch_is_rejected() {
        let err = derive_controller_config(&sample_config(), &aws_creds()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(err.to_string().contains("credentials are for aws"));
    }

    #[test]
    fn known_overrides_are_applied() {
        let mut config = sample_config();
        config
            .controller_overrides
            .insert("logLevel".into(), json!("debug"));
        config.controller_overrides.insert("replicas".into(), json!(2));

        let derived = derive_controller_config(&config, &gcp_creds()).unwrap();
        assert_eq!(derived.log_level, "debug");
        assert_eq!(derived.replicas, 2);
    }

    #[test]
    fn unknown_override_keys_are_rejected() {
        let mut config = sample_config();
        config
            .controller_overrides
            .insert("retentionDayz".into(), json!(7));

        let err = derive_controller_config(&config, &gcp_creds()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(err.to_string().contains("retentionDayz"));
    }

    #[test]
    fn mistyped_overrides_are_rejected() {
        let mut config = sample_config();
        config
            .controller_overrides
            .insert("replicas".into(), json!("two"));
        assert!(derive_controller_config(&config, &gcp_creds()).is_err());

        config.controller_overrides.insert("replicas".into(), json!(0));
        assert!(derive_controller_config(&config, &gcp_creds()).is_err());
    }
}
