//! Cluster configuration
//!
//! The cluster definition is a YAML file read once per process. Everything the
//! workflow needs (firewall rules, DNS records, tenant list) is derived from it
//! by pure functions, so the resolved config can be shared read-only across
//! attempts.

mod controller;
mod credentials;

pub use controller::{derive_controller_config, ControllerConfig};
pub use credentials::{
    load_credentials, parse_credentials, AwsCredentials, GcpServiceAccount, ProviderCredentials,
    CREDENTIALS_ENV_VAR,
};

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of the implicit tenant that always exists
pub const SYSTEM_TENANT: &str = "system";

/// Services every tenant exposes publicly
pub const TENANT_SERVICES: [&str; 2] = ["api", "ingest"];

/// Path served by each tenant service once it is ready
pub const READINESS_PATH: &str = "/ready";

fn default_retention_days() -> u32 {
    30
}

fn default_node_count() -> u32 {
    3
}

fn default_allowed_cidrs() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

/// Supported cloud providers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Google Cloud (GKE)
    Gcp,
    /// Amazon Web Services (EKS)
    Aws,
}

impl ProviderType {
    /// Whether public DNS records must be awaited before probing endpoints.
    ///
    /// EKS load balancers publish hostnames through external DNS, which
    /// lags behind the controller becoming ready.
    pub fn needs_dns_wait(self) -> bool {
        matches!(self, ProviderType::Aws)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::Gcp => write!(f, "gcp"),
            ProviderType::Aws => write!(f, "aws"),
        }
    }
}

impl FromStr for ProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gcp" => Ok(ProviderType::Gcp),
            "aws" => Ok(ProviderType::Aws),
            other => Err(Error::config_invalid_field(
                "provider",
                format!("unknown provider '{}', must be 'gcp' or 'aws'", other),
            )),
        }
    }
}

/// A tenant hosted on the cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TenantSpec {
    /// DNS-safe tenant name
    pub name: String,
    /// Bearer token the tenant's endpoints accept when auth is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

/// Endpoint authentication settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthSpec {
    /// Whether tenant endpoints require a bearer token
    #[serde(default)]
    pub enabled: bool,
    /// Token of the implicit system tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_token: Option<String>,
}

/// Node pool sizing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeSpec {
    /// Number of worker nodes
    #[serde(default = "default_node_count")]
    pub count: u32,
    /// Provider machine type; provider default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            count: default_node_count(),
            machine_type: None,
        }
    }
}

/// Ingress firewall settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FirewallSpec {
    /// Source ranges allowed to reach the public endpoints
    #[serde(default = "default_allowed_cidrs")]
    pub allowed_cidrs: Vec<String>,
}

impl Default for FirewallSpec {
    fn default() -> Self {
        Self {
            allowed_cidrs: default_allowed_cidrs(),
        }
    }
}

/// Resolved cluster definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name, also used as the cloud resource name
    pub name: String,
    /// Cloud provider
    pub provider: ProviderType,
    /// Cloud region
    pub region: String,
    /// Base DNS name under which tenant endpoints are published
    pub dns_name: String,
    /// Data retention in days, passed to the controller
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Hosted tenants (the system tenant is implicit)
    #[serde(default)]
    pub tenants: Vec<TenantSpec>,
    /// Controller container image reference
    pub image: String,
    /// Endpoint authentication
    #[serde(default)]
    pub auth: AuthSpec,
    /// Node pool sizing
    #[serde(default)]
    pub nodes: NodeSpec,
    /// Ingress firewall
    #[serde(default)]
    pub firewall: FirewallSpec,
    /// Stop after configuration objects are applied, before the controller is deployed
    #[serde(default)]
    pub hold_controller: bool,
    /// Skip the controller image pre-flight check
    #[serde(default)]
    pub skip_image_check: bool,
    /// Extra keys merged into the derived controller configuration
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub controller_overrides: serde_json::Map<String, serde_json::Value>,
}

/// Firewall rule derived from the cluster config
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallConfig {
    /// Name of the rule
    pub rule_name: String,
    /// Allowed source CIDRs
    pub source_ranges: Vec<String>,
    /// Allowed TCP ports
    pub ports: Vec<u16>,
}

/// Public DNS records derived from the cluster config
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsConfig {
    /// Zone the records live in
    pub zone: String,
    /// Fully qualified hostnames, one per tenant service
    pub hostnames: Vec<String>,
}

/// Tenant entry as handed to the controller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEntry {
    /// Tenant name
    pub name: String,
    /// Whether the tenant is the implicit system tenant
    pub system: bool,
    /// Public hostnames of the tenant's services
    pub hostnames: Vec<String>,
}

/// Tenant list as handed to the controller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantsConfig {
    /// All tenants including the system tenant
    pub tenants: Vec<TenantEntry>,
    /// Retention applied to every tenant
    pub retention_days: u32,
    /// Whether endpoints require bearer tokens
    pub auth_enabled: bool,
}

impl ClusterConfig {
    /// Parse and validate a cluster definition from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ClusterConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::config_invalid(format!("failed to parse cluster config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a cluster definition file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config_invalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        validate_dns_label("name", &self.name)?;

        if self.region.trim().is_empty() {
            return Err(Error::config_invalid_field("region", "region must not be empty"));
        }

        if self.dns_name.trim().is_empty() || self.dns_name.starts_with('.') {
            return Err(Error::config_invalid_field(
                "dnsName",
                format!("invalid DNS name '{}'", self.dns_name),
            ));
        }

        if !image_has_tag(&self.image) {
            return Err(Error::config_invalid_field(
                "image",
                format!("image '{}' must include a tag", self.image),
            ));
        }

        if self.nodes.count == 0 {
            return Err(Error::config_invalid_field(
                "nodes.count",
                "node count must be at least 1",
            ));
        }

        let mut seen = BTreeSet::new();
        for (i, tenant) in self.tenants.iter().enumerate() {
            let field = format!("tenants[{}].name", i);
            validate_dns_label(&field, &tenant.name)?;
            if tenant.name == SYSTEM_TENANT {
                return Err(Error::config_invalid_field(
                    field,
                    format!("'{}' is reserved for the implicit system tenant", SYSTEM_TENANT),
                ));
            }
            if !seen.insert(tenant.name.as_str()) {
                return Err(Error::config_invalid_field(
                    field,
                    format!("duplicate tenant '{}'", tenant.name),
                ));
            }
            if self.auth.enabled && tenant.api_token.is_none() {
                return Err(Error::config_invalid_field(
                    format!("tenants[{}].apiToken", i),
                    format!("tenant '{}' needs an apiToken when auth is enabled", tenant.name),
                ));
            }
        }

        if self.auth.enabled && self.auth.system_token.is_none() {
            return Err(Error::config_invalid_field(
                "auth.systemToken",
                "systemToken is required when auth is enabled",
            ));
        }

        Ok(())
    }

    /// Tenant names including the implicit system tenant (system first)
    pub fn all_tenants(&self) -> Vec<String> {
        std::iter::once(SYSTEM_TENANT.to_string())
            .chain(self.tenants.iter().map(|t| t.name.clone()))
            .collect()
    }

    /// Public hostname of one tenant service
    pub fn service_hostname(&self, tenant: &str, service: &str) -> String {
        format!("{}-{}.{}", tenant, service, self.dns_name)
    }

    /// Hostnames of every service of one tenant
    pub fn tenant_hostnames(&self, tenant: &str) -> Vec<String> {
        TENANT_SERVICES
            .iter()
            .map(|service| self.service_hostname(tenant, service))
            .collect()
    }

    /// Firewall rule opening the public endpoints
    pub fn firewall_config(&self) -> FirewallConfig {
        FirewallConfig {
            rule_name: format!("{}-ingress", self.name),
            source_ranges: self.firewall.allowed_cidrs.clone(),
            ports: vec![443],
        }
    }

    /// DNS records the cluster will publish
    pub fn dns_config(&self) -> DnsConfig {
        DnsConfig {
            zone: self.dns_name.clone(),
            hostnames: self
                .all_tenants()
                .iter()
                .flat_map(|tenant| self.tenant_hostnames(tenant))
                .collect(),
        }
    }

    /// Tenant list for the controller
    pub fn tenants_config(&self) -> TenantsConfig {
        TenantsConfig {
            tenants: self
                .all_tenants()
                .into_iter()
                .map(|name| TenantEntry {
                    system: name == SYSTEM_TENANT,
                    hostnames: self.tenant_hostnames(&name),
                    name,
                })
                .collect(),
            retention_days: self.retention_days,
            auth_enabled: self.auth.enabled,
        }
    }

    /// Bearer token configured for a tenant, if auth is enabled
    pub fn tenant_token(&self, tenant: &str) -> Option<String> {
        if !self.auth.enabled {
            return None;
        }
        if tenant == SYSTEM_TENANT {
            return self.auth.system_token.clone();
        }
        self.tenants
            .iter()
            .find(|t| t.name == tenant)
            .and_then(|t| t.api_token.clone())
    }
}

fn validate_dns_label(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(Error::config_invalid_field(
            field,
            format!("'{}' is not a valid DNS label", value),
        ))
    }
}

fn image_has_tag(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    matches!(last_segment.split_once(':'), Some((name, tag)) if !name.is_empty() && !tag.is_empty())
}
