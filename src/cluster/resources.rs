//! Kubernetes objects applied during bring-up
//!
//! Builders here are pure so they can be checked without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use kube::api::ObjectMeta;
use serde_json::json;

use super::{
    CONTROLLER_CONFIG_MAP, CONTROLLER_DEPLOYMENT, CONTROLLER_NAMESPACE, SYSTEM_SECRET_KEY,
    SYSTEM_SECRET_NAME, TENANTS_CONFIG_MAP,
};
use crate::config::{ControllerConfig, TenantsConfig};
use crate::{Error, Result};

const LABEL_APP: &str = "app.kubernetes.io/name";
const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), CONTROLLER_DEPLOYMENT.to_string()),
        (LABEL_MANAGED_BY.to_string(), crate::kube_utils::FIELD_MANAGER.to_string()),
    ])
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels()),
        ..Default::default()
    }
}

/// Label selector matching the controller's pods
pub(crate) fn controller_selector() -> String {
    format!("{}={}", LABEL_APP, CONTROLLER_DEPLOYMENT)
}

fn json_config_map(name: &str, key: &str, value: &impl serde::Serialize) -> Result<ConfigMap> {
    let rendered = serde_json::to_string_pretty(value).map_err(|e| {
        Error::resource_apply(format!("ConfigMap/{}", name), format!("serialize: {}", e))
    })?;
    Ok(ConfigMap {
        metadata: meta(name, CONTROLLER_NAMESPACE),
        data: Some(BTreeMap::from([(key.to_string(), rendered)])),
        ..Default::default()
    })
}

/// ConfigMap carrying the tenant list
pub fn tenants_config_map(tenants: &TenantsConfig) -> Result<ConfigMap> {
    json_config_map(TENANTS_CONFIG_MAP, "tenants.json", tenants)
}

/// ConfigMap carrying the controller configuration
pub fn controller_config_map(config: &ControllerConfig) -> Result<ConfigMap> {
    json_config_map(CONTROLLER_CONFIG_MAP, "config.json", config)
}

/// `aws-auth` mapping that lets the EKS worker nodes join the cluster
pub fn aws_auth_config_map(node_role_arn: &str) -> ConfigMap {
    let map_roles = format!(
        "- rolearn: {}\n  username: system:node:{{{{EC2PrivateDNSName}}}}\n  groups:\n    - system:bootstrappers\n    - system:nodes\n",
        node_role_arn
    );
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("aws-auth".to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("mapRoles".to_string(), map_roles)])),
        ..Default::default()
    }
}

/// Opaque single-key secret in the controller namespace
pub fn secret(name: &str, key: &str, value: &str) -> Secret {
    Secret {
        metadata: meta(name, CONTROLLER_NAMESPACE),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Default::default()
    }
}

/// ServiceAccount the controller runs as
pub(crate) fn controller_service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: meta(CONTROLLER_DEPLOYMENT, CONTROLLER_NAMESPACE),
        ..Default::default()
    }
}

/// Controller Deployment mounting both config maps and the system secret
pub fn controller_deployment(image: &str, replicas: u32) -> Result<Deployment> {
    let labels = labels();
    let replicas = i32::try_from(replicas)
        .map_err(|_| Error::controller_deploy(format!("replica count {} too large", replicas)))?;

    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": CONTROLLER_DEPLOYMENT,
            "namespace": CONTROLLER_NAMESPACE,
            "labels": labels,
        },
        "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": { LABEL_APP: CONTROLLER_DEPLOYMENT } },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "serviceAccountName": CONTROLLER_DEPLOYMENT,
                    "containers": [{
                        "name": "controller",
                        "image": image,
                        "args": ["--config=/etc/controller/config.json", "--tenants=/etc/tenants/tenants.json"],
                        "env": [{
                            "name": "SYSTEM_TENANT_TOKEN",
                            "valueFrom": { "secretKeyRef": { "name": SYSTEM_SECRET_NAME, "key": SYSTEM_SECRET_KEY } }
                        }],
                        "ports": [{ "name": "https", "containerPort": 8443 }],
                        "readinessProbe": {
                            "httpGet": { "path": "/healthz", "port": "https", "scheme": "HTTPS" },
                            "periodSeconds": 10
                        },
                        "volumeMounts": [
                            { "name": "controller-config", "mountPath": "/etc/controller", "readOnly": true },
                            { "name": "tenants-config", "mountPath": "/etc/tenants", "readOnly": true }
                        ]
                    }],
                    "volumes": [
                        { "name": "controller-config", "configMap": { "name": CONTROLLER_CONFIG_MAP } },
                        { "name": "tenants-config", "configMap": { "name": TENANTS_CONFIG_MAP } }
                    ]
                }
            }
        }
    });

    serde_json::from_value(manifest).map_err(|e| {
        Error::controller_deploy(format!("failed to build controller deployment: {}", e))
    })
}

/// Installation progress reported by the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallProgress {
    /// No report yet
    NotStarted,
    /// Installing; phase name and optional percentage
    InProgress {
        /// Current phase
        phase: String,
        /// Completion percentage, if reported
        percent: Option<u8>,
    },
    /// Installation finished
    Complete,
    /// Installation failed and will not recover on its own
    Failed(String),
}

/// Read progress from the `install-progress` ConfigMap data
pub fn parse_install_progress(data: Option<&BTreeMap<String, String>>) -> InstallProgress {
    let Some(data) = data else {
        return InstallProgress::NotStarted;
    };
    let phase = data.get("phase").map(|p| p.trim()).unwrap_or_default();

    match phase {
        "" => InstallProgress::NotStarted,
        "Complete" => InstallProgress::Complete,
        "Failed" => InstallProgress::Failed(
            data.get("message")
                .cloned()
                .unwrap_or_else(|| "no message".to_string()),
        ),
        other => InstallProgress::InProgress {
            phase: other.to_string(),
            percent: data
                .get("percent")
                .and_then(|p| p.trim().parse::<u8>().ok())
                .filter(|p| *p <= 100),
        },
    }
}
