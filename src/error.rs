//! Error types for cluster bring-up
//!
//! Every failure that crosses a stage boundary carries an [`ErrorKind`] tag.
//! The retry supervisor and the workflow match on the tag by value to decide
//! how loudly to log and whether another attempt is allowed.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Context of internal errors raised for task panics, aborts and join faults
pub const TASK_FAULT_CONTEXT: &str = "task";

/// Classification of a failure, independent of the concrete variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resolved or derived configuration failed validation
    ConfigInvalid,
    /// Cloud infrastructure could not be created or reconciled
    InfraProvisioningFailed,
    /// Provisioning finished without yielding a kubeconfig
    KubeConfigMissing,
    /// The controller workload was rejected or never became ready
    ControllerDeployFailed,
    /// A configuration object or secret was rejected by the API server
    ResourceApplyFailed,
    /// The attempt deadline elapsed before the workflow finished
    AttemptTimedOut,
    /// A readiness endpoint could not be reached (never escalated)
    ProbeUnreachable,
    /// The controller image is confirmed absent from its registry
    ImageMissing,
    /// A task panicked or the runtime reported a fault
    Internal,
}

impl ErrorKind {
    /// Whether this kind ends the process instead of just the attempt
    pub fn is_process_fatal(self) -> bool {
        matches!(self, ErrorKind::ImageMissing)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::InfraProvisioningFailed => "InfraProvisioningFailed",
            ErrorKind::KubeConfigMissing => "KubeConfigMissing",
            ErrorKind::ControllerDeployFailed => "ControllerDeployFailed",
            ErrorKind::ResourceApplyFailed => "ResourceApplyFailed",
            ErrorKind::AttemptTimedOut => "AttemptTimedOut",
            ErrorKind::ProbeUnreachable => "ProbeUnreachable",
            ErrorKind::ImageMissing => "ImageMissing",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Main error type for bring-up operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be resolved or failed strict validation
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// Description of what's invalid
        message: String,
        /// The offending field path, if known (e.g., "tenants[0].name")
        field: Option<String>,
    },

    /// Infrastructure provider error
    #[error("provisioning failed [{provider}] for {cluster}: {message}")]
    InfraProvisioning {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Provider (gcp, aws)
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// Provisioning completed but produced no kubeconfig
    #[error("no kubeconfig available for cluster {cluster}")]
    KubeConfigMissing {
        /// Name of the cluster
        cluster: String,
    },

    /// Controller deployment or its readiness wait failed
    #[error("controller deployment failed: {message}")]
    ControllerDeploy {
        /// Description of what failed
        message: String,
    },

    /// A Kubernetes object was rejected
    #[error("failed to apply {resource}: {message}")]
    ResourceApply {
        /// Kind/name of the rejected object (e.g., "ConfigMap/tenants")
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// The deadline of a raced task elapsed
    #[error("{task} timed out after {deadline:?}")]
    AttemptTimedOut {
        /// Name of the task that was cancelled
        task: String,
        /// The deadline that elapsed
        deadline: Duration,
    },

    /// A readiness probe endpoint is not reachable yet
    #[error("probe {url} unreachable: {message}")]
    ProbeUnreachable {
        /// Probed URL
        url: String,
        /// Transport-level error description
        message: String,
    },

    /// The controller image does not exist
    #[error("controller image {image} not found in registry")]
    ImageMissing {
        /// Full image reference
        image: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "task", "runtime")
        context: String,
    },
}

impl Error {
    /// The kind tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Error::InfraProvisioning { .. } => ErrorKind::InfraProvisioningFailed,
            Error::KubeConfigMissing { .. } => ErrorKind::KubeConfigMissing,
            Error::ControllerDeploy { .. } => ErrorKind::ControllerDeployFailed,
            Error::ResourceApply { .. } => ErrorKind::ResourceApplyFailed,
            Error::AttemptTimedOut { .. } => ErrorKind::AttemptTimedOut,
            Error::ProbeUnreachable { .. } => ErrorKind::ProbeUnreachable,
            Error::ImageMissing { .. } => ErrorKind::ImageMissing,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether this error reports a panicked, aborted or unjoinable task
    pub fn is_task_fault(&self) -> bool {
        matches!(self, Error::Internal { context, .. } if context == TASK_FAULT_CONTEXT)
    }

    /// Create a configuration error
    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn config_invalid_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provisioning error with cluster and provider context
    pub fn provisioning(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InfraProvisioning {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a controller deployment error
    pub fn controller_deploy(msg: impl Into<String>) -> Self {
        Self::ControllerDeploy {
            message: msg.into(),
        }
    }

    /// Create a resource apply error
    pub fn resource_apply(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ResourceApply {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}

/// Render an error with its full `source()` chain for diagnostic logs
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": caused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
