//! Cluster creation workflow
//!
//! One attempt walks the stages below in order. Each attempt runs under its
//! own deadline, and the whole thing is retried a bounded number of times.
//!
//! ```text
//!  1 derive config        5 apply config + secret     9 wait controller + install
//!  2 image pre-check      6 hold? -> done             10 stop observer
//!  3 provision infra      7 deploy controller         11 DNS (AWS only)
//!  4 reachability (warn)  8 start observer            12 endpoint readiness
//! ```
//!
//! The observer is the only work that runs alongside the main sequence. It
//! is cancelled, and its termination confirmed, before stage 11 starts.

mod context;

pub use context::WorkflowContext;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cluster::{
    ClusterOps, KubeClientConnector, KubeConnector, AUTH_PLACEHOLDER, SYSTEM_SECRET_KEY,
    SYSTEM_SECRET_NAME,
};
use crate::config::{derive_controller_config, ControllerConfig};
use crate::dns::{DnsWaiter, ResolverDnsWaiter};
use crate::image::{ImageChecker, ImageStatus, RegistryImageChecker};
use crate::probe::{self, HttpProbeTransport, ProbeTransport, PROBE_INTERVAL};
use crate::provider::{default_provisioner, InfraProvisioner, ProvisionedInfra};
use crate::retry::{run_with_retries, RetryPolicy};
use crate::task::{spawn_task, TaskContext, TaskOutcome};
use crate::timeout::race_with_deadline;
use crate::{Error, Result};

/// Default deadline for a single attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Stages of one attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Build and validate the controller configuration
    DeriveConfig,
    /// Check the controller image exists
    ImageCheck,
    /// Create or reconcile cloud infrastructure
    ProvisionInfra,
    /// Check the API server answers
    VerifyReachability,
    /// Apply configuration objects and the system secret
    ApplyConfiguration,
    /// Stop early when the controller is held back
    HoldController,
    /// Deploy the controller workload
    DeployController,
    /// Start watching the controller workloads
    StartObserver,
    /// Wait for the controller to be ready and installed
    WaitForController,
    /// Stop watching the controller workloads
    StopObserver,
    /// Wait for public DNS records
    WaitForDns,
    /// Wait for every tenant endpoint to serve
    WaitForEndpoints,
}

impl Stage {
    /// Every stage, in execution order
    pub const ALL: [Stage; 12] = [
        Stage::DeriveConfig,
        Stage::ImageCheck,
        Stage::ProvisionInfra,
        Stage::VerifyReachability,
        Stage::ApplyConfiguration,
        Stage::HoldController,
        Stage::DeployController,
        Stage::StartObserver,
        Stage::WaitForController,
        Stage::StopObserver,
        Stage::WaitForDns,
        Stage::WaitForEndpoints,
    ];

    /// Position in the attempt, starting at 1
    pub fn number(self) -> u8 {
        match self {
            Stage::DeriveConfig => 1,
            Stage::ImageCheck => 2,
            Stage::ProvisionInfra => 3,
            Stage::VerifyReachability => 4,
            Stage::ApplyConfiguration => 5,
            Stage::HoldController => 6,
            Stage::DeployController => 7,
            Stage::StartObserver => 8,
            Stage::WaitForController => 9,
            Stage::StopObserver => 10,
            Stage::WaitForDns => 11,
            Stage::WaitForEndpoints => 12,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Stage::DeriveConfig => "Deriving controller configuration",
            Stage::ImageCheck => "Checking controller image",
            Stage::ProvisionInfra => "Provisioning infrastructure",
            Stage::VerifyReachability => "Verifying Kubernetes reachability",
            Stage::ApplyConfiguration => "Applying tenant and controller configuration",
            Stage::HoldController => "Controller held, stopping before deployment",
            Stage::DeployController => "Deploying controller",
            Stage::StartObserver => "Observing controller workloads",
            Stage::WaitForController => "Waiting for controller readiness and installation",
            Stage::StopObserver => "Stopping controller observer",
            Stage::WaitForDns => "Waiting for DNS records",
            Stage::WaitForEndpoints => "Waiting for tenant endpoints",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Stage {}] {}", self.number(), self.description())
    }
}

/// How a successful attempt ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Stopped after configuration because the controller is held
    Held,
    /// Every endpoint serves traffic
    Ready,
}

/// Collaborators the workflow drives
#[derive(Clone)]
pub struct WorkflowDeps {
    /// Cloud infrastructure
    pub provisioner: Arc<dyn InfraProvisioner>,
    /// Kubernetes session factory
    pub connector: Arc<dyn KubeConnector>,
    /// DNS propagation
    pub dns: Arc<dyn DnsWaiter>,
    /// Image pre-check
    pub images: Arc<dyn ImageChecker>,
    /// Readiness probes
    pub transport: Arc<dyn ProbeTransport>,
}

impl WorkflowDeps {
    /// Production collaborators for the context's provider
    pub fn for_context(ctx: &WorkflowContext) -> Result<Self> {
        Ok(Self {
            provisioner: default_provisioner(ctx.config.provider),
            connector: Arc::new(KubeClientConnector::default()),
            dns: Arc::new(ResolverDnsWaiter::default()),
            images: Arc::new(RegistryImageChecker::new()?),
            transport: Arc::new(HttpProbeTransport::new()?),
        })
    }
}

/// Supervision knobs
#[derive(Clone, Debug)]
pub struct WorkflowSettings {
    /// Attempt budget and delay
    pub retry: RetryPolicy,
    /// Deadline per attempt
    pub attempt_timeout: Duration,
    /// Pause between readiness probes
    pub probe_interval: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            probe_interval: PROBE_INTERVAL,
        }
    }
}

/// Bring a cluster from nothing to serving traffic
///
/// The supervised workflow runs in a spawned top-level task. If that task
/// faults (a panic or an abort that reaches this point), `on_fatal` is
/// called with the fault before it is returned.
pub async fn create_cluster<F>(
    ctx: Arc<WorkflowContext>,
    deps: Arc<WorkflowDeps>,
    settings: WorkflowSettings,
    on_fatal: F,
) -> Result<AttemptOutcome>
where
    F: FnOnce(&Error),
{
    let cluster = ctx.config.name.clone();
    info!(cluster = %cluster, provider = %ctx.config.provider, "Creating cluster");

    let handle = spawn_task("create-cluster", move |task| supervise(task, ctx, deps, settings));

    let result = match handle.join().await {
        TaskOutcome::Completed(outcome) => Ok(outcome),
        TaskOutcome::Failed(err) => Err(err),
        TaskOutcome::Cancelled => Err(Error::internal_with_context(
            crate::error::TASK_FAULT_CONTEXT,
            "cluster creation task was aborted",
        )),
    };

    match result {
        Ok(outcome) => {
            info!(cluster = %cluster, outcome = ?outcome, "Cluster creation finished");
            Ok(outcome)
        }
        Err(err) => {
            if err.is_task_fault() {
                error!(cluster = %cluster, error = %err, "Cluster creation faulted");
                on_fatal(&err);
            }
            Err(err)
        }
    }
}

/// Attempts are spawned under `task`, so cancelling the supervisor waits for
/// the running attempt to stop.
fn supervise(
    task: TaskContext,
    ctx: Arc<WorkflowContext>,
    deps: Arc<WorkflowDeps>,
    settings: WorkflowSettings,
) -> impl Future<Output = Result<AttemptOutcome>> + Send + 'static {
    async move {
        let WorkflowSettings {
            retry,
            attempt_timeout,
            probe_interval,
        } = settings;

        run_with_retries(&retry, "create-cluster", |attempt| {
            let ctx = ctx.clone();
            let deps = deps.clone();
            let task = task.clone();
            async move {
                let name = format!("attempt-{}", attempt);
                race_with_deadline(&task, &name, attempt_timeout, move |scope| {
                    run_attempt(scope, ctx, deps, probe_interval)
                })
                .await
            }
        })
        .await
    }
}

/// Run all stages once
///
/// `task` is the attempt's own scope; the observer and probe loops are
/// spawned under it so a timed-out attempt takes them down too.
pub async fn run_attempt(
    task: TaskContext,
    ctx: Arc<WorkflowContext>,
    deps: Arc<WorkflowDeps>,
    probe_interval: Duration,
) -> Result<AttemptOutcome> {
    let config = &ctx.config;

    info!("{}", Stage::DeriveConfig);
    let controller_config = derive_controller_config(config, &ctx.credentials)?;

    if config.skip_image_check {
        info!("{} (skipped)", Stage::ImageCheck);
    } else {
        info!("{}", Stage::ImageCheck);
        check_image(deps.images.as_ref(), &config.image).await?;
    }

    info!("{}", Stage::ProvisionInfra);
    let infra = deps.provisioner.ensure_infra_exists(&ctx).await?;
    let kubeconfig = infra.kubeconfig().ok_or_else(|| Error::KubeConfigMissing {
        cluster: config.name.clone(),
    })?;
    let ops = deps.connector.connect(kubeconfig).await?;

    info!("{}", Stage::VerifyReachability);
    match ops.list_namespaces().await {
        Ok(namespaces) => info!(namespaces = namespaces.len(), "Kubernetes API reachable"),
        Err(e) => warn!(error = %e, "Kubernetes API not reachable yet, continuing"),
    }

    info!("{}", Stage::ApplyConfiguration);
    apply_configuration(ops.as_ref(), &ctx, &controller_config, &infra).await?;

    if config.hold_controller {
        info!("{}", Stage::HoldController);
        return Ok(AttemptOutcome::Held);
    }

    info!("{}", Stage::DeployController);
    ops.deploy_controller(&config.image, controller_config.replicas).await?;

    info!("{}", Stage::StartObserver);
    let observed = ops.clone();
    let observer = task.spawn("controller-observer", move |_| async move {
        observed.run_observers().await
    });

    info!("{}", Stage::WaitForController);
    ops.wait_for_controller_ready().await?;
    ops.wait_for_installation_progress().await?;

    info!("{}", Stage::StopObserver);
    match observer.cancel().await {
        TaskOutcome::Failed(e) => warn!(error = %e, "Controller observer had failed"),
        TaskOutcome::Completed(()) | TaskOutcome::Cancelled => {}
    }

    if config.provider.needs_dns_wait() {
        info!("{}", Stage::WaitForDns);
        let dns = config.dns_config();
        deps.dns
            .wait_for_dns_propagation(&config.name, &dns.hostnames)
            .await?;
    } else {
        info!("{} (not needed on {})", Stage::WaitForDns, config.provider);
    }

    info!("{}", Stage::WaitForEndpoints);
    let targets = probe::probe_targets(config, config);
    probe::wait_until_ready(&task, targets, deps.transport.clone(), probe_interval).await?;

    info!(cluster = %config.name, "Cluster is serving traffic");
    Ok(AttemptOutcome::Ready)
}

async fn check_image(images: &dyn ImageChecker, image: &str) -> Result<()> {
    match images.check_image(image).await {
        ImageStatus::Present => {
            info!(image = %image, "Controller image found");
            Ok(())
        }
        ImageStatus::Missing => Err(Error::ImageMissing {
            image: image.to_string(),
        }),
        ImageStatus::Inconclusive(reason) => {
            warn!(image = %image, reason = %reason, "Could not verify controller image, continuing");
            Ok(())
        }
    }
}

async fn apply_configuration(
    ops: &dyn ClusterOps,
    ctx: &WorkflowContext,
    controller_config: &ControllerConfig,
    infra: &ProvisionedInfra,
) -> Result<()> {
    let config = &ctx.config;

    ops.apply_tenants_config(&config.tenants_config()).await?;
    ops.apply_controller_config(controller_config, infra.node_role_arn().map(String::from))
        .await?;

    let system_token = match config.auth.system_token {
        Some(ref token) if config.auth.enabled => token.as_str(),
        _ => AUTH_PLACEHOLDER,
    };
    ops.store_secret(SYSTEM_SECRET_NAME, SYSTEM_SECRET_KEY, system_token)
        .await
}

#[cfg(test)]
mod tests;
