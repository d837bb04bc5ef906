use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use super::*;
use crate::cluster::{MockClusterOps, MockKubeConnector};
use crate::config::tests::sample_config;
use crate::config::{parse_credentials, ProviderType, TenantsConfig};
use crate::image::MockImageChecker;
use crate::probe::ProbeResponse;
use crate::provider::MockInfraProvisioner;
use crate::ErrorKind;

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{} missing from {:?}", entry, log))
}

/// Pushes an entry when dropped, i.e. when the owning future is torn down
struct LogOnDrop(Log, &'static str);

impl Drop for LogOnDrop {
    fn drop(&mut self) {
        self.0.lock().unwrap().push(self.1.to_string());
    }
}

/// Cluster that records every call in order
struct RecordingOps {
    log: Log,
    reachable: bool,
    controller_ready: bool,
}

impl RecordingOps {
    fn push(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

#[async_trait]
impl ClusterOps for RecordingOps {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.push("list_namespaces");
        if self.reachable {
            Ok(vec!["default".into(), "kube-system".into()])
        } else {
            Err(Error::internal("connection refused"))
        }
    }

    async fn apply_tenants_config(&self, tenants: &TenantsConfig) -> Result<()> {
        self.push(format!("apply_tenants:{}", tenants.tenants.len()));
        Ok(())
    }

    async fn apply_controller_config(
        &self,
        config: &ControllerConfig,
        node_role_arn: Option<String>,
    ) -> Result<()> {
        self.push(format!(
            "apply_controller:{}:{}",
            config.cluster_name,
            node_role_arn.as_deref().unwrap_or("none")
        ));
        Ok(())
    }

    async fn store_secret(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.push(format!("store_secret:{}/{}={}", name, key, value));
        Ok(())
    }

    async fn deploy_controller(&self, image: &str, replicas: u32) -> Result<()> {
        self.push(format!("deploy:{}:{}", image, replicas));
        Ok(())
    }

    async fn run_observers(&self) -> Result<()> {
        self.push("observer:start");
        let _stop = LogOnDrop(self.log.clone(), "observer:stop");
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn wait_for_controller_ready(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.push("wait_ready");
        if self.controller_ready {
            Ok(())
        } else {
            Err(Error::controller_deploy("deployment never became available"))
        }
    }

    async fn wait_for_installation_progress(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.push("wait_progress");
        Ok(())
    }
}

struct FakeConnector {
    ops: Arc<RecordingOps>,
}

#[async_trait]
impl KubeConnector for FakeConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterOps>> {
        self.ops.push(format!("connect:{}", kubeconfig));
        Ok(self.ops.clone())
    }
}

struct FakeDns {
    log: Log,
}

#[async_trait]
impl DnsWaiter for FakeDns {
    async fn wait_for_dns_propagation(&self, cluster: &str, hostnames: &[String]) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        self.log
            .lock()
            .unwrap()
            .push(format!("dns:{}:{}", cluster, hostnames.len()));
        Ok(())
    }
}

/// Every endpoint is ready on first probe
struct FakeTransport {
    log: Log,
}

#[async_trait]
impl ProbeTransport for FakeTransport {
    async fn get(&self, url: &str, bearer: Option<String>) -> Result<ProbeResponse> {
        self.log.lock().unwrap().push(format!(
            "probe:{}:{}",
            url,
            bearer.as_deref().unwrap_or("-")
        ));
        Ok(ProbeResponse {
            status: 200,
            body: r#"{"status":"success"}"#.into(),
        })
    }
}

struct Harness {
    log: Log,
    ops: RecordingOps,
    provisioner: MockInfraProvisioner,
    images: MockImageChecker,
}

impl Harness {
    fn new() -> Self {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut images = MockImageChecker::new();
        images
            .expect_check_image()
            .returning(|_| ImageStatus::Present);
        Self {
            ops: RecordingOps {
                log: log.clone(),
                reachable: true,
                controller_ready: true,
            },
            log,
            provisioner: MockInfraProvisioner::new(),
            images,
        }
    }

    fn provisions(mut self, infra: ProvisionedInfra) -> Self {
        self.provisioner
            .expect_ensure_infra_exists()
            .times(1)
            .returning(move |_| Ok(infra.clone()));
        self
    }

    fn deps(self) -> (Log, Arc<WorkflowDeps>) {
        let log = self.log.clone();
        let deps = WorkflowDeps {
            provisioner: Arc::new(self.provisioner),
            connector: Arc::new(FakeConnector {
                ops: Arc::new(self.ops),
            }),
            dns: Arc::new(FakeDns { log: log.clone() }),
            images: Arc::new(self.images),
            transport: Arc::new(FakeTransport { log: log.clone() }),
        };
        (log, Arc::new(deps))
    }
}

fn gcp_context() -> WorkflowContext {
    let creds = parse_credentials(
        r#"{"type": "service_account", "project_id": "p1", "client_email": "a@b", "private_key": "k"}"#,
    )
    .unwrap();
    WorkflowContext::new(sample_config(), creds)
}

fn aws_context() -> WorkflowContext {
    let mut config = sample_config();
    config.provider = ProviderType::Aws;
    let creds =
        parse_credentials(r#"{"aws_access_key_id": "A", "aws_secret_access_key": "S"}"#).unwrap();
    WorkflowContext::new(config, creds)
}

fn gcp_infra() -> ProvisionedInfra {
    ProvisionedInfra::Gcp {
        kubeconfig: Some("gke-kubeconfig".into()),
    }
}

async fn attempt(ctx: WorkflowContext, deps: Arc<WorkflowDeps>) -> Result<AttemptOutcome> {
    let ctx = Arc::new(ctx);
    spawn_task("attempt", move |task| {
        run_attempt(task, ctx, deps, Duration::from_secs(5))
    })
    .join()
    .await
    .into_result("attempt")
}

#[tokio::test(start_paused = true)]
async fn gcp_attempt_runs_stages_in_order() {
    let (log, deps) = Harness::new().provisions(gcp_infra()).deps();

    let outcome = attempt(gcp_context(), deps).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Ready);

    let log = entries(&log);
    assert_eq!(
        &log[..6],
        &[
            "connect:gke-kubeconfig",
            "list_namespaces",
            "apply_tenants:3",
            "apply_controller:prod-eu:none",
            "store_secret:system-tenant-auth/token=auth-disabled",
            "deploy:registry.example.com/platform/controller:1.4.2:1",
        ]
    );

    let stop = position(&log, "observer:stop");
    assert!(position(&log, "observer:start") < stop);
    assert!(position(&log, "wait_ready") < position(&log, "wait_progress"));
    assert!(position(&log, "wait_progress") < stop);

    let probes: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, e)| e.starts_with("probe:"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(probes.len(), 6);
    assert!(probes.iter().all(|i| *i > stop));
    assert!(!log.iter().any(|e| e.starts_with("dns:")));
}

#[tokio::test(start_paused = true)]
async fn aws_attempt_waits_for_dns_after_observer_stops() {
    let infra = ProvisionedInfra::Aws {
        kubeconfig: Some("eks-kubeconfig".into()),
        node_role_arn: Some("arn:aws:iam::1:role/nodes".into()),
    };
    let (log, deps) = Harness::new().provisions(infra).deps();

    let outcome = attempt(aws_context(), deps).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Ready);

    let log = entries(&log);
    assert!(log.contains(&"apply_controller:prod-eu:arn:aws:iam::1:role/nodes".to_string()));

    let stop = position(&log, "observer:stop");
    let dns = position(&log, "dns:prod-eu:6");
    let first_probe = log.iter().position(|e| e.starts_with("probe:")).unwrap();
    assert!(stop < dns);
    assert!(dns < first_probe);
}

#[tokio::test(start_paused = true)]
async fn held_controller_stops_after_configuration() {
    let (log, deps) = Harness::new().provisions(gcp_infra()).deps();
    let mut ctx = gcp_context();
    ctx.config.hold_controller = true;

    let outcome = attempt(ctx, deps).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Held);

    let log = entries(&log);
    assert_eq!(
        log.last().map(String::as_str),
        Some("store_secret:system-tenant-auth/token=auth-disabled")
    );
    assert!(!log.iter().any(|e| e.starts_with("deploy:")
        || e.starts_with("observer:")
        || e.starts_with("wait_")
        || e.starts_with("dns:")
        || e.starts_with("probe:")));
}

#[tokio::test(start_paused = true)]
async fn unreachable_api_is_only_a_warning() {
    let mut harness = Harness::new().provisions(gcp_infra());
    harness.ops.reachable = false;
    let (log, deps) = harness.deps();

    assert_eq!(attempt(gcp_context(), deps).await.unwrap(), AttemptOutcome::Ready);
    assert!(entries(&log).contains(&"apply_tenants:3".to_string()));
}

#[tokio::test(start_paused = true)]
async fn missing_kubeconfig_fails_before_touching_the_cluster() {
    let (log, deps) = Harness::new()
        .provisions(ProvisionedInfra::Gcp { kubeconfig: None })
        .deps();

    let err = attempt(gcp_context(), deps).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KubeConfigMissing);
    assert!(entries(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_image_stops_before_provisioning() {
    let mut harness = Harness::new();
    harness.images = MockImageChecker::new();
    harness
        .images
        .expect_check_image()
        .times(1)
        .returning(|_| ImageStatus::Missing);
    harness.provisioner.expect_ensure_infra_exists().times(0);
    let (_, deps) = harness.deps();

    let err = attempt(gcp_context(), deps).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageMissing);
    assert!(err.kind().is_process_fatal());
}

#[tokio::test(start_paused = true)]
async fn inconclusive_image_check_continues() {
    let mut harness = Harness::new().provisions(gcp_infra());
    harness.images = MockImageChecker::new();
    harness
        .images
        .expect_check_image()
        .returning(|_| ImageStatus::Inconclusive("HTTP 401".into()));
    let (_, deps) = harness.deps();

    assert_eq!(attempt(gcp_context(), deps).await.unwrap(), AttemptOutcome::Ready);
}

#[tokio::test(start_paused = true)]
async fn skipped_image_check_never_queries_registry() {
    let mut harness = Harness::new().provisions(gcp_infra());
    harness.images = MockImageChecker::new();
    harness.images.expect_check_image().times(0);
    let (_, deps) = harness.deps();

    let mut ctx = gcp_context();
    ctx.config.skip_image_check = true;
    assert_eq!(attempt(ctx, deps).await.unwrap(), AttemptOutcome::Ready);
}

#[tokio::test(start_paused = true)]
async fn auth_tokens_reach_secret_and_probes() {
    let (log, deps) = Harness::new().provisions(gcp_infra()).deps();
    let mut ctx = gcp_context();
    ctx.config.auth.enabled = true;
    ctx.config.auth.system_token = Some("sys-token".into());
    ctx.config.tenants[0].api_token = Some("acme-token".into());
    ctx.config.tenants[1].api_token = Some("globex-token".into());

    attempt(ctx, deps).await.unwrap();

    let log = entries(&log);
    assert!(log.contains(&"store_secret:system-tenant-auth/token=sys-token".to_string()));
    assert!(log.contains(
        &"probe:https://acme-api.clusters.example.com/ready:acme-token".to_string()
    ));
    assert!(log.contains(
        &"probe:https://system-ingest.clusters.example.com/ready:sys-token".to_string()
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_readiness_still_stops_the_observer() {
    let mut harness = Harness::new().provisions(gcp_infra());
    harness.ops.controller_ready = false;
    let (log, deps) = harness.deps();

    let err = attempt(gcp_context(), deps).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ControllerDeployFailed);

    let log = entries(&log);
    assert!(log.contains(&"observer:stop".to_string()));
    assert!(!log.iter().any(|e| e.starts_with("probe:")));
}

#[tokio::test(start_paused = true)]
async fn provider_mismatch_is_a_config_error() {
    let mut harness = Harness::new();
    harness.provisioner.expect_ensure_infra_exists().times(0);
    let (_, deps) = harness.deps();

    let mut ctx = gcp_context();
    ctx.config.provider = ProviderType::Aws;
    let err = attempt(ctx, deps).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

/// Provisioner that hangs on its first call
struct SlowFirstProvisioner {
    calls: AtomicU32,
}

#[async_trait]
impl InfraProvisioner for SlowFirstProvisioner {
    async fn ensure_infra_exists(&self, _ctx: &WorkflowContext) -> Result<ProvisionedInfra> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(gcp_infra())
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempt_is_retried() {
    let provisioner = Arc::new(SlowFirstProvisioner {
        calls: AtomicU32::new(0),
    });
    let harness = Harness::new();
    let (_, deps) = harness.deps();
    let deps = Arc::new(WorkflowDeps {
        provisioner: provisioner.clone(),
        ..(*deps).clone()
    });

    let settings = WorkflowSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(10),
            ..Default::default()
        },
        attempt_timeout: Duration::from_secs(600),
        probe_interval: Duration::from_secs(5),
    };

    let start = Instant::now();
    let fatal = AtomicU32::new(0);
    let outcome = create_cluster(Arc::new(gcp_context()), deps, settings, |_| {
        fatal.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .unwrap();

    assert_eq!(outcome, AttemptOutcome::Ready);
    assert_eq!(provisioner.calls.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_secs(610));
    assert_eq!(fatal.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn panics_reach_the_fatal_handler() {
    let mut harness = Harness::new();
    harness
        .provisioner
        .expect_ensure_infra_exists()
        .returning(|_| panic!("provider SDK bug"));
    let (_, deps) = harness.deps();

    let settings = WorkflowSettings {
        retry: RetryPolicy::with_max_attempts(1),
        ..Default::default()
    };
    let fatal = Mutex::new(Vec::new());
    let err = create_cluster(Arc::new(gcp_context()), deps, settings, |e| {
        fatal.lock().unwrap().push(e.to_string());
    })
    .await
    .unwrap_err();

    assert!(err.is_task_fault());
    let fatal = fatal.into_inner().unwrap();
    assert_eq!(fatal.len(), 1);
    assert!(fatal[0].contains("provider SDK bug"));
}

#[tokio::test(start_paused = true)]
async fn domain_errors_do_not_reach_the_fatal_handler() {
    let mut harness = Harness::new();
    harness.images = MockImageChecker::new();
    harness
        .images
        .expect_check_image()
        .returning(|_| ImageStatus::Missing);
    let (_, deps) = harness.deps();

    let fatal = AtomicU32::new(0);
    let err = create_cluster(
        Arc::new(gcp_context()),
        deps,
        WorkflowSettings::default(),
        |_| {
            fatal.fetch_add(1, Ordering::SeqCst);
        },
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ImageMissing);
    assert_eq!(fatal.load(Ordering::SeqCst), 0);
}

#[test]
fn stage_banners_are_numbered() {
    assert_eq!(
        Stage::ProvisionInfra.to_string(),
        "[Stage 3] Provisioning infrastructure"
    );
    assert_eq!(Stage::WaitForEndpoints.number(), 12);
}

#[tokio::test(start_paused = true)]
async fn rejected_secret_aborts_before_deployment() {
    let mut ops = MockClusterOps::new();
    ops.expect_list_namespaces().returning(|| Ok(vec![]));
    ops.expect_apply_tenants_config().times(1).returning(|_| Ok(()));
    ops.expect_apply_controller_config()
        .times(1)
        .returning(|_, _| Ok(()));
    ops.expect_store_secret()
        .times(1)
        .returning(|name, _, _| Err(Error::resource_apply(format!("Secret/{}", name), "forbidden")));
    ops.expect_deploy_controller().times(0);
    let ops: Arc<dyn ClusterOps> = Arc::new(ops);

    let mut connector = MockKubeConnector::new();
    connector
        .expect_connect()
        .times(1)
        .returning(move |_| Ok(ops.clone()));

    let (_, deps) = Harness::new().provisions(gcp_infra()).deps();
    let deps = Arc::new(WorkflowDeps {
        connector: Arc::new(connector),
        ..(*deps).clone()
    });

    let err = attempt(gcp_context(), deps).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceApplyFailed);
    assert!(err.to_string().contains("Secret/system-tenant-auth"));
}
