//! Background observation of the controller workloads
//!
//! Watches the controller's Deployment and Pods while the workflow waits for
//! readiness, so rollout problems show up in the log as they happen rather
//! than only as an eventual timeout. The loop never ends on its own; it stops
//! when its task is cancelled.

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use super::resources::controller_selector;
use crate::Result;

/// Container waiting reasons that indicate a broken rollout
const PROBLEM_REASONS: [&str; 5] = [
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Human-readable problem with a pod, if any
pub fn describe_pod_issue(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;

    for cs in status.container_statuses.iter().flatten() {
        if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            let reason = waiting.reason.as_deref().unwrap_or_default();
            if PROBLEM_REASONS.contains(&reason) {
                return Some(format!(
                    "container {} waiting: {}{}",
                    cs.name,
                    reason,
                    waiting
                        .message
                        .as_deref()
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default()
                ));
            }
        }
        if let Some(terminated) = cs.last_state.as_ref().and_then(|s| s.terminated.as_ref()) {
            if cs.restart_count > 0 {
                return Some(format!(
                    "container {} restarted {} times, last exit code {}",
                    cs.name, cs.restart_count, terminated.exit_code
                ));
            }
        }
    }

    if status.phase.as_deref() == Some("Failed") {
        return Some(format!(
            "pod failed: {}",
            status.message.as_deref().unwrap_or("no message")
        ));
    }
    None
}

fn log_deployment(deployment: &Deployment) {
    let status = deployment.status.as_ref();
    info!(
        deployment = %deployment.name_any(),
        replicas = status.and_then(|s| s.replicas).unwrap_or(0),
        ready = status.and_then(|s| s.ready_replicas).unwrap_or(0),
        updated = status.and_then(|s| s.updated_replicas).unwrap_or(0),
        "Controller deployment changed"
    );
}

fn log_pod(pod: &Pod) {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    match describe_pod_issue(pod) {
        Some(issue) => warn!(pod = %pod.name_any(), phase = %phase, issue = %issue, "Controller pod unhealthy"),
        None => debug!(pod = %pod.name_any(), phase = %phase, "Controller pod changed"),
    }
}

/// Watch the controller Deployment and its Pods until cancelled
pub async fn observe_controller(client: Client, namespace: &str) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let pods: Api<Pod> = Api::namespaced(client, namespace);

    let config = watcher::Config::default().labels(&controller_selector());
    let deployment_watcher = watcher::watcher(deployments, config.clone()).default_backoff();
    let pod_watcher = watcher::watcher(pods, config).default_backoff();

    let mut deployment_watcher = std::pin::pin!(deployment_watcher);
    let mut pod_watcher = std::pin::pin!(pod_watcher);

    info!(namespace = %namespace, "Observing controller workloads");

    loop {
        tokio::select! {
            Some(event) = deployment_watcher.next() => match event {
                Ok(Event::Apply(d)) | Ok(Event::InitApply(d)) => log_deployment(&d),
                Ok(Event::Delete(d)) => warn!(deployment = %d.name_any(), "Controller deployment deleted"),
                Ok(Event::Init) | Ok(Event::InitDone) => {}
                Err(e) => debug!(error = %e, "Deployment watch error"),
            },
            Some(event) = pod_watcher.next() => match event {
                Ok(Event::Apply(p)) | Ok(Event::InitApply(p)) => log_pod(&p),
                Ok(Event::Delete(p)) => debug!(pod = %p.name_any(), "Controller pod deleted"),
                Ok(Event::Init) | Ok(Event::InitDone) => {}
                Err(e) => debug!(error = %e, "Pod watch error"),
            },
            else => {
                debug!("Controller watch streams ended");
                return Ok(());
            }
        }
    }
}
