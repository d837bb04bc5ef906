//! Concurrent readiness poller
//!
//! Each target gets its own polling loop, spawned as a child of the calling
//! task. A loop retries forever: unreachable endpoints and non-ready answers
//! are both "not yet". The poller finishes when every loop has seen a ready
//! answer; bounding the total wait is the caller's job.
//!
//! Logging is rate limited per loop. Every failure is logged at debug, and
//! every [`TRANSPORT_LOG_EVERY`]th consecutive transport failure (or every
//! [`RESPONSE_LOG_EVERY`]th attempt that got an answer) is also logged at
//! info so long waits stay visible without flooding the output.

mod transport;

pub use transport::HttpProbeTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::config::{ClusterConfig, READINESS_PATH};
use crate::task::TaskContext;
use crate::Result;

/// Pause between probes of one target
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive transport failures between info-level log lines
pub const TRANSPORT_LOG_EVERY: u32 = 5;
/// Answered attempts between info-level log lines
pub const RESPONSE_LOG_EVERY: u32 = 2;
/// Longest response body excerpt that gets logged
pub const BODY_LOG_LIMIT: usize = 256;

/// One endpoint to wait on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Full readiness URL
    pub url: String,
    /// Tenant the endpoint belongs to
    pub group_key: String,
    /// Bearer token to present, if auth is enabled
    pub auth_token: Option<String>,
}

/// Resolves the bearer token for a group key
pub trait TokenLookup: Send + Sync {
    /// Token for `group_key`, `None` when no auth is needed
    fn token_for(&self, group_key: &str) -> Option<String>;
}

impl TokenLookup for ClusterConfig {
    fn token_for(&self, group_key: &str) -> Option<String> {
        self.tenant_token(group_key)
    }
}

/// Readiness targets for every tenant service, system tenant included
pub fn probe_targets(config: &ClusterConfig, tokens: &dyn TokenLookup) -> Vec<ProbeTarget> {
    config
        .all_tenants()
        .into_iter()
        .flat_map(|tenant| {
            let token = tokens.token_for(&tenant);
            config
                .tenant_hostnames(&tenant)
                .into_iter()
                .map(move |host| ProbeTarget {
                    url: format!("https://{}{}", host, READINESS_PATH),
                    group_key: tenant.clone(),
                    auth_token: token.clone(),
                })
        })
        .collect()
}

/// HTTP answer from a readiness endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeResponse {
    /// Status code
    pub status: u16,
    /// Raw body
    pub body: String,
}

/// Issues readiness requests
///
/// Non-2xx statuses are answers, not errors. `Err` means the endpoint could
/// not be reached at all (`ProbeUnreachable`).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// GET `url`, optionally with `Authorization: Bearer <token>`
    async fn get(&self, url: &str, bearer: Option<String>) -> Result<ProbeResponse>;
}

/// Verdict on one answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Endpoint is serving
    Ready,
    /// Endpoint answered but is not serving yet
    NotReady(String),
}

/// Ready means HTTP 200 with a JSON body whose `status` is `"success"`
pub fn evaluate_response(response: &ProbeResponse) -> ProbeVerdict {
    if response.status != 200 {
        return ProbeVerdict::NotReady(format!("HTTP {}", response.status));
    }
    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(body) => match body.get("status").and_then(|s| s.as_str()) {
            Some("success") => ProbeVerdict::Ready,
            Some(other) => ProbeVerdict::NotReady(format!("status {:?}", other)),
            None => ProbeVerdict::NotReady("no status field".to_string()),
        },
        Err(e) => ProbeVerdict::NotReady(format!("body is not JSON: {}", e)),
    }
}

/// Cut `body` to at most `limit` characters for logging
pub fn truncate_body(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Per-loop counters used only to decide how loudly to log
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeState {
    /// Total probes issued
    pub attempts: u32,
    /// Transport failures since the last answer
    pub consecutive_transport_failures: u32,
    /// Most recent reason for not being ready
    pub last_error: Option<String>,
}

impl ProbeState {
    /// Record an unreachable endpoint; true when this one deserves an info line
    pub fn record_transport_failure(&mut self, reason: String) -> bool {
        self.attempts += 1;
        self.consecutive_transport_failures += 1;
        self.last_error = Some(reason);
        self.consecutive_transport_failures % TRANSPORT_LOG_EVERY == 0
    }

    /// Record a non-ready answer; true when this one deserves an info line
    pub fn record_not_ready(&mut self, reason: String) -> bool {
        self.attempts += 1;
        self.consecutive_transport_failures = 0;
        self.last_error = Some(reason);
        self.attempts % RESPONSE_LOG_EVERY == 0
    }
}

/// Poll one target until it is ready; returns the number of probes issued
pub async fn probe_until_ready(
    target: &ProbeTarget,
    transport: &dyn ProbeTransport,
    interval: Duration,
) -> u32 {
    let mut state = ProbeState::default();

    loop {
        match transport.get(&target.url, target.auth_token.clone()).await {
            Ok(response) => match evaluate_response(&response) {
                ProbeVerdict::Ready => {
                    state.attempts += 1;
                    info!(
                        url = %target.url,
                        tenant = %target.group_key,
                        attempts = state.attempts,
                        "Endpoint ready"
                    );
                    return state.attempts;
                }
                ProbeVerdict::NotReady(reason) => {
                    let body = truncate_body(&response.body, BODY_LOG_LIMIT);
                    debug!(url = %target.url, status = response.status, body = %body, "Endpoint not ready");
                    if state.record_not_ready(reason) {
                        info!(
                            url = %target.url,
                            status = response.status,
                            attempt = state.attempts,
                            reason = ?state.last_error,
                            "Waiting for endpoint"
                        );
                    }
                }
            },
            Err(e) => {
                debug!(url = %target.url, error = %e, "Endpoint unreachable");
                if state.record_transport_failure(e.to_string()) {
                    info!(
                        url = %target.url,
                        failures = state.consecutive_transport_failures,
                        error = %e,
                        "Endpoint still unreachable"
                    );
                }
            }
        }

        tokio::time::sleep(interval).await;
    }
}

/// Wait until every target is ready
///
/// One child task per target is spawned under `ctx`, so cancelling the
/// caller stops every loop.
pub async fn wait_until_ready(
    ctx: &TaskContext,
    targets: Vec<ProbeTarget>,
    transport: Arc<dyn ProbeTransport>,
    interval: Duration,
) -> Result<()> {
    info!(targets = targets.len(), "Waiting for endpoints to become ready");

    let handles: Vec<_> = targets
        .into_iter()
        .map(|target| {
            let transport = transport.clone();
            ctx.spawn(format!("probe {}", target.url), move |_| async move {
                Ok(probe_until_ready(&target, transport.as_ref(), interval).await)
            })
        })
        .collect();

    for handle in handles {
        let name = handle.name().to_string();
        handle.join().await.into_result(&name)?;
    }

    info!("All endpoints ready");
    Ok(())
}
