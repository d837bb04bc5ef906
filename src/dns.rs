//! Waiting for public DNS records to propagate

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::Result;

/// Default interval between resolution attempts
pub const DNS_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Log a progress line every this many unresolved attempts per host
const DNS_LOG_EVERY: u32 = 6;

/// Blocks until hostnames resolve
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsWaiter: Send + Sync {
    /// Wait until every hostname resolves to at least one address
    ///
    /// There is no timeout here; the caller's deadline bounds the wait.
    async fn wait_for_dns_propagation(&self, cluster: &str, hostnames: &[String]) -> Result<()>;
}

/// Polls the system resolver
#[derive(Clone, Debug)]
pub struct ResolverDnsWaiter {
    interval: Duration,
}

impl Default for ResolverDnsWaiter {
    fn default() -> Self {
        Self {
            interval: DNS_POLL_INTERVAL,
        }
    }
}

impl ResolverDnsWaiter {
    /// Waiter with a custom poll interval
    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }
}

async fn resolves(hostname: &str) -> bool {
    match tokio::net::lookup_host((hostname, 443)).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(e) => {
            debug!(hostname = %hostname, error = %e, "Hostname not resolvable yet");
            false
        }
    }
}

#[async_trait]
impl DnsWaiter for ResolverDnsWaiter {
    async fn wait_for_dns_propagation(&self, cluster: &str, hostnames: &[String]) -> Result<()> {
        info!(cluster = %cluster, hosts = hostnames.len(), "Waiting for DNS records");

        for hostname in hostnames {
            let mut attempts = 0u32;
            while !resolves(hostname).await {
                attempts += 1;
                if attempts % DNS_LOG_EVERY == 0 {
                    info!(hostname = %hostname, attempts, "Still waiting for DNS record");
                }
                tokio::time::sleep(self.interval).await;
            }
            debug!(hostname = %hostname, "Hostname resolves");
        }

        info!(cluster = %cluster, "All DNS records resolve");
        Ok(())
    }
}
