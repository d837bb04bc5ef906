//! reqwest-backed probe transport

use std::time::Duration;

use async_trait::async_trait;

use super::{ProbeResponse, ProbeTransport};
use crate::{Error, Result};

/// Connect timeout for a single probe
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Total timeout for a single probe
pub const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe transport over HTTPS
///
/// Certificate verification is off: endpoints are probed before their
/// certificates have been issued.
#[derive(Clone, Debug)]
pub struct HttpProbeTransport {
    client: reqwest::Client,
}

impl HttpProbeTransport {
    /// Build the transport
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(PROBE_CONNECT_TIMEOUT)
            .timeout(PROBE_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::internal_with_context("probe", format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn get(&self, url: &str, bearer: Option<String>) -> Result<ProbeResponse> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let unreachable = |e: reqwest::Error| Error::ProbeUnreachable {
            url: url.to_string(),
            message: e.to_string(),
        };
        let response = request.send().await.map_err(unreachable)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(unreachable)?;

        Ok(ProbeResponse { status, body })
    }
}
