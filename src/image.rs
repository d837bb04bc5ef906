//! Pre-flight check that the controller image exists
//!
//! Queries the registry's v2 manifest endpoint. Only a definite 404 counts
//! as missing; anything else (auth challenges, network errors, 5xx) is
//! inconclusive and the bring-up proceeds.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::{Error, Result};

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.oci.image.manifest.v1+json";

/// Result of an image existence check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageStatus {
    /// The registry has the manifest
    Present,
    /// The registry reports the manifest does not exist
    Missing,
    /// The registry could not give a definite answer
    Inconclusive(String),
}

/// Checks whether an image reference exists
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageChecker: Send + Sync {
    /// Look up `image` in its registry
    async fn check_image(&self, image: &str) -> ImageStatus;
}

/// Parsed `registry/repository:tag` or `@digest` reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (with port)
    pub registry: String,
    /// Repository path
    pub repository: String,
    /// Tag or digest
    pub reference: String,
}

impl ImageReference {
    /// Parse an image reference, applying Docker Hub defaults
    pub fn parse(image: &str) -> Result<Self> {
        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => {
                let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
                match image[last_slash..].rfind(':') {
                    Some(colon) => (
                        &image[..last_slash + colon],
                        image[last_slash + colon + 1..].to_string(),
                    ),
                    None => (image, "latest".to_string()),
                }
            }
        };

        if name.is_empty() || reference.is_empty() {
            return Err(Error::config_invalid_field(
                "image",
                format!("invalid image reference '{}'", image),
            ));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
            None => (DOCKER_HUB_REGISTRY.to_string(), format!("library/{}", name)),
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    fn manifest_path(&self) -> String {
        format!("/v2/{}/manifests/{}", self.repository, self.reference)
    }
}

/// Image checker speaking the registry v2 API
#[derive(Clone, Debug)]
pub struct RegistryImageChecker {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl RegistryImageChecker {
    /// Checker that contacts each image's own registry over HTTPS
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::internal_with_context("image_check", e.to_string()))?;
        Ok(Self {
            client,
            base_url: None,
        })
    }

    /// Checker that sends every lookup to `base_url` instead of the image's registry
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let mut checker = Self::new()?;
        checker.base_url = Some(base_url.into());
        Ok(checker)
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        match self.base_url {
            Some(ref base) => format!("{}{}", base.trim_end_matches('/'), reference.manifest_path()),
            None => format!("https://{}{}", reference.registry, reference.manifest_path()),
        }
    }
}

#[async_trait]
impl ImageChecker for RegistryImageChecker {
    async fn check_image(&self, image: &str) -> ImageStatus {
        let reference = match ImageReference::parse(image) {
            Ok(r) => r,
            Err(e) => return ImageStatus::Inconclusive(e.to_string()),
        };
        let url = self.manifest_url(&reference);
        debug!(image = %image, url = %url, "Checking image manifest");

        match self
            .client
            .head(&url)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
        {
            Ok(resp) => match resp.status().as_u16() {
                200 => ImageStatus::Present,
                404 => ImageStatus::Missing,
                other => ImageStatus::Inconclusive(format!("registry answered HTTP {}", other)),
            },
            Err(e) => ImageStatus::Inconclusive(format!("registry unreachable: {}", e)),
        }
    }
}
