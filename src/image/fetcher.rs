//! Pluggable image fetcher
//!
//! Registry wire protocol is out of scope; a fetcher only has to produce a
//! gzip tarball matching the import contract. The default implementation
//! downloads from a plain HTTP(S) base URL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::error::{DaemonError, Result};

/// Produces an image tarball for a reference
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch `reference` and write a gzip tarball under `scratch_dir`.
    ///
    /// Returns the tarball path; the caller removes it after import.
    async fn fetch(&self, reference: &str, scratch_dir: &Path) -> Result<PathBuf>;
}

/// Fetches `<base_url>/<repo>/<tag>.tar.gz` over HTTP
pub struct HttpFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, reference: &str, scratch_dir: &Path) -> Result<PathBuf> {
        let (repo, tag) = reference
            .rsplit_once(':')
            .ok_or_else(|| DaemonError::invalid_argument("pull_image", "reference missing tag"))?;

        let url = format!("{}/{}/{}.tar.gz", self.base_url.trim_end_matches('/'), repo, tag);
        info!("fetching {} from {}", reference, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DaemonError::unavailable("pull_image", e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DaemonError::not_found("pull_image", reference));
        }
        if !response.status().is_success() {
            return Err(DaemonError::unavailable(
                "pull_image",
                format!("fetch failed with status {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DaemonError::io("pull_image", e.to_string()))?;

        tokio::fs::create_dir_all(scratch_dir).await?;
        let out = scratch_dir.join(format!("pull-{}.tar.gz", uuid::Uuid::new_v4()));
        tokio::fs::write(&out, &bytes).await?;

        Ok(out)
    }
}
