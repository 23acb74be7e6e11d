//! Out-of-band fetching of remote images referenced by chat requests.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage>;
}

/// Fetches images over HTTP with the shared client.
#[derive(Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpImageFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProxyError::transport(format!("Image fetch failed for {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::transport(format!(
                "Image fetch for {url} returned status {}",
                status.as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?;
        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

/// Refuses every fetch; used when `images.fetch_remote` is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledImageFetcher;

#[async_trait]
impl ImageFetcher for DisabledImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        Err(ProxyError::other(format!(
            "Remote image fetching is disabled, skipping {url}"
        )))
    }
}
