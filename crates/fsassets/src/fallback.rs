//! Secondary asset source consulted when the local store misses.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::asset::Asset;

/// A provider asked for assets this store does not have.
#[async_trait]
pub trait FallbackAssetSource: Send + Sync {
    /// Fetch an asset by logical id. A miss is `Ok(None)`.
    async fn get(&self, id: &str) -> Result<Option<Asset>>;
}

/// Fallback over HTTP.
///
/// Expects `GET {endpoint}/assets/{id}/metadata` to return the asset's JSON
/// descriptor and `GET {endpoint}/assets/{id}/data` the raw bytes. A 404 on
/// either is a miss.
pub struct HttpFallback {
    base_url: String,
    client: Client,
}

impl HttpFallback {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build fallback http client")?;

        Ok(Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, url: &str) -> Result<Option<reqwest::Response>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("fallback request failed: {url}"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("fallback returned an error: {url}"))?;
        Ok(Some(response))
    }
}

#[async_trait]
impl FallbackAssetSource for HttpFallback {
    #[tracing::instrument(skip(self), fields(fallback.url = %self.base_url))]
    async fn get(&self, id: &str) -> Result<Option<Asset>> {
        let meta_url = format!("{}/assets/{}/metadata", self.base_url, id);
        let Some(response) = self.fetch(&meta_url).await? else {
            debug!("fallback has no metadata");
            return Ok(None);
        };
        let mut asset: Asset = response
            .json()
            .await
            .with_context(|| format!("invalid fallback metadata: {meta_url}"))?;

        let data_url = format!("{}/assets/{}/data", self.base_url, id);
        let Some(response) = self.fetch(&data_url).await? else {
            debug!("fallback has metadata but no data");
            return Ok(None);
        };
        asset.data = response
            .bytes()
            .await
            .with_context(|| format!("failed to read fallback data: {data_url}"))?
            .to_vec();

        if asset.id.is_empty() {
            asset.id = id.to_string();
        }
        Ok(Some(asset))
    }
}
