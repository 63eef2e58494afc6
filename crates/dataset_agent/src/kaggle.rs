//! Rate-limited Kaggle API client.

use core::num::NonZeroU32;
use core::time::Duration;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::source::{DatasetHit, DatasetSource, RateLimitedError, SourceError};

/// Rate limit: requests per second
const RATE_LIMIT_PER_SECOND: u32 = 1;

/// Rate limit: requests per hour
const RATE_LIMIT_PER_HOUR: u32 = 500;

/// Base URL for the Kaggle API
const API_BASE_URL: &str = "https://www.kaggle.com/api/v1";

/// Results fetched per search strategy.
const SEARCH_PAGE_SIZE: usize = 20;

type RateLimiterType = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate-limited client for the Kaggle datasets API.
pub struct KaggleClient {
    client: Client,
    username: String,
    key: String,
    per_second_limiter: RateLimiterType,
    per_hour_limiter: RateLimiterType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KaggleDataset {
    #[serde(rename = "ref")]
    dataset_ref: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    download_count: u64,
}

impl KaggleClient {
    /// Creates a new client with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(username: String, key: String) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| SourceError::Request(format!("failed to create HTTP client: {e}")))?;

        let per_second_quota = Quota::per_second(
            NonZeroU32::new(RATE_LIMIT_PER_SECOND).expect("rate limit should be non-zero"),
        );
        let per_hour_quota = Quota::per_hour(
            NonZeroU32::new(RATE_LIMIT_PER_HOUR).expect("rate limit should be non-zero"),
        );

        Ok(Self {
            client,
            username,
            key,
            per_second_limiter: RateLimiter::direct(per_second_quota),
            per_hour_limiter: RateLimiter::direct(per_hour_quota),
        })
    }

    /// Waits for rate limiters before making a request.
    async fn wait_for_rate_limit(&self) {
        self.per_second_limiter.until_ready().await;
        self.per_hour_limiter.until_ready().await;
    }

    async fn list_datasets(&self, query: &str) -> Result<Vec<DatasetHit>, SourceError> {
        self.wait_for_rate_limit().await;

        let url = format!("{API_BASE_URL}/datasets/list");
        info!(query, "Searching Kaggle datasets");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.key))
            .query(&[("search", query), ("sortBy", "hottest")])
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let status = response.status();
        if status == 429 {
            warn!(query, "Rate limited (429) by Kaggle");
            return Err(RateLimitedError.into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Request(format!(
                "search failed with status {status}: {body}"
            )));
        }

        let datasets: Vec<KaggleDataset> = response
            .json()
            .await
            .map_err(|e| SourceError::Request(format!("failed to parse search response: {e}")))?;

        info!(query, count = datasets.len(), "Received search results");

        Ok(datasets
            .into_iter()
            .take(SEARCH_PAGE_SIZE)
            .map(|dataset| DatasetHit {
                slug: dataset.dataset_ref,
                title: dataset.title,
                total_bytes: dataset.total_bytes,
                download_count: dataset.download_count,
            })
            .collect())
    }
}

#[async_trait]
impl DatasetSource for KaggleClient {
    /// Searches with progressively looser strategies: the exact phrase,
    /// then single keywords, then adjacent keyword pairs.
    async fn search(&self, keywords: &[String]) -> Result<Vec<DatasetHit>, SourceError> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let phrase = keywords.join(" ");
        let hits = self.list_datasets(&phrase).await?;
        if !hits.is_empty() {
            return Ok(hits);
        }

        if keywords.len() > 1 {
            for keyword in keywords {
                let hits = self.list_datasets(keyword).await?;
                if !hits.is_empty() {
                    return Ok(hits);
                }
            }
        }

        if keywords.len() > 2 {
            for pair in keywords.windows(2) {
                let query = pair.join(" ");
                let hits = self.list_datasets(&query).await?;
                if !hits.is_empty() {
                    return Ok(hits);
                }
            }
        }

        Ok(Vec::new())
    }

    async fn download(&self, hit: &DatasetHit, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        self.wait_for_rate_limit().await;

        let url = format!("{API_BASE_URL}/datasets/download/{}", hit.slug);
        info!(slug = %hit.slug, "Downloading dataset archive");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.key))
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let status = response.status();
        if status == 429 {
            warn!(slug = %hit.slug, "Rate limited (429) during download");
            return Err(RateLimitedError.into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Request(format!(
                "download failed with status {status}: {body}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Request(format!("failed to read archive bytes: {e}")))?;

        let file_name = format!("{}.zip", hit.slug.replace('/', "_"));
        let dest = dest_dir.join(file_name);
        tokio::fs::write(&dest, &bytes).await?;

        info!(slug = %hit.slug, bytes = bytes.len(), "Downloaded dataset archive");
        Ok(dest)
    }
}
