//! Static HTTP capture of a source's listing page.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::StatusCode;
use shelterwatch_core::RawCapture;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: StatusCode },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// Throttling, server errors, timeouts and connection failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Closed => false,
        }
    }
}

/// Exponential backoff between attempts, doubling from `first_delay` up to `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Requests in flight across all sources.
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: concat!("shelterwatch-bot/", env!("CARGO_PKG_VERSION")).to_string(),
            max_in_flight: 8,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building http client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            retry: config.retry,
        })
    }

    /// GET `url` and wrap the body as a capture of `source_id`.
    pub async fn fetch_capture(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<RawCapture, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let mut retry = 0;
            loop {
                match self.get_once(source_id, url).await {
                    Ok(capture) => {
                        debug!(bytes = capture.byte_size(), final_url = %capture.url, "fetched");
                        return Ok(capture);
                    }
                    Err(err) if err.is_transient() && retry < self.retry.retries => {
                        let delay = self.retry.delay_before_retry(retry);
                        warn!(
                            retry,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient fetch failure"
                        );
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, source_id: &str, url: &str) -> Result<RawCapture, FetchError> {
        let request_failed = |source: reqwest::Error| FetchError::Request {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(request_failed)?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: final_url,
                status,
            });
        }

        let body = response.text().await.map_err(request_failed)?;
        Ok(RawCapture::new(source_id, final_url, body, Utc::now()))
    }
}
