//! Outbound GETs for remote provider feeds. Requests are capped overall and per provider, and
//! throttling, server errors and connection faults are retried with doubling pauses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "fof-http";

/// `retries` extra attempts after the first, pausing `first_pause * 2^n` (capped) before each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_pause: Duration,
    pub pause_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_pause: Duration::from_millis(500),
            pause_ceiling: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (0-based), or `None` once retries are spent.
    pub fn pause_before(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let pause = self.first_pause.saturating_mul(2u32.saturating_pow(retry));
        Some(pause.min(self.pause_ceiling))
    }
}

fn is_transient(outcome: &Result<reqwest::Response, reqwest::Error>) -> bool {
    match outcome {
        Ok(resp) => {
            resp.status() == StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error()
        }
        Err(err) => err.is_timeout() || err.is_connect(),
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
    pub max_in_flight: usize,
    pub per_provider_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            user_agent: "fof-bot/0.1".to_string(),
            max_in_flight: 8,
            per_provider_in_flight: 2,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{url}: {source} (after {attempts} attempt(s))")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status} (after {attempts} attempt(s))")]
    Status { url: String, status: u16, attempts: u32 },
    #[error("fetcher is shut down")]
    Closed,
}

/// Shared by every remote adapter in a registry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_provider_in_flight: usize,
    lanes: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building provider http client")?;

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_provider_in_flight: config.per_provider_in_flight.max(1),
            lanes: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn lane(&self, provider: &str) -> Arc<Semaphore> {
        self.lanes
            .lock()
            .await
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_in_flight)))
            .clone()
    }

    /// Body of `url` as text, fetched on behalf of `provider`.
    pub async fn get_text(&self, provider: &str, url: &str) -> Result<String, FetchError> {
        let _slot = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let lane = self.lane(provider).await;
        let _lane_slot = lane.acquire().await.map_err(|_| FetchError::Closed)?;

        self.get_with_retry(url)
            .instrument(info_span!("provider_get", provider, url))
            .await
    }

    async fn get_with_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut retry = 0;
        loop {
            let outcome = self.client.get(url).send().await;
            if is_transient(&outcome) {
                if let Some(pause) = self.retry.pause_before(retry) {
                    warn!(retry = retry + 1, ?pause, "transient provider failure");
                    tokio::time::sleep(pause).await;
                    retry += 1;
                    continue;
                }
            }

            let attempts = retry + 1;
            let transport = |source| FetchError::Transport {
                url: url.to_string(),
                attempts,
                source,
            };
            let resp = outcome.map_err(transport)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: resp.url().to_string(),
                    status: status.as_u16(),
                    attempts,
                });
            }
            let body = resp.text().await.map_err(transport)?;
            debug!(status = status.as_u16(), bytes = body.len(), attempts, "provider feed fetched");
            return Ok(body);
        }
    }
}
