//! HTTP feed retrieval through the CORS proxy + the retry combinator.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "velsync-fetch";

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping `policy.delay`
/// between attempts and re-surfacing the final error once the budget is
/// exhausted. Generic over any fallible async operation; the caller decides
/// what one "attempt" covers.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, label, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                warn!(attempt, max_attempts = attempts, %err, label, "attempt failed");
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(last_err.expect("retry loop should capture an error"))
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid proxy url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty proxy payload for {url}")]
    EmptyPayload { url: String },
}

/// The proxy wraps the target document in a JSON envelope; `contents` holds
/// the raw feed body.
#[derive(Debug, Deserialize)]
struct ProxyEnvelope {
    #[serde(default)]
    contents: String,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Base URL of the CORS proxy; the feed URL is appended as the `url`
    /// query parameter.
    pub proxy_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            proxy_url: "https://api.allorigins.win/get".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "velsync/0.1".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Fetches the raw RSS document for a feed URL through the CORS proxy.
///
/// Exactly one outbound request per attempt, no caching. The retry policy
/// wraps the single network call only, never the downstream parse stages.
#[derive(Debug)]
pub struct FeedFetcher {
    client: reqwest::Client,
    proxy_url: String,
    retry: RetryPolicy,
}

impl FeedFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            proxy_url: config.proxy_url,
            retry: config.retry,
        })
    }

    fn proxied_url(&self, feed_url: &str) -> Result<reqwest::Url, FetchError> {
        let mut url =
            reqwest::Url::parse(&self.proxy_url).map_err(|err| FetchError::InvalidUrl {
                url: self.proxy_url.clone(),
                message: err.to_string(),
            })?;
        url.query_pairs_mut().append_pair("url", feed_url);
        Ok(url)
    }

    /// Retrieve the raw feed text, retrying per the configured policy.
    pub async fn fetch_feed(&self, feed_url: &str) -> Result<String, FetchError> {
        let url = self.proxied_url(feed_url)?;
        with_retry(&self.retry, "feed fetch", || self.fetch_once(url.clone())).await
    }

    async fn fetch_once(&self, url: reqwest::Url) -> Result<String, FetchError> {
        let display_url = url.to_string();
        debug!(url = %display_url, "fetching feed through proxy");

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: display_url,
            });
        }

        let envelope: ProxyEnvelope = resp.json().await?;
        if envelope.contents.trim().is_empty() {
            return Err(FetchError::EmptyPayload { url: display_url });
        }
        Ok(envelope.contents)
    }
}
