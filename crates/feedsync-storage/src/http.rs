//! Bounded, retrying HTTP client used by upstream adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub global_concurrency: usize,
    pub per_group_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            global_concurrency: 8,
            per_group_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

/// HTTP client with global and per-grouping concurrency limits and
/// exponential backoff on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    bearer_token: Option<String>,
    global_limit: Arc<Semaphore>,
    per_group_limit: usize,
    per_group: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_group_limit: config.per_group_concurrency.max(1),
            per_group: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn group_semaphore(&self, group: &str) -> Arc<Semaphore> {
        let mut map = self.per_group.lock().await;
        map.entry(group.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_group_limit)))
            .clone()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, group: &str, url: &str) -> Result<T, FetchError> {
        let response = self.send(Method::GET, group, url).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn delete(&self, group: &str, url: &str) -> Result<(), FetchError> {
        self.send(Method::DELETE, group, url).await.map(|_| ())
    }

    async fn send(&self, method: Method, group: &str, url: &str) -> Result<reqwest::Response, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_group = self.group_semaphore(group).await;
        let _group = per_group.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = tracing::info_span!("upstream_http", %method, group, url);
        self.send_with_retry(method, url).instrument(span).await
    }

    async fn send_with_retry(&self, method: Method, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }
            let can_retry = attempt < self.backoff.max_retries;

            match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if can_retry && classify_status(status) == RetryDisposition::Retryable {
                        tracing::warn!(%status, attempt, "retrying upstream request");
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                }
                Err(err) => {
                    if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        tracing::warn!(error = %err, attempt, "retrying upstream request");
                    } else {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
