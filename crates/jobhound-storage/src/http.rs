//! Best-effort HTTP transport shared by the network-backed adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

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

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Total number of tries, the first one included.
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    /// Longest one request can take when every try runs into the timeout.
    pub fn worst_case(&self) -> Duration {
        let tries = u32::try_from(self.backoff.attempts()).unwrap_or(u32::MAX);
        let waits: Duration = (0..self.backoff.max_retries)
            .map(|retry| self.backoff.delay_for_attempt(retry))
            .sum();
        self.timeout.saturating_mul(tries).saturating_add(waits)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempts: {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` with retry on transient failures. A 200 with an empty body counts as a failure.
    pub async fn get_text(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.get_text_inner(source_id, url, query)
            .instrument(span)
            .await
    }

    async fn get_text_inner(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        // Semaphores are never closed, so acquisition only fails on shutdown.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        let attempts = self.backoff.attempts();
        let mut attempt = 0usize;
        loop {
            let started = Instant::now();
            let outcome = self.client.get(url).query(query).send().await;

            let err = match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        match resp.text().await {
                            Ok(body) if !body.trim().is_empty() => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body,
                                    latency_ms: started.elapsed().as_millis() as u64,
                                });
                            }
                            Ok(_) => FetchError::EmptyBody { url: final_url },
                            Err(source) => FetchError::Request {
                                attempts: attempt + 1,
                                source,
                            },
                        }
                    } else if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    } else {
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        }
                    }
                }
                Err(source) => {
                    if classify_reqwest_error(&source) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request {
                            attempts: attempt + 1,
                            source,
                        });
                    }
                    FetchError::Request {
                        attempts: attempt + 1,
                        source,
                    }
                }
            };

            attempt += 1;
            if attempt >= attempts {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt - 1);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<(T, u64), FetchError> {
        let resp = self.get_text(source_id, url, query).await?;
        let value = serde_json::from_str(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url.clone(),
            source,
        })?;
        Ok((value, resp.latency_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_tries_three_times_with_doubling_waits() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1600));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn worst_case_covers_every_try_and_wait() {
        let config = HttpClientConfig::default();
        assert_eq!(config.worst_case(), Duration::from_millis(3 * 20_000 + 800 + 1600));

        let single = HttpClientConfig {
            timeout: Duration::from_secs(1),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        };
        assert_eq!(single.worst_case(), Duration::from_secs(1));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
