//! Rate-limited HTTP fetching with bounded retries.
//!
//! Every outbound call takes a permit from the concurrency limit and a token
//! from the source's bucket before it is sent. Timeouts, connect errors, 5xx
//! and 429 are transient and retried with capped exponential backoff;
//! 401/403 and 404 are terminal on the first attempt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Auth,
    NotFound,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RetryDisposition::Auth
    } else if status == StatusCode::NOT_FOUND {
        RetryDisposition::NotFound
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
    /// Total attempts per call, the first one included.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One request per `interval`, no bursting.
    pub fn spaced(interval: Duration) -> Self {
        Self {
            capacity: 1,
            refill_every: interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
    /// Upper bound on how long a `Retry-After` header may park a call.
    pub retry_after_cap: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig::spaced(Duration::from_millis(500))),
            retry_after_cap: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            } else if self.refill_every.is_zero() {
                state.tokens = self.capacity;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            detail: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication rejected (http {status}) for {url}")]
    Auth { status: u16, url: String },
    #[error("not found: {url}")]
    NotFound { url: String },
    /// Single-attempt failure worth retrying; only escapes `try_once`.
    #[error("transient failure: {detail}")]
    Transient {
        detail: String,
        retry_after: Option<Duration>,
    },
    #[error("source unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: usize, last_error: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("undecodable response from {url}: {detail}")]
    Decode { url: String, detail: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
    retry_after_cap: Duration,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
            retry_after_cap: config.retry_after_cap,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Sends the request built by `build`, retrying transient failures until
    /// the attempt budget runs out. `build` is invoked once per attempt.
    pub async fn send<F>(&self, label: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let attempts = self.backoff.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.try_once(&build).await {
                Ok(resp) => {
                    debug!(label, attempt = attempt + 1, status = resp.status.as_u16(), "fetched");
                    return Ok(resp);
                }
                Err(FetchError::Transient { detail, retry_after }) => {
                    last_error = detail;
                    if attempt + 1 < attempts {
                        let delay = retry_after
                            .map(|d| d.min(self.retry_after_cap))
                            .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
                        warn!(
                            label,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "transient fetch failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(FetchError::Unavailable {
            attempts,
            last_error,
        })
    }

    /// One rate-limited attempt, classified but never retried.
    pub async fn try_once<F>(&self, build: &F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|err| FetchError::Transient {
                detail: err.to_string(),
                retry_after: None,
            })?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let resp = match build(&self.client).send().await {
            Ok(resp) => resp,
            Err(err) => {
                return Err(match classify_reqwest_error(&err) {
                    RetryDisposition::Retryable => FetchError::Transient {
                        detail: err.to_string(),
                        retry_after: None,
                    },
                    _ => FetchError::Request(err),
                })
            }
        };

        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            let body = resp.bytes().await.map_err(|err| FetchError::Transient {
                detail: format!("reading body from {final_url}: {err}"),
                retry_after: None,
            })?;
            return Ok(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
            });
        }

        match classify_status(status) {
            RetryDisposition::Retryable => Err(FetchError::Transient {
                detail: format!("http status {} for {final_url}", status.as_u16()),
                retry_after: retry_after(resp.headers()),
            }),
            RetryDisposition::Auth => Err(FetchError::Auth {
                status: status.as_u16(),
                url: final_url,
            }),
            RetryDisposition::NotFound => Err(FetchError::NotFound { url: final_url }),
            RetryDisposition::NonRetryable => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            }),
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
