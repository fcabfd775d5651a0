//! HTTP transport with bounded retry, exponential backoff and cancellation.
//!
//! Used for source image downloads and by [`HttpObjectStore`] for cache
//! lookups and uploads.
//!
//! ## Retry policy
//!
//! - network failures and 5xx responses are retried
//! - 4xx responses are returned to the caller untouched
//! - every attempt is bounded by its own timeout
//! - delay before retry `n` is `retry_delay * 2^(n-1)`, without jitter
//!
//! [`HttpObjectStore`]: crate::store::HttpObjectStore

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use backoff::{future::retry_notify, ExponentialBackoff};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument, warn};

use crate::cancel::CancelSignal;
use crate::error::{LumenError, Result};

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single backoff delay.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

/// Per-call transport options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay, doubled after every failed attempt.
    pub retry_delay: Duration,
    /// Bound on each individual attempt.
    pub timeout: Duration,
    /// Aborts the call, including pending backoff sleeps.
    pub cancel: Option<CancelSignal>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            cancel: None,
        }
    }
}

impl FetchOptions {
    pub fn with_cancel(mut self, cancel: Option<CancelSignal>) -> Self {
        self.cancel = cancel;
        self
    }
}

/// HTTP client wrapper applying [`FetchOptions`] to every request.
#[derive(Clone)]
pub struct ResilientTransport {
    client: Client,
}

impl ResilientTransport {
    /// Create a transport with a fresh connection pool.
    ///
    /// Timeouts are applied per attempt, so the client itself has none.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lumen/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LumenError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// GET `url` under the retry policy.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<Response> {
        self.execute(url, options, |client| client.get(url)).await
    }

    /// Run the request produced by `build` under the retry policy.
    ///
    /// `build` is invoked once per attempt so bodies and headers are rebuilt.
    #[instrument(level = "debug", skip(self, options, build), fields(
        max_retries = options.max_retries,
        timeout_ms = options.timeout.as_millis() as u64
    ))]
    pub async fn execute<F>(&self, url: &str, options: &FetchOptions, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        if let Some(cancel) = &options.cancel {
            cancel.check()?;
        }

        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let retry = retry_notify(
            build_backoff(options.retry_delay),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                self.attempt_once(url, attempt, options, &build)
            },
            |err: LumenError, delay: Duration| {
                warn!(
                    url,
                    error = %err,
                    retry_after_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
            },
        );

        let result = match &options.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(cancel.to_error()),
                    res = retry => res,
                }
            }
            None => retry.await,
        };

        let total_latency_ms = start.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::SeqCst);
        match &result {
            Ok(response) => debug!(
                status = %response.status(),
                attempts,
                total_latency_ms,
                "Request completed"
            ),
            Err(e) => warn!(
                error = %e,
                attempts,
                total_latency_ms,
                "Request failed"
            ),
        }
        result
    }

    async fn attempt_once<F>(
        &self,
        url: &str,
        attempt: u32,
        options: &FetchOptions,
        build: &F,
    ) -> std::result::Result<Response, backoff::Error<LumenError>>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let start = Instant::now();
        let exhausted = attempt > options.max_retries;

        let outcome = tokio::time::timeout(options.timeout, build(&self.client).send()).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (err, transient) = match outcome {
            Err(_) => (
                fetch_failed(
                    url,
                    None,
                    format!("attempt {attempt} timed out after {}ms", options.timeout.as_millis()),
                ),
                true,
            ),
            Ok(Err(e)) => {
                let transient = is_transient_error(&e);
                (fetch_failed(url, None, e.to_string()), transient)
            }
            Ok(Ok(response)) => {
                let status = response.status();
                debug!(attempt, status = %status, latency_ms, "Received HTTP response");
                if !is_retryable_status(status) {
                    return Ok(response);
                }
                (
                    fetch_failed(url, Some(status.as_u16()), format!("server returned {status}")),
                    true,
                )
            }
        };

        if transient && !exhausted {
            warn!(attempt, latency_ms, error = %err, "Transient failure, will retry");
            Err(backoff::Error::transient(err))
        } else {
            warn!(attempt, latency_ms, error = %err, "Giving up");
            Err(backoff::Error::permanent(err))
        }
    }
}

fn fetch_failed(url: &str, status: Option<u16>, message: String) -> LumenError {
    LumenError::FetchFailed {
        url: url.to_string(),
        status,
        message,
    }
}

fn build_backoff(retry_delay: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: retry_delay,
        initial_interval: retry_delay,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: MAX_RETRY_INTERVAL,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Check if a reqwest error is a network-level failure worth retrying.
pub fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Server errors are retried; everything else is the caller's business.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
}
