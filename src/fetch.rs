//! Media Fetcher
//!
//! Downloads a single URL into memory with bounded retries:
//! - Per-attempt timeout (a slow attempt never eats the whole budget)
//! - Exponential backoff with jitter between attempts
//! - Retries on timeouts, connection failures, 408/429 and 5xx
//! - Other 4xx responses (expired signed links) fail immediately
//!
//! URLs are redacted before they reach logs or errors.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use crate::config::FetchSettings;
use crate::error::{redact_url, MemoryError};

/// Source of media bytes.
///
/// The scheduler only talks to this trait, so tests swap in in-memory fakes.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetch the full body of `url`.
    ///
    /// Returns [`MemoryError::Network`] once retries are exhausted or on a
    /// non-retryable response.
    async fn fetch(&self, url: &str) -> Result<Bytes, MemoryError>;
}

/// Outcome of one failed attempt
#[derive(Debug)]
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

/// reqwest-backed [`Fetch`] implementation
pub struct HttpFetcher {
    client: Client,
    settings: FetchSettings,
}

impl HttpFetcher {
    /// Create a fetcher with a pooled client tuned for many parallel downloads
    pub fn new(settings: FetchSettings) -> Result<Self> {
        let client = Client::builder()
            // ═══════════════════════════════════════════════════════════════
            // CONNECTION REUSE
            // ═══════════════════════════════════════════════════════════════
            // Let the CDN negotiate HTTP/2; most media hosts multiplex
            .http2_adaptive_window(true)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .use_rustls_tls()
            // ═══════════════════════════════════════════════════════════════
            // COMPRESSION
            // ═══════════════════════════════════════════════════════════════
            .brotli(true)
            .zstd(true)
            .gzip(true)
            .deflate(true)
            // ═══════════════════════════════════════════════════════════════
            // TIMEOUTS (total timeout is applied per attempt)
            // ═══════════════════════════════════════════════════════════════
            .connect_timeout(settings.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("memfetch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, settings })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client, settings: FetchSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    async fn attempt(&self, url: &str) -> Result<Bytes, AttemptError> {
        let response = self
            .client
            .get(url)
            .timeout(self.settings.attempt_timeout())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {status}");
            return Err(if is_retryable_status(status) {
                AttemptError::Retryable(reason)
            } else {
                AttemptError::Fatal(reason)
            });
        }

        response.bytes().await.map_err(classify)
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    #[instrument(skip(self, url), fields(url = %redact_url(url)))]
    async fn fetch(&self, url: &str) -> Result<Bytes, MemoryError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(&self.settings, attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis(), "Retrying fetch");
                tokio::time::sleep(delay).await;
            }

            match self.attempt(url).await {
                Ok(bytes) => {
                    debug!(size = bytes.len(), attempt, "Fetched");
                    return Ok(bytes);
                }
                Err(AttemptError::Fatal(reason)) => {
                    return Err(MemoryError::network(url, reason));
                }
                Err(AttemptError::Retryable(reason)) => {
                    warn!(attempt = attempt + 1, max_attempts, "Fetch attempt failed: {reason}");
                    last_reason = reason;
                }
            }
        }

        Err(MemoryError::network(
            url,
            format!("{last_reason} (after {max_attempts} attempts)"),
        ))
    }
}

/// Request timeout, 429 and server errors are transient; other 4xx mean the
/// link itself is bad.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify(err: reqwest::Error) -> AttemptError {
    let fatal = err.is_builder() || err.is_redirect() || err.is_status();
    let reason = err.without_url().to_string();
    if fatal {
        AttemptError::Fatal(reason)
    } else {
        AttemptError::Retryable(reason)
    }
}

/// Delay before retry number `retry` (0-based): base * 2^retry, capped, plus
/// up to half the base in jitter.
fn backoff_delay(settings: &FetchSettings, retry: u32) -> Duration {
    let exp = settings
        .backoff_ms
        .saturating_mul(1u64 << retry.min(16))
        .min(settings.max_backoff_ms);
    let jitter = if settings.backoff_ms > 1 {
        rand::thread_rng().gen_range(0..=settings.backoff_ms / 2)
    } else {
        0
    };
    Duration::from_millis(exp + jitter)
}
