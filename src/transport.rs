//! Resilient HTTP transport for the vault API.
//!
//! A single [`Transport`] (and therefore a single `reqwest::Client`) is built
//! per engine, so the TLS trust override, auth header, retry policy and the
//! shared [`CircuitBreaker`] apply to every request the crate makes. No other
//! module constructs its own HTTP client.
//!
//! # Retry Strategy
//!
//! Only `GET` is retried by default:
//! - network errors and timeouts → retry
//! - HTTP 429 and 5xx → retry
//! - HTTP 403/404 and other 4xx → fail immediately
//! - backoff: `backoff_base_ms * 2^attempt`, capped at `backoff_max_ms`
//!
//! `PUT`, `POST` and `DELETE` are attempted once unless the caller opts in.
//!
//! # Timeout Tiers
//!
//! | Tier | Used for |
//! |------|----------|
//! | short | directory listings |
//! | medium | note reads and writes |
//! | long | files known to exceed `large_file_bytes` |
//!
//! Note bodies are always read with [`Transport::get_streamed`], which feeds
//! response chunks through a [`StreamMerger`] as they arrive.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::circuit::{CircuitBreaker, CircuitState, Permit};
use crate::config::{TransportConfig, VaultConfig};
use crate::error::{Result, VaultError};
use crate::stream::StreamMerger;

/// Characters left unescaped in a path segment (RFC 3986 unreserved).
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTier {
    Short,
    Medium,
    Long,
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub tier: TimeoutTier,
    pub accept: Option<&'static str>,
    pub content_type: Option<&'static str>,
    /// Override the default (retry only `GET`).
    pub retry: Option<bool>,
}

impl RequestOptions {
    pub fn tier(tier: TimeoutTier) -> Self {
        Self {
            tier,
            accept: None,
            content_type: None,
            retry: None,
        }
    }

    pub fn accept(mut self, accept: &'static str) -> Self {
        self.accept = Some(accept);
        self
    }

    pub fn content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = Some(content_type);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl Response {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("json"))
            .unwrap_or(false)
    }
}

/// Body of a streamed read, already merged into text.
#[derive(Debug, Clone)]
pub struct StreamedBody {
    pub content_type: Option<String>,
    /// Number of raw chunks the body arrived in.
    pub segments: usize,
    pub text: String,
}

impl StreamedBody {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("json"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    circuit_rejections: AtomicU64,
    latency_ms_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub avg_latency_ms: f64,
    pub circuit: CircuitState,
}

pub struct Transport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    config: TransportConfig,
    breaker: Arc<CircuitBreaker>,
    counters: Counters,
}

impl Transport {
    pub fn new(
        vault: &VaultConfig,
        config: &TransportConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        if vault.trust_self_signed {
            tracing::warn!(
                base_url = %vault.base_url,
                "TLS certificate verification disabled by vault.trust_self_signed"
            );
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(vault.trust_self_signed)
            .build()
            .map_err(|e| VaultError::Transport {
                path: vault.base_url.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: vault.base_url.trim_end_matches('/').to_string(),
            api_key: vault.resolved_api_key(),
            config: config.clone(),
            breaker,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Absolute URL for a vault path. Every segment is percent-encoded;
    /// a trailing `/` (directory) is preserved.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/vault/{}", self.base_url, encode_path(path))
    }

    pub fn timeout_for(&self, tier: TimeoutTier) -> Duration {
        Duration::from_millis(match tier {
            TimeoutTier::Short => self.config.timeout_short_ms,
            TimeoutTier::Medium => self.config.timeout_medium_ms,
            TimeoutTier::Long => self.config.timeout_long_ms,
        })
    }

    /// Issue one logical request, retrying idempotent calls.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        opts: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let retry = opts.retry.unwrap_or(method == Method::GET);
        let max_attempts = if retry { self.config.max_retries + 1 } else { 1 };

        let mut attempt = 0;
        loop {
            let result = self
                .attempt(method.clone(), path, body.clone(), opts, cancel)
                .await;
            let err = match result {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };

            attempt += 1;
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = self.backoff(attempt - 1);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                path,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying vault request"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// `GET` a file and merge its body chunk by chunk through a
    /// [`StreamMerger`] instead of buffering the whole response first.
    pub async fn get_streamed(
        &self,
        path: &str,
        opts: &RequestOptions,
        window: usize,
        cancel: &CancellationToken,
    ) -> Result<StreamedBody> {
        let mut attempt = 0;
        loop {
            let err = match self.attempt_streamed(path, opts, window, cancel).await {
                Ok(body) => return Ok(body),
                Err(err) => err,
            };
            attempt += 1;
            if !err.is_retryable() || attempt > self.config.max_retries {
                return Err(err);
            }
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.backoff(attempt - 1);
            tracing::debug!(path, attempt, error = %err, "retrying streamed read");
            tokio::select! {
                _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    pub fn stats(&self) -> TransportStats {
        let requests = self.counters.requests.load(Ordering::Relaxed);
        let latency = self.counters.latency_ms_total.load(Ordering::Relaxed);
        TransportStats {
            requests,
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
            avg_latency_ms: if requests > 0 {
                latency as f64 / requests as f64
            } else {
                0.0
            },
            circuit: self.breaker.state(),
        }
    }

    fn backoff(&self, retry_index: u32) -> Duration {
        let factor = 1u64 << retry_index.min(16);
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.config.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Gate a call through the breaker. Returns `CircuitOpen` without any
    /// network activity when rejected.
    fn admit(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        match self.breaker.acquire() {
            Permit::Allowed => Ok(()),
            Permit::Rejected { retry_in } => {
                self.counters
                    .circuit_rejections
                    .fetch_add(1, Ordering::Relaxed);
                Err(VaultError::CircuitOpen { retry_in })
            }
        }
    }

    fn build(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        opts: &RequestOptions,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url_for(path))
            .timeout(self.timeout_for(opts.tier));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(accept) = opts.accept {
            req = req.header(reqwest::header::ACCEPT, accept);
        }
        if let Some(ct) = opts.content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, ct);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        req
    }

    async fn attempt(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        opts: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.admit(cancel)?;
        let started = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let timeout = self.timeout_for(opts.tier);
        let req = self.build(method.clone(), path, body, opts);
        let call = async {
            let resp = req.send().await.map_err(|e| map_reqwest(e, path, timeout))?;
            let status = resp.status().as_u16();
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = resp
                .bytes()
                .await
                .map_err(|e| map_reqwest(e, path, timeout))?;
            Ok::<_, VaultError>(Response {
                status,
                body: body.to_vec(),
                content_type,
            })
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.breaker.release_probe();
                return Err(VaultError::Cancelled);
            }
            outcome = call => outcome,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.counters
            .latency_ms_total
            .fetch_add(elapsed_ms, Ordering::Relaxed);

        let result = outcome.and_then(|resp| classify(resp, path));
        self.record(&method, path, &result, elapsed_ms);
        result
    }

    async fn attempt_streamed(
        &self,
        path: &str,
        opts: &RequestOptions,
        window: usize,
        cancel: &CancellationToken,
    ) -> Result<StreamedBody> {
        self.admit(cancel)?;
        let started = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let timeout = self.timeout_for(opts.tier);
        let req = self.build(Method::GET, path, None, opts);
        let call = async {
            let mut resp = req.send().await.map_err(|e| map_reqwest(e, path, timeout))?;
            let status = resp.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(status_error(status, path));
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let mut merger = StreamMerger::lines(window);
            let mut segments = 0usize;
            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|e| map_reqwest(e, path, timeout))?
            {
                segments += 1;
                merger.feed(&chunk);
            }
            Ok::<_, VaultError>(StreamedBody {
                content_type,
                segments,
                text: merger.finalize(),
            })
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                self.breaker.release_probe();
                return Err(VaultError::Cancelled);
            }
            outcome = call => outcome,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.counters
            .latency_ms_total
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.record(&Method::GET, path, &result, elapsed_ms);
        result
    }

    fn record<T>(&self, method: &Method, path: &str, result: &Result<T>, elapsed_ms: u64) {
        match result {
            Ok(_) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.breaker.record_success();
                tracing::debug!(%method, path, elapsed_ms, "vault request ok");
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if err.counts_as_backend_failure() {
                    self.breaker.record_failure();
                    tracing::warn!(%method, path, elapsed_ms, error = %err, "vault request failed");
                } else {
                    // The backend answered; it is healthy even if the path is not.
                    self.breaker.record_success();
                    tracing::debug!(%method, path, elapsed_ms, error = %err, "vault request rejected");
                }
            }
        }
    }
}

fn classify(resp: Response, path: &str) -> Result<Response> {
    if (200..300).contains(&resp.status) {
        Ok(resp)
    } else {
        Err(status_error(resp.status, path))
    }
}

fn status_error(status: u16, path: &str) -> VaultError {
    match status {
        404 => VaultError::NotFound(path.to_string()),
        401 | 403 => VaultError::Forbidden(path.to_string()),
        status => VaultError::Status {
            status,
            path: path.to_string(),
        },
    }
}

fn map_reqwest(err: reqwest::Error, path: &str, timeout: Duration) -> VaultError {
    if err.is_timeout() {
        VaultError::Timeout {
            path: path.to_string(),
            after: timeout,
        }
    } else {
        VaultError::Transport {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Percent-encode each segment of a vault path, keeping `/` separators.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| utf8_percent_encode(seg, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base: &str) -> Transport {
        let vault = VaultConfig {
            base_url: base.to_string(),
            api_key: None,
            trust_self_signed: false,
        };
        Transport::new(
            &vault,
            &TransportConfig::default(),
            Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
        )
        .unwrap()
    }

    #[test]
    fn test_encode_path_segments() {
        assert_eq!(encode_path("notes/a b.md"), "notes/a%20b.md");
        assert_eq!(encode_path("dir/"), "dir/");
        assert_eq!(encode_path("q&a/ñ#1.md"), "q%26a/%C3%B1%231.md");
        assert_eq!(encode_path(""), "");
    }

    #[test]
    fn test_url_for_trims_base() {
        let t = transport("https://127.0.0.1:27124/");
        assert_eq!(t.url_for(""), "https://127.0.0.1:27124/vault/");
        assert_eq!(
            t.url_for("notes/x y.md"),
            "https://127.0.0.1:27124/vault/notes/x%20y.md"
        );
    }

    #[test]
    fn test_backoff_capped() {
        let t = transport("http://localhost:1");
        assert_eq!(t.backoff(0), Duration::from_millis(200));
        assert_eq!(t.backoff(1), Duration::from_millis(400));
        assert_eq!(t.backoff(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_classify_statuses() {
        let resp = |status| Response {
            status,
            body: Vec::new(),
            content_type: None,
        };
        assert!(classify(resp(200), "a").is_ok());
        assert!(matches!(classify(resp(404), "a"), Err(VaultError::NotFound(_))));
        assert!(matches!(classify(resp(403), "a"), Err(VaultError::Forbidden(_))));
        assert!(matches!(
            classify(resp(500), "a"),
            Err(VaultError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_open_circuit_skips_network() {
        let t = transport("http://127.0.0.1:9");
        t.breaker().record_failure();
        for _ in 0..4 {
            t.breaker().record_failure();
        }
        let err = t
            .request(
                Method::GET,
                "",
                None,
                &RequestOptions::tier(TimeoutTier::Short),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::CircuitOpen { .. }));
        assert_eq!(t.stats().requests, 0);
        assert_eq!(t.stats().circuit_rejections, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let t = transport("http://127.0.0.1:9");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = t
            .request(
                Method::GET,
                "a.md",
                None,
                &RequestOptions::tier(TimeoutTier::Short),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Cancelled));
    }
}
