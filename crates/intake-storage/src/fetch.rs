use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Doubling delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Server-requested delay wins over the computed one, within `max_delay`.
    fn delay_with_hint(&self, retry: usize, hint: Option<Duration>) -> Duration {
        hint.map(|h| h.min(self.max_delay)).unwrap_or_else(|| self.delay(retry))
    }
}

/// 429 and 5xx are worth another attempt; everything else is final.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests allowed in a burst.
    pub burst: u32,
    /// Sustained requests per second.
    pub per_second: f64,
}

/// Token bucket with continuous refill.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new((f64::from(limit.burst.max(1)), Instant::now())),
        }
    }

    /// Waits until a request may go out.
    pub async fn acquire(&self) {
        let capacity = f64::from(self.limit.burst.max(1));
        let rate = self.limit.per_second.max(f64::MIN_POSITIVE);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last) = &mut *state;
                let now = Instant::now();
                *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * rate).min(capacity);
                *last = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - *tokens) / rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
    /// Applied to every source without an entry in `source_rate_limits`.
    pub rate_limit: Option<RateLimit>,
    pub source_rate_limits: HashMap<String, RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_source: 4,
            retry: RetryPolicy::default(),
            rate_limit: None,
            source_rate_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::LimiterClosed => None,
        }
    }
}

/// Shared HTTP client for source fetches. Limits requests in flight globally and
/// per source, applies the optional per-source rate limit, and retries transient
/// failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_source_in_flight: usize,
    retry: RetryPolicy,
    rate_limit: Option<RateLimit>,
    source_rate_limits: HashMap<String, RateLimit>,
    sources: Mutex<HashMap<String, SourceLimits>>,
}

#[derive(Debug, Clone)]
struct SourceLimits {
    in_flight: Arc<Semaphore>,
    rate: Option<Arc<RateLimiter>>,
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
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_source_in_flight: config.max_in_flight_per_source.max(1),
            retry: config.retry,
            rate_limit: config.rate_limit,
            source_rate_limits: config.source_rate_limits,
            sources: Mutex::new(HashMap::new()),
        })
    }

    /// Rate limit applied to requests made for `source_id`, if any.
    pub fn rate_limit_for(&self, source_id: &str) -> Option<RateLimit> {
        self.source_rate_limits.get(source_id).copied().or(self.rate_limit)
    }

    async fn limits_for(&self, source_id: &str) -> SourceLimits {
        let mut sources = self.sources.lock().await;
        sources
            .entry(source_id.to_string())
            .or_insert_with(|| SourceLimits {
                in_flight: Arc::new(Semaphore::new(self.per_source_in_flight)),
                rate: self.rate_limit_for(source_id).map(|limit| Arc::new(RateLimiter::new(limit))),
            })
            .clone()
    }

    /// GET `url` on behalf of `source_id` with extra request headers.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<HttpResponse, FetchError> {
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::LimiterClosed)?;
        let limits = self.limits_for(source_id).await;
        let _source = limits.in_flight.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.get_with_retries(url, headers, limits.rate.as_deref())
            .instrument(span)
            .await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        headers: &[(&str, String)],
        rate: Option<&RateLimiter>,
    ) -> Result<HttpResponse, FetchError> {
        let mut retry = 0;
        loop {
            if let Some(rate) = rate {
                rate.acquire().await;
            }
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            let exhausted = retry >= self.retry.max_retries;

            let hint = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = resp.bytes().await?.to_vec();
                    debug!(bytes = body.len(), retries = retry, "fetched");
                    return Ok(HttpResponse { url, content_type, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if exhausted || !is_retryable_status(status) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    debug!(status = status.as_u16(), retry, "transient http status");
                    retry_after(resp.headers())
                }
                Err(err) => {
                    if exhausted || !is_retryable_error(&err) {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, retry, "transient request error");
                    None
                }
            };

            tokio::time::sleep(self.retry.delay_with_hint(retry, hint)).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(30))),
            Duration::from_millis(350)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_requests_after_the_burst() {
        let limiter = RateLimiter::new(RateLimit {
            burst: 2,
            per_second: 1.0,
        });
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test]
    async fn rate_limits_are_keyed_by_source() {
        let github = RateLimit {
            burst: 1,
            per_second: 0.5,
        };
        let fetcher = HttpFetcher::new(HttpClientConfig {
            source_rate_limits: HashMap::from([("github-trending".to_string(), github)]),
            ..Default::default()
        })
        .unwrap();

        let limited = fetcher.limits_for("github-trending").await;
        assert_eq!(limited.rate.map(|r| r.limit), Some(github));
        assert!(fetcher.limits_for("dev-news").await.rate.is_none());
    }

    #[tokio::test]
    async fn retries_transient_statuses_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string(r#"{"items":[]}"#),
            )
            .mount(&server)
            .await;

        let resp = fast_fetcher(3)
            .fetch_bytes(
                Uuid::new_v4(),
                "feed",
                &format!("{}/feed", server.uri()),
                &[("authorization", "Bearer secret".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(resp.body, br#"{"items":[]}"#.to_vec());
        assert_eq!(resp.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn client_errors_are_final() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fast_fetcher(3)
            .fetch_bytes(Uuid::new_v4(), "feed", &format!("{}/missing", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = fast_fetcher(2)
            .fetch_bytes(Uuid::new_v4(), "feed", &format!("{}/flaky", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
    }
}
