//! HTTP client shared by the telemetry agent and the CDN fetchers.
//!
//! The actual transport sits behind a trait so every component can be
//! tested against scripted responses, the same way production traffic
//! goes through reqwest. The client layers exponential-backoff retry on
//! top: transport failures always retry, response statuses retry only
//! when the caller's predicates say so.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

/// Error type for HTTP operations.
///
/// Cloneable so a single failure can be fanned out to every waiter of a
/// shared in-flight request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP transport error: {message}")]
    Transport { message: String },

    #[error("request failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("failed to decode response body: {message}")]
    Decode { message: String },
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        HttpError::Transport {
            message: e.to_string(),
        }
    }
}

/// Request method. Only the verbs this crate actually issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// A single outgoing request, owned so it can be replayed per retry attempt.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a POST request with a body.
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout: None,
        }
    }

    /// Look up a request header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| n.to_ascii_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A received response with status, headers and raw body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    /// Build a response with the canonical reason phrase for `status`.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let status_text = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            status,
            status_text,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Attach a response header. Names are stored lower-cased.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    /// Numeric status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Reason phrase, e.g. "Not Modified".
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a response header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<String, HttpError> {
        String::from_utf8(self.body.clone()).map_err(|e| HttpError::Decode {
            message: e.to_string(),
        })
    }

    /// Body parsed as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::Decode {
            message: e.to_string(),
        })
    }
}

/// Exponential backoff configuration for retried requests.
///
/// The delay before retry attempt `n` is `min_timeout * factor^n`,
/// capped at `max_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub min_timeout: Duration,
    /// Upper bound on the backoff delay.
    pub max_timeout: Duration,
    /// Backoff multiplier per attempt.
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            min_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Set the number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self
    }

    /// Set the upper bound on the backoff delay.
    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    /// Backoff delay before retry attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.min_timeout.as_millis() as u64;
        let factor = u64::from(self.factor).max(1);
        let multiplier = factor.checked_pow(attempt).unwrap_or(u64::MAX);
        let capped = base
            .saturating_mul(multiplier)
            .min(self.max_timeout.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

/// Per-request options: headers, per-attempt timeout, retry behavior.
///
/// `retry_when` decides whether a non-ok status is retried (default:
/// 5xx). `ok_when` decides which statuses are terminal successes
/// (default: 2xx); the CDN fetchers extend it with 304 and the
/// persisted-document fetcher with 404.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub retry_when: Option<fn(u16) -> bool>,
    pub ok_when: Option<fn(u16) -> bool>,
}

impl RequestOptions {
    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override which statuses are retried.
    pub fn with_retry_when(mut self, predicate: fn(u16) -> bool) -> Self {
        self.retry_when = Some(predicate);
        self
    }

    /// Override which statuses count as terminal successes.
    pub fn with_ok_when(mut self, predicate: fn(u16) -> bool) -> Self {
        self.ok_when = Some(predicate);
        self
    }

    fn is_ok_status(&self, status: u16) -> bool {
        match self.ok_when {
            Some(predicate) => predicate(status),
            None => (200..300).contains(&status),
        }
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        match self.retry_when {
            Some(predicate) => predicate(status),
            None => (500..600).contains(&status),
        }
    }
}

/// Trait for the underlying transport.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue one request, without retry.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Production transport backed by reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        let mut headers = Vec::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.push((name.as_str().to_string(), value.to_string()));
            }
        }

        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

/// A scripted transport for testing.
///
/// Answers queued responses in order and records every request it sees.
/// Once the queue is empty every request gets a 200 with an empty body.
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response to hand to the next request.
    pub fn enqueue(&self, response: HttpResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response));
    }

    /// Queue a transport-level failure.
    pub fn enqueue_error(&self, error: HttpError) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    /// All requests seen so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(200, Vec::new())))
    }
}

/// HTTP client with retry. Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
}

impl HttpClient {
    /// Create a client backed by reqwest.
    pub fn new() -> Self {
        Self {
            transport: Arc::new(ReqwestTransport::new()),
        }
    }

    /// Create a client over a custom transport.
    pub fn with_transport(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// GET with retry.
    pub async fn get(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, HttpError> {
        let mut request = HttpRequest::get(url);
        request.headers = options.headers.clone();
        request.timeout = options.timeout;
        self.execute_with_retry(request, &options).await
    }

    /// POST with retry.
    pub async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        options: RequestOptions,
    ) -> Result<HttpResponse, HttpError> {
        let mut request = HttpRequest::post(url, body);
        request.headers = options.headers.clone();
        request.timeout = options.timeout;
        self.execute_with_retry(request, &options).await
    }

    /// Run the retry loop for one request.
    ///
    /// Terminal responses are returned as `Ok` whatever their status;
    /// classifying a 4xx/5xx into an error is the caller's job. Only
    /// running out of attempts on transport failures produces an `Err`.
    async fn execute_with_retry(
        &self,
        request: HttpRequest,
        options: &RequestOptions,
    ) -> Result<HttpResponse, HttpError> {
        let total_attempts = options.retry.retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 0..total_attempts {
            if attempt > 0 {
                tokio::time::sleep(options.retry.delay(attempt - 1)).await;
            }

            match self.transport.execute(request.clone()).await {
                Ok(response) => {
                    if options.is_ok_status(response.status) {
                        return Ok(response);
                    }
                    if options.is_retryable_status(response.status) && attempt + 1 < total_attempts
                    {
                        tracing::debug!(
                            "Retrying {} {} after status {} (attempt {}/{})",
                            request.method,
                            request.url,
                            response.status,
                            attempt + 1,
                            total_attempts
                        );
                        last_error = format!("status {} {}", response.status, response.status_text);
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    tracing::debug!(
                        "{} {} failed: {} (attempt {}/{})",
                        request.method,
                        request.url,
                        error,
                        attempt + 1,
                        total_attempts
                    );
                    last_error = error.to_string();
                }
            }
        }

        Err(HttpError::Exhausted {
            attempts: total_attempts,
            last_error,
        })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
