//! ETag-validated fetchers for registry artifacts.
//!
//! The CDN serves the latest published artifacts for one target:
//! the composed `/supergraph` SDL, and the `/schema` and `/services`
//! documents for individual services. Every fetcher keeps its latest
//! artifact together with the ETag the CDN handed out, revalidates
//! with `If-None-Match`, and serves the cached artifact on a 304.
//! Artifacts carry a content id (base64 SHA-256) so callers can tell
//! whether anything actually changed.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::http::{HttpClient, HttpResponse, RequestOptions, RetryPolicy};

use super::error::{CdnError, Result};

/// Configuration shared by the CDN fetchers.
#[derive(Debug, Clone)]
pub struct CdnOptions {
    /// Base CDN endpoint for one target, without a trailing slash.
    pub endpoint: String,
    /// CDN access key, sent as `X-Hive-CDN-Key`.
    pub key: SecretString,
    /// User-agent prefix.
    pub name: String,
    /// Per-attempt request timeout. `None` leaves it to the transport.
    pub timeout: Option<Duration>,
    /// Retry behavior. The CDN is a cache in front of the registry, so
    /// the defaults retry often with short delays.
    pub retry: RetryPolicy,
}

impl CdnOptions {
    pub fn new(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: SecretString::from(key.into()),
            name: "hive-client".to_string(),
            timeout: None,
            retry: RetryPolicy::default()
                .with_retries(10)
                .with_min_timeout(Duration::from_millis(50))
                .with_max_timeout(Duration::from_secs(2)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Supergraph SDL plus its content id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupergraphArtifact {
    pub id: String,
    pub supergraph_sdl: String,
}

/// A composed service as published to the CDN.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceDefinition {
    pub sdl: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A service plus the content id derived from its sdl, url and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaArtifact {
    pub id: String,
    pub sdl: String,
    pub name: Option<String>,
    pub url: Option<String>,
}

/// Headers, timeout and retry shared by every CDN request. Callers
/// add their own `ok_when` for the statuses their endpoint treats as
/// terminal successes.
pub(super) fn cdn_request_options(options: &CdnOptions) -> RequestOptions {
    let mut request_options = RequestOptions::default()
        .with_header("X-Hive-CDN-Key", options.key.expose_secret())
        .with_header(
            "User-Agent",
            format!("{}/{}", options.name, env!("CARGO_PKG_VERSION")),
        )
        .with_retry(options.retry);
    if let Some(timeout) = options.timeout {
        request_options = request_options.with_timeout(timeout);
    }
    request_options
}

/// Base64 SHA-256 over the given parts, in order.
fn content_id<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    general_purpose::STANDARD.encode(hasher.finalize())
}

fn schema_id(service: &ServiceDefinition) -> String {
    content_id([
        service.sdl.as_str(),
        service.url.as_deref().unwrap_or(""),
        service.name.as_deref().unwrap_or(""),
    ])
}

fn with_id(service: ServiceDefinition) -> SchemaArtifact {
    let id = schema_id(&service);
    SchemaArtifact {
        id,
        sdl: service.sdl,
        name: service.name,
        url: service.url,
    }
}

/// The CDN publishes either a single service object or an array.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn ensure_array<T>(value: OneOrMany<T>) -> Vec<T> {
    match value {
        OneOrMany::Many(services) => services,
        OneOrMany::One(service) => vec![service],
    }
}

struct CacheEntry<T> {
    etag: String,
    value: T,
}

/// One artifact endpoint with its ETag cache.
struct CdnFetcher<T> {
    http: HttpClient,
    options: CdnOptions,
    url: String,
    /// `Accept` value for endpoints with a negotiable body.
    accept: Option<&'static str>,
    cache: Mutex<Option<CacheEntry<T>>>,
}

impl<T: Clone> CdnFetcher<T> {
    fn new(
        options: CdnOptions,
        http: HttpClient,
        path: &str,
        accept: Option<&'static str>,
    ) -> Self {
        let url = format!("{}{}", options.endpoint, path);
        Self {
            http,
            options,
            url,
            accept,
            cache: Mutex::new(None),
        }
    }

    /// Conditional GET: revalidate the cached artifact when we hold an
    /// ETag, serve from cache on 304, re-parse and re-cache on 200.
    async fn fetch(&self, parse: impl FnOnce(&HttpResponse) -> Result<T>) -> Result<T> {
        let etag = {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.as_ref().map(|entry| entry.etag.clone())
        };

        let mut request_options = cdn_request_options(&self.options)
            .with_ok_when(|status| (200..300).contains(&status) || status == 304);
        if let Some(accept) = self.accept {
            request_options = request_options.with_header("Accept", accept);
        }
        if let Some(etag) = &etag {
            request_options = request_options.with_header("If-None-Match", etag);
        }

        let response = self.http.get(&self.url, request_options).await?;
        match response.status() {
            304 => {
                tracing::debug!("{} not modified, serving cached artifact", self.url);
                let cached = {
                    let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                    cache.as_ref().map(|entry| entry.value.clone())
                };
                cached.ok_or_else(|| CdnError::MissingCacheEntry {
                    endpoint: self.url.clone(),
                })
            }
            status if (200..300).contains(&status) => {
                let value = parse(&response)?;
                if let Some(etag) = response.header("etag") {
                    let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                    *cache = Some(CacheEntry {
                        etag: etag.to_string(),
                        value: value.clone(),
                    });
                }
                Ok(value)
            }
            status => Err(CdnError::UnexpectedStatus {
                endpoint: self.url.clone(),
                status,
                status_text: response.status_text().to_string(),
            }),
        }
    }
}

/// Fetches the composed supergraph SDL.
pub struct SupergraphFetcher {
    inner: CdnFetcher<SupergraphArtifact>,
}

impl SupergraphFetcher {
    pub fn new(options: CdnOptions) -> Self {
        Self::with_http(options, HttpClient::new())
    }

    pub fn with_http(options: CdnOptions, http: HttpClient) -> Self {
        Self {
            inner: CdnFetcher::new(options, http, "/supergraph", None),
        }
    }

    pub async fn fetch(&self) -> Result<SupergraphArtifact> {
        self.inner
            .fetch(|response| {
                let supergraph_sdl = response.text()?;
                Ok(SupergraphArtifact {
                    id: content_id([supergraph_sdl.as_str()]),
                    supergraph_sdl,
                })
            })
            .await
    }
}

/// Fetches the schema of a single-service target.
pub struct SchemaFetcher {
    inner: CdnFetcher<SchemaArtifact>,
}

impl SchemaFetcher {
    pub fn new(options: CdnOptions) -> Self {
        Self::with_http(options, HttpClient::new())
    }

    pub fn with_http(options: CdnOptions, http: HttpClient) -> Self {
        Self {
            inner: CdnFetcher::new(options, http, "/schema", Some("application/json")),
        }
    }

    /// Fetch the service schema. A target that publishes an array of
    /// services yields its first entry.
    pub async fn fetch(&self) -> Result<SchemaArtifact> {
        self.inner
            .fetch(|response| {
                let services = ensure_array(response.json::<OneOrMany<ServiceDefinition>>()?);
                let service = services
                    .into_iter()
                    .next()
                    .ok_or(CdnError::EmptyServicesList)?;
                Ok(with_id(service))
            })
            .await
    }
}

/// Fetches every service registered for the target.
pub struct ServicesFetcher {
    inner: CdnFetcher<Vec<SchemaArtifact>>,
}

impl ServicesFetcher {
    pub fn new(options: CdnOptions) -> Self {
        Self::with_http(options, HttpClient::new())
    }

    pub fn with_http(options: CdnOptions, http: HttpClient) -> Self {
        Self {
            inner: CdnFetcher::new(options, http, "/services", Some("application/json")),
        }
    }

    /// Fetch all services. A single published object yields a
    /// one-element list.
    pub async fn fetch(&self) -> Result<Vec<SchemaArtifact>> {
        self.inner
            .fetch(|response| {
                let services = ensure_array(response.json::<OneOrMany<ServiceDefinition>>()?);
                Ok(services.into_iter().map(with_id).collect())
            })
            .await
    }
}
