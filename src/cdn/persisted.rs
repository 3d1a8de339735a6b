//! Persisted document resolution.
//!
//! Servers that only accept persisted operations resolve a document
//! id (`<client-name>~<client-version>~<hash>`) to the operation text
//! published on the CDN. Resolved documents are immutable, so hits
//! and 404 misses are both cached, and concurrent lookups for the
//! same document share a single in-flight request instead of piling
//! onto the CDN.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;

use crate::http::{HttpClient, RequestOptions};

use super::artifact::{CdnOptions, cdn_request_options};
use super::error::{CdnError, Result};

/// Cap on resolved documents kept per fetcher.
const DOCUMENT_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(10_000).unwrap();

type DocumentCache = Arc<Mutex<LruCache<String, Option<String>>>>;
type SharedFetch = Shared<BoxFuture<'static, Result<Option<String>>>>;

/// Resolves persisted document ids to their operation text.
pub struct PersistedDocumentsFetcher {
    http: HttpClient,
    options: CdnOptions,
    cache: DocumentCache,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
}

impl PersistedDocumentsFetcher {
    pub fn new(options: CdnOptions) -> Self {
        Self::with_http(options, HttpClient::new())
    }

    pub fn with_http(options: CdnOptions, http: HttpClient) -> Self {
        Self {
            http,
            options,
            cache: Arc::new(Mutex::new(LruCache::new(DOCUMENT_CACHE_CAPACITY))),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the document cache with one of the given capacity.
    pub fn with_cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.cache = Arc::new(Mutex::new(LruCache::new(capacity)));
        self
    }

    /// Resolve one document id.
    ///
    /// `Ok(None)` means the CDN does not know the document, and that
    /// answer is cached like a hit. Errors are handed to every caller
    /// of the shared fetch and nothing is cached, so the next lookup
    /// tries again.
    pub async fn fetch(&self, document_id: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/apps/{}",
            self.options.endpoint,
            document_id.replace('~', "/")
        );

        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(&url) {
                return Ok(entry.clone());
            }
        }

        let shared = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = in_flight.get(&url) {
                existing.clone()
            } else {
                let future = Self::fetch_document(
                    self.http.clone(),
                    url.clone(),
                    self.request_options(),
                    self.cache.clone(),
                )
                .boxed()
                .shared();
                in_flight.insert(url.clone(), future.clone());
                future
            }
        };

        let result = shared.clone().await;

        // First settled caller clears the slot. `ptr_eq` keeps a
        // straggler from removing a newer fetch for the same url.
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = in_flight.get(&url) {
                if current.ptr_eq(&shared) {
                    in_flight.remove(&url);
                }
            }
        }

        result
    }

    fn request_options(&self) -> RequestOptions {
        cdn_request_options(&self.options)
            .with_ok_when(|status| (200..300).contains(&status) || status == 404)
    }

    async fn fetch_document(
        http: HttpClient,
        url: String,
        request_options: RequestOptions,
        cache: DocumentCache,
    ) -> Result<Option<String>> {
        let response = http.get(&url, request_options).await?;
        match response.status() {
            404 => {
                tracing::debug!("Persisted document {} not found, caching the miss", url);
                cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(url, None);
                Ok(None)
            }
            status if (200..300).contains(&status) => {
                let document = response.text()?;
                cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(url, Some(document.clone()));
                Ok(Some(document))
            }
            status => Err(CdnError::UnexpectedStatus {
                endpoint: url,
                status,
                status_text: response.status_text().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{
        HttpError, HttpRequest, HttpResponse, HttpTransport, MockTransport, RetryPolicy,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    fn options() -> CdnOptions {
        CdnOptions::new("https://cdn.graphql-hive.com/artifacts/v1/target", "cdn-key")
    }

    fn fetcher(mock: Arc<MockTransport>) -> PersistedDocumentsFetcher {
        PersistedDocumentsFetcher::with_http(options(), HttpClient::with_transport(mock))
    }

    /// Delays every response so concurrent fetches overlap.
    struct SlowTransport {
        inner: MockTransport,
        delay: Duration,
    }

    #[async_trait]
    impl HttpTransport for SlowTransport {
        async fn execute(
            &self,
            request: HttpRequest,
        ) -> std::result::Result<HttpResponse, HttpError> {
            tokio::time::sleep(self.delay).await;
            self.inner.execute(request).await
        }
    }

    // ==================== caching ====================

    #[tokio::test]
    async fn test_resolved_document_is_cached() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue(HttpResponse::new(200, "query Me { me { id } }"));
        let fetcher = fetcher(mock.clone());

        let first = fetcher.fetch("my-app~1.0.0~deadbeef").await.unwrap();
        let second = fetcher.fetch("my-app~1.0.0~deadbeef").await.unwrap();

        assert_eq!(first.as_deref(), Some("query Me { me { id } }"));
        assert_eq!(second, first);
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_document_caches_the_miss() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue(HttpResponse::new(404, ""));
        let fetcher = fetcher(mock.clone());

        let first = fetcher.fetch("my-app~1.0.0~unknown").await.unwrap();
        let second = fetcher.fetch("my-app~1.0.0~unknown").await.unwrap();

        assert_eq!(first, None);
        assert_eq!(second, None);
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue(HttpResponse::new(500, ""));
        mock.enqueue(HttpResponse::new(200, "query Me { me { id } }"));
        let cdn_options = options().with_retry(RetryPolicy::default().with_retries(0));
        let fetcher =
            PersistedDocumentsFetcher::with_http(cdn_options, HttpClient::with_transport(mock.clone()));

        match fetcher.fetch("my-app~1.0.0~deadbeef").await {
            Err(CdnError::UnexpectedStatus { status, .. }) => assert_eq!(status, 500),
            other => panic!("expected UnexpectedStatus, got {:?}", other),
        }

        let retried = fetcher.fetch("my-app~1.0.0~deadbeef").await.unwrap();
        assert_eq!(retried.as_deref(), Some("query Me { me { id } }"));
        assert_eq!(mock.request_count(), 2);
    }

    #[tokio::test]
    async fn test_cache_evicts_least_recently_used() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue(HttpResponse::new(200, "query A { a }"));
        mock.enqueue(HttpResponse::new(200, "query B { b }"));
        mock.enqueue(HttpResponse::new(200, "query A2 { a }"));
        let fetcher = fetcher(mock.clone())
            .with_cache_capacity(NonZeroUsize::new(1).unwrap());

        fetcher.fetch("app~1~a").await.unwrap();
        fetcher.fetch("app~1~b").await.unwrap();

        let refetched = fetcher.fetch("app~1~a").await.unwrap();
        assert_eq!(refetched.as_deref(), Some("query A2 { a }"));
        assert_eq!(mock.request_count(), 3);

        let still_cached = fetcher.fetch("app~1~a").await.unwrap();
        assert_eq!(still_cached.as_deref(), Some("query A2 { a }"));
        assert_eq!(mock.request_count(), 3);
    }

    // ==================== request shape ====================

    #[tokio::test]
    async fn test_document_id_maps_to_apps_url() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue(HttpResponse::new(200, "query Me { me { id } }"));
        let fetcher = fetcher(mock.clone());

        fetcher.fetch("my-app~1.0.0~deadbeef").await.unwrap();

        let requests = mock.requests();
        assert_eq!(
            requests[0].url,
            "https://cdn.graphql-hive.com/artifacts/v1/target/apps/my-app/1.0.0/deadbeef"
        );
        assert_eq!(requests[0].header("x-hive-cdn-key"), Some("cdn-key"));
    }

    // ==================== request coalescing ====================

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_request() {
        let inner = MockTransport::new();
        inner.enqueue(HttpResponse::new(200, "query Me { me { id } }"));
        let slow = Arc::new(SlowTransport {
            inner,
            delay: Duration::from_millis(10),
        });
        let fetcher = PersistedDocumentsFetcher::with_http(
            options(),
            HttpClient::with_transport(slow.clone()),
        );

        let (first, second) = tokio::join!(
            fetcher.fetch("my-app~1.0.0~deadbeef"),
            fetcher.fetch("my-app~1.0.0~deadbeef"),
        );

        assert_eq!(first.unwrap().as_deref(), Some("query Me { me { id } }"));
        assert_eq!(second.unwrap().as_deref(), Some("query Me { me { id } }"));
        assert_eq!(slow.inner.request_count(), 1);
        assert!(
            fetcher
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_failure_reaches_every_waiter() {
        let inner = MockTransport::new();
        inner.enqueue(HttpResponse::new(500, ""));
        let slow = Arc::new(SlowTransport {
            inner,
            delay: Duration::from_millis(10),
        });
        let cdn_options = options().with_retry(RetryPolicy::default().with_retries(0));
        let fetcher = PersistedDocumentsFetcher::with_http(
            cdn_options,
            HttpClient::with_transport(slow.clone()),
        );

        let (first, second) = tokio::join!(
            fetcher.fetch("my-app~1.0.0~deadbeef"),
            fetcher.fetch("my-app~1.0.0~deadbeef"),
        );

        assert!(matches!(
            first,
            Err(CdnError::UnexpectedStatus { status: 500, .. })
        ));
        assert!(matches!(
            second,
            Err(CdnError::UnexpectedStatus { status: 500, .. })
        ));
        assert_eq!(slow.inner.request_count(), 1);
    }
}
