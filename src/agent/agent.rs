//! The buffering and scheduling engine behind report delivery.
//!
//! An [`Agent`] accepts events from request handlers, folds them into
//! its buffer and ships the buffer to the collector in batches. A
//! single timer drives the periodic flush; filling the buffer to
//! `max_size` triggers one ahead of schedule. Flushes never overlap,
//! and a batch that fails delivery is dropped rather than requeued so
//! a flaky collector cannot make the buffer grow without bound.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use secrecy::ExposeSecret;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::http::{HttpClient, HttpResponse, RequestOptions, RetryPolicy};

use super::buffer::{BodySerializer, EventBuffer};
use super::error::{AgentError, Result};
use super::options::AgentOptions;

/// Batching telemetry agent.
///
/// Generic over the buffer shape and the event type, so the same
/// engine serves flat event lists and aggregating usage buffers.
/// Cheap to clone; clones share one buffer and one timer.
///
/// The agent schedules its timer and its size-triggered flushes on
/// the ambient tokio runtime, so it must be created and used inside
/// one.
pub struct Agent<B, T>
where
    B: EventBuffer<T> + 'static,
    T: Send + 'static,
{
    inner: Arc<AgentInner<B>>,
    _marker: PhantomData<fn(T)>,
}

impl<B, T> Clone for Agent<B, T>
where
    B: EventBuffer<T> + 'static,
    T: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

struct AgentInner<B> {
    options: AgentOptions,
    http: HttpClient,
    serializer: Box<dyn BodySerializer<B>>,
    state: Mutex<AgentState<B>>,
    /// Tasks spawned by `capture_future`, drained by `dispose`.
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes flushes. Never held while the state lock is held.
    flush_lock: tokio::sync::Mutex<()>,
    /// Wakes the pending timer task when disposal begins.
    shutdown: Notify,
    disposed: AtomicBool,
    user_agent: String,
}

struct AgentState<B> {
    buffer: B,
    /// The pending interval timer. `None` while a flush is running or
    /// before the first capture.
    timer: Option<JoinHandle<()>>,
}

impl<B> AgentInner<B> {
    fn debug_log(&self, message: &str) {
        if self.options.debug {
            tracing::info!("[{}] {}", self.options.name, message);
        } else {
            tracing::debug!("[{}] {}", self.options.name, message);
        }
    }

    fn request_options(&self) -> RequestOptions {
        let mut options = RequestOptions::default()
            .with_header("Accept", "application/json")
            .with_header("Content-Type", "application/json")
            .with_header(
                "Authorization",
                format!("Bearer {}", self.options.token.expose_secret()),
            )
            .with_header("User-Agent", &self.user_agent);
        for (name, value) in &self.options.extra_headers {
            options = options.with_header(name, value);
        }
        options
            .with_timeout(self.options.timeout)
            .with_retry(RetryPolicy {
                retries: self.options.max_retries,
                min_timeout: self.options.min_timeout,
                max_timeout: self.options.timeout,
                factor: 2,
            })
    }
}

impl<B, T> Agent<B, T>
where
    B: EventBuffer<T> + 'static,
    T: Send + 'static,
{
    pub fn new(
        options: AgentOptions,
        http: HttpClient,
        buffer: B,
        serializer: impl BodySerializer<B> + 'static,
    ) -> Self {
        let user_agent = format!("{}/{}", options.name, env!("CARGO_PKG_VERSION"));
        Self {
            inner: Arc::new(AgentInner {
                options,
                http,
                serializer: Box::new(serializer),
                state: Mutex::new(AgentState {
                    buffer,
                    timer: None,
                }),
                in_flight: Mutex::new(Vec::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                shutdown: Notify::new(),
                disposed: AtomicBool::new(false),
                user_agent,
            }),
            _marker: PhantomData,
        }
    }

    /// Fold an event into the buffer. Never blocks and never touches
    /// the network on the caller's path.
    ///
    /// The first capture arms the interval timer. Reaching `max_size`
    /// schedules a flush on the next runtime turn.
    pub fn capture(&self, event: T) {
        Self::fold(&self.inner, event);
    }

    /// Track a pending event. Its resolved value folds into the buffer
    /// like [`capture`](Self::capture); a failure is logged and
    /// swallowed. `dispose` waits for all tracked events before the
    /// final flush.
    pub fn capture_future<F, E>(&self, future: F)
    where
        F: std::future::Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            match future.await {
                Ok(event) => Self::fold(&inner, event),
                Err(error) => inner.debug_log(&format!("Failed to capture event: {}", error)),
            }
        });

        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(handle);
    }

    /// Bypass batching: fold the event and flush right away.
    ///
    /// Unlike the periodic path, delivery failures are returned to the
    /// caller instead of being logged. `Ok(None)` means nothing was
    /// sent, which only happens for a disabled agent.
    pub async fn send_immediately(&self, event: T) -> Result<Option<HttpResponse>> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.buffer.add(event);
        }
        self.inner.debug_log("Sending report immediately");
        Self::flush(&self.inner, false).await
    }

    /// Shut down the agent: cancel the pending timer, wait for every
    /// tracked capture, then run one final best-effort flush.
    ///
    /// The timer cancellation is deterministic. A timer that fires
    /// after disposal begins never starts a flush, but a flush already
    /// in progress is left to finish its HTTP call.
    pub async fn dispose(&self) {
        self.inner.debug_log("Disposing");
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();

        let pending = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.timer.take()
        };
        if let Some(timer) = pending {
            timer.abort();
        }

        // Drain tracked captures. Loop because a capture may land
        // while we are waiting on an earlier one.
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut in_flight = self
                    .inner
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *in_flight)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }

        if let Err(error) = Self::flush(&self.inner, true).await {
            tracing::error!("Failed to send final report: {}", error);
        }
    }

    fn fold(inner: &Arc<AgentInner<B>>, event: T) {
        let (size, arm) = {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.buffer.add(event);
            (state.buffer.size(), state.timer.is_none())
        };

        if arm {
            Self::schedule(inner);
        }

        if size >= inner.options.max_size {
            inner.debug_log("Buffer is full");
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(error) = Self::flush(&inner, false).await {
                    tracing::error!("Failed to send report: {}", error);
                }
            });
        }
    }

    /// Arm the interval timer, replacing any pending one.
    fn schedule(inner: &Arc<AgentInner<B>>) {
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(task_inner.options.send_interval) => {
                    {
                        let mut state = task_inner
                            .state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        state.timer = None;
                    }
                    // Re-check: disposal may have started while we
                    // were asleep and missed the notification.
                    if task_inner.disposed.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Err(error) = Self::flush(&task_inner, false).await {
                        tracing::error!("Failed to send report: {}", error);
                    }
                }
                _ = task_inner.shutdown.notified() => {}
            }
        });

        let replaced = {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.timer.replace(handle)
        };
        if let Some(previous) = replaced {
            previous.abort();
        }
    }

    /// Serialize, clear and deliver the buffer.
    ///
    /// The timer is disarmed for the duration and rearmed once the
    /// flush settles, whatever the outcome, unless `skip_schedule` is
    /// set (the disposal path) or the agent is disposed. An empty
    /// buffer skips the network entirely. The buffer is cleared as
    /// soon as a body has been serialized: a batch that later fails
    /// delivery is gone.
    async fn flush(inner: &Arc<AgentInner<B>>, skip_schedule: bool) -> Result<Option<HttpResponse>> {
        let _guard = inner.flush_lock.lock().await;

        let pending = {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.timer.take()
        };
        if let Some(timer) = pending {
            timer.abort();
        }

        let serialized = {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.buffer.size() == 0 {
                None
            } else {
                let body = inner.serializer.serialize(&state.buffer);
                if body.is_ok() {
                    state.buffer.clear();
                }
                Some(body)
            }
        };

        let outcome = match serialized {
            None => Ok(None),
            Some(Err(error)) => Err(error),
            Some(Ok(body)) => {
                if inner.options.enabled {
                    Self::deliver(inner, body).await
                } else {
                    inner.debug_log("Sending report skipped, agent disabled");
                    Ok(None)
                }
            }
        };

        if !skip_schedule {
            Self::schedule(inner);
        }
        outcome
    }

    async fn deliver(inner: &Arc<AgentInner<B>>, body: Vec<u8>) -> Result<Option<HttpResponse>> {
        inner.debug_log(&format!("Sending report ({} bytes)", body.len()));

        let response = inner
            .http
            .post(&inner.options.endpoint, body, inner.request_options())
            .await?;

        if response.is_success() {
            inner.debug_log("Report sent");
            Ok(Some(response))
        } else {
            Err(AgentError::Rejected {
                status: response.status(),
                status_text: response.status_text().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::buffer::{VecEventBuffer, json_array_body};
    use crate::http::{HttpError, MockTransport};
    use std::time::Duration;

    fn options() -> AgentOptions {
        AgentOptions::new("https://registry.test/usage", "token")
    }

    fn test_agent(
        mock: Arc<MockTransport>,
        options: AgentOptions,
    ) -> Agent<VecEventBuffer<String>, String> {
        Agent::new(
            options,
            HttpClient::with_transport(mock),
            VecEventBuffer::new(),
            json_array_body::<String>,
        )
    }

    fn batch(mock: &MockTransport, index: usize) -> Vec<String> {
        let requests = mock.requests();
        serde_json::from_slice(requests[index].body.as_deref().unwrap_or_default()).unwrap()
    }

    // ==================== batching ====================

    #[tokio::test(start_paused = true)]
    async fn test_buffer_full_triggers_exactly_one_flush() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options().with_max_size(3));

        agent.capture("a".to_string());
        agent.capture("b".to_string());
        agent.capture("c".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(mock.request_count(), 1);
        assert_eq!(batch(&mock, 0), ["a", "b", "c"]);

        // The buffer was drained, so the next interval flush has
        // nothing to send.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush_sends_buffered_events() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options());

        agent.capture("a".to_string());
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(mock.request_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.request_count(), 1);
        assert_eq!(batch(&mock, 0), ["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_across_flush_boundary_land_in_next_batch() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options().with_max_size(2));

        agent.capture("a".to_string());
        agent.capture("b".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;

        agent.capture("c".to_string());
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(mock.request_count(), 2);
        assert_eq!(batch(&mock, 0), ["a", "b"]);
        assert_eq!(batch(&mock, 1), ["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_dropped_not_requeued() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue(HttpResponse::new(500, ""));
        let agent = test_agent(
            mock.clone(),
            options().with_max_retries(0).with_max_size(2),
        );

        agent.capture("a".to_string());
        agent.capture("b".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mock.request_count(), 1);

        agent.capture("c".to_string());
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(mock.request_count(), 2);
        assert_eq!(batch(&mock, 1), ["c"]);
    }

    // ==================== send_immediately ====================

    #[tokio::test(start_paused = true)]
    async fn test_send_immediately_bypasses_batching() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options());

        let response = agent.send_immediately("now".to_string()).await.unwrap();

        assert!(response.is_some());
        assert_eq!(mock.request_count(), 1);
        assert_eq!(batch(&mock, 0), ["now"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_immediately_propagates_rejection() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue(HttpResponse::new(401, ""));
        let agent = test_agent(mock.clone(), options());

        let result = agent.send_immediately("now".to_string()).await;

        match result {
            Err(AgentError::Rejected { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_immediately_propagates_exhausted_transport() {
        let mock = Arc::new(MockTransport::new());
        mock.enqueue_error(HttpError::Transport {
            message: "connection refused".to_string(),
        });
        mock.enqueue_error(HttpError::Transport {
            message: "connection refused".to_string(),
        });
        let agent = test_agent(mock.clone(), options().with_max_retries(1));

        let result = agent.send_immediately("now".to_string()).await;

        match result {
            Err(AgentError::Http(HttpError::Exhausted { attempts, .. })) => {
                assert_eq!(attempts, 2);
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    // ==================== headers ====================

    #[tokio::test(start_paused = true)]
    async fn test_report_request_carries_auth_and_user_agent() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(
            mock.clone(),
            options().with_header("x-usage-target", "staging"),
        );

        agent.send_immediately("e".to_string()).await.unwrap();

        let requests = mock.requests();
        assert_eq!(requests[0].url, "https://registry.test/usage");
        assert_eq!(requests[0].header("authorization"), Some("Bearer token"));
        assert_eq!(requests[0].header("content-type"), Some("application/json"));
        assert_eq!(requests[0].header("accept"), Some("application/json"));
        assert_eq!(
            requests[0].header("user-agent"),
            Some(concat!("hive-client/", env!("CARGO_PKG_VERSION")))
        );
        assert_eq!(requests[0].header("x-usage-target"), Some("staging"));
    }

    // ==================== dispose ====================

    #[tokio::test(start_paused = true)]
    async fn test_dispose_drains_pending_captures_into_final_report() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options());

        for name in ["a", "b", "c"] {
            let event = name.to_string();
            agent.capture_future(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, std::io::Error>(event)
            });
        }

        agent.dispose().await;

        assert_eq!(mock.request_count(), 1);
        let mut events = batch(&mock, 0);
        events.sort();
        assert_eq!(events, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_timer() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options());

        agent.capture("a".to_string());
        agent.dispose().await;
        assert_eq!(mock.request_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_captured_future_is_swallowed() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options());

        agent.capture_future(async {
            Err::<String, std::io::Error>(std::io::Error::other("boom"))
        });
        agent.dispose().await;

        assert_eq!(mock.request_count(), 0);
    }

    // ==================== disabled agent ====================

    #[tokio::test(start_paused = true)]
    async fn test_disabled_agent_buffers_and_clears_without_io() {
        let mock = Arc::new(MockTransport::new());
        let agent = test_agent(mock.clone(), options().disabled().with_max_size(2));

        agent.capture("a".to_string());
        agent.capture("b".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mock.request_count(), 0);

        // The flush cleared the buffer even without sending.
        agent.dispose().await;
        assert_eq!(mock.request_count(), 0);
    }

    // ==================== serializer failure ====================

    #[tokio::test(start_paused = true)]
    async fn test_serializer_failure_keeps_buffer_for_next_flush() {
        let fail = Arc::new(AtomicBool::new(true));
        let fail_flag = fail.clone();
        let serializer = move |buffer: &VecEventBuffer<String>| -> Result<Vec<u8>> {
            if fail_flag.load(Ordering::SeqCst) {
                return Err(AgentError::Serialize {
                    reason: "boom".to_string(),
                });
            }
            json_array_body(buffer)
        };

        let mock = Arc::new(MockTransport::new());
        let agent = Agent::new(
            options().with_max_size(2),
            HttpClient::with_transport(mock.clone()),
            VecEventBuffer::new(),
            serializer,
        );

        agent.capture("a".to_string());
        agent.capture("b".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mock.request_count(), 0);

        fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(mock.request_count(), 1);
        assert_eq!(batch(&mock, 0), ["a", "b"]);
    }
}
