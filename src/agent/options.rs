//! Configuration for the telemetry agent.

use std::time::Duration;

use secrecy::SecretString;

/// Configuration for a telemetry [`Agent`](super::Agent).
///
/// The defaults match the registry collector's expectations: reports
/// are flushed every 10 seconds or as soon as 25 events are buffered,
/// and a failed POST is retried up to 5 times with exponential
/// backoff starting at 200ms.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// When false the agent buffers and clears but never talks to the
    /// network. Useful for local development.
    pub enabled: bool,
    /// Collector endpoint receiving report POSTs.
    pub endpoint: String,
    /// Registry access token, sent as a bearer token.
    pub token: SecretString,
    /// Agent name, used as the user-agent prefix and the log scope.
    pub name: String,
    /// Retries after a failed POST.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on every attempt.
    pub min_timeout: Duration,
    /// Interval between periodic flushes.
    pub send_interval: Duration,
    /// Buffer size that triggers a flush ahead of the interval.
    pub max_size: usize,
    /// Per-attempt request timeout, also the backoff ceiling.
    pub timeout: Duration,
    /// Promote the agent's own debug logging to info level.
    pub debug: bool,
    /// Extra headers attached to every report POST.
    pub extra_headers: Vec<(String, String)>,
}

impl AgentOptions {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            enabled: true,
            endpoint: endpoint.into(),
            token: SecretString::from(token.into()),
            name: "hive-client".to_string(),
            max_retries: 5,
            min_timeout: Duration::from_millis(200),
            send_interval: Duration::from_secs(10),
            max_size: 25,
            timeout: Duration::from_secs(30),
            debug: false,
            extra_headers: Vec::new(),
        }
    }

    /// Keep buffering but never send.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self
    }

    pub fn with_send_interval(mut self, send_interval: Duration) -> Self {
        self.send_interval = send_interval;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}
