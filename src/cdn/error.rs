//! Error types for CDN artifact fetching.

use crate::http::HttpError;

/// Errors that can occur while fetching registry artifacts.
///
/// Cloneable so a single failure can be fanned out to every caller
/// awaiting a shared in-flight fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CdnError {
    /// The CDN answered 304 Not Modified but nothing is cached. A 304
    /// is only valid against an `If-None-Match` we sent, so this is a
    /// protocol violation on the CDN side.
    #[error("CDN answered 304 Not Modified but no artifact is cached for {endpoint}")]
    MissingCacheEntry { endpoint: String },

    /// A terminal status outside the expected set for the endpoint.
    #[error("Unexpected CDN response for {endpoint}: {status} {status_text}")]
    UnexpectedStatus {
        endpoint: String,
        status: u16,
        status_text: String,
    },

    /// The schema endpoint answered with an empty services list.
    #[error("CDN returned an empty services list")]
    EmptyServicesList,

    /// Transport-level failure, including exhausted retries.
    #[error("CDN request failed: {0}")]
    Http(#[from] HttpError),
}

/// Result type for CDN operations.
pub type Result<T> = std::result::Result<T, CdnError>;
