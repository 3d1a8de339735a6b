//! Error types for the telemetry agent.

use crate::http::HttpError;

/// Errors that can occur while buffering or delivering reports.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The buffer could not be serialized into a report body.
    #[error("Report serialization failed: {reason}")]
    Serialize { reason: String },

    /// The collector answered with a non-success status.
    #[error("Collector rejected the report: {status} {status_text}")]
    Rejected { status: u16, status_text: String },

    /// The report never reached the collector.
    #[error("Report delivery failed: {0}")]
    Http(#[from] HttpError),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
