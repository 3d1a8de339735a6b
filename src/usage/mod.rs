//! GraphQL operation canonicalization and usage reporting.
//!
//! Executed operations are canonicalized so textual variations of the
//! same query collapse into one identity: literals hidden, aliases
//! removed, everything sorted, whitespace stripped. The canonical body
//! plus the schema coordinates it touches produce a stable usage hash,
//! and execution samples aggregate under that hash into the report the
//! collector ingests.

mod hash;
mod normalize;
mod report;

pub use hash::{NormalizedOperation, OperationKind, compute_usage_hash};
pub use normalize::{NormalizeOptions, normalize_operation};
pub use report::{
    ClientInfo, Execution, ExecutionReport, OperationMapRecord, RequestSample, SampleMetadata,
    UsageBuffer, usage_report_body,
};

use crate::agent::{Agent, AgentOptions};
use crate::http::HttpClient;

/// Agent type shipping usage reports.
pub type UsageAgent = Agent<UsageBuffer, ExecutionReport>;

/// Build a usage-reporting agent: execution reports fold into a
/// [`UsageBuffer`] and leave as the collector's aggregated report body.
pub fn usage_agent(options: AgentOptions, http: HttpClient) -> UsageAgent {
    Agent::new(options, http, UsageBuffer::new(), usage_report_body)
}
