//! Client runtime for GraphQL schema registries.
//!
//! Three building blocks, composable but independent:
//! - [`agent`]: a batching telemetry agent that buffers events and
//!   ships them to a collector with retry and bounded batches
//! - [`usage`]: operation canonicalization, usage hashing and report
//!   assembly on top of the agent
//! - [`cdn`]: resilient fetchers for registry artifacts with ETag
//!   revalidation, negative caching and request coalescing
//!
//! The [`http`] module carries the shared plumbing: a retrying client
//! over a swappable [`http::HttpTransport`], so every component can
//! be driven against scripted responses in tests.

pub mod agent;
pub mod cdn;
pub mod http;
pub mod usage;

pub use agent::{Agent, AgentOptions};
pub use cdn::{
    CdnOptions, PersistedDocumentsFetcher, SchemaFetcher, ServicesFetcher, SupergraphFetcher,
};
pub use http::HttpClient;
pub use usage::{
    ExecutionReport, UsageAgent, compute_usage_hash, normalize_operation, usage_agent,
};
