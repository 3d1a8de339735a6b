//! Resilient fetching of registry artifacts from the CDN.
//!
//! Two access patterns, both tolerant of an unreliable network:
//! - Artifact fetchers ([`SupergraphFetcher`], [`SchemaFetcher`],
//!   [`ServicesFetcher`]) revalidate with ETags and serve cached
//!   artifacts on 304
//! - [`PersistedDocumentsFetcher`] resolves immutable persisted
//!   documents, caching hits and misses and coalescing concurrent
//!   lookups into one request

mod artifact;
mod error;
mod persisted;

pub use artifact::{
    CdnOptions, SchemaArtifact, SchemaFetcher, ServiceDefinition, ServicesFetcher,
    SupergraphArtifact, SupergraphFetcher,
};
pub use error::{CdnError, Result};
pub use persisted::PersistedDocumentsFetcher;
