//! Usage report assembly.
//!
//! Execution reports aggregate into the collector's wire shape: a
//! `map` of distinct operations keyed by their usage hash, and an
//! `operations` list with one sample per execution referencing the
//! map. Durations travel in nanoseconds, timestamps in epoch
//! milliseconds.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::agent::{AgentError, EventBuffer, Result};

use super::hash::NormalizedOperation;

/// Client identity attached to a sample, taken from request headers
/// such as `x-graphql-client-name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// One executed operation, as captured by the server integration.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub operation: NormalizedOperation,
    /// Epoch milliseconds at which execution started.
    pub timestamp: u64,
    pub duration: Duration,
    pub ok: bool,
    pub errors_total: u32,
    pub client: Option<ClientInfo>,
}

impl ExecutionReport {
    pub fn new(operation: NormalizedOperation, duration: Duration, ok: bool) -> Self {
        Self {
            operation,
            timestamp: now_millis(),
            duration,
            ok,
            errors_total: 0,
            client: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_errors(mut self, errors_total: u32) -> Self {
        self.errors_total = errors_total;
        self
    }

    pub fn with_client(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client = Some(ClientInfo {
            name: name.into(),
            version: version.into(),
        });
        self
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// A distinct operation in the report's `map` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMapRecord {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    pub fields: Vec<String>,
}

/// One execution sample in the report's `operations` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSample {
    pub operation_map_key: String,
    pub timestamp: u64,
    pub execution: Execution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SampleMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub ok: bool,
    /// Nanoseconds.
    pub duration: u64,
    pub errors_total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
}

/// Aggregating buffer for execution reports.
///
/// Two executions of the same operation share one map record; every
/// execution contributes its own sample. The flush threshold counts
/// samples, not distinct operations.
#[derive(Debug, Default)]
pub struct UsageBuffer {
    map: HashMap<String, OperationMapRecord>,
    operations: Vec<RequestSample>,
}

impl UsageBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBuffer<ExecutionReport> for UsageBuffer {
    fn add(&mut self, event: ExecutionReport) {
        let ExecutionReport {
            operation,
            timestamp,
            duration,
            ok,
            errors_total,
            client,
        } = event;

        self.map
            .entry(operation.hash.clone())
            .or_insert_with(|| OperationMapRecord {
                operation: operation.body,
                operation_name: operation.name,
                fields: operation.coordinates,
            });

        self.operations.push(RequestSample {
            operation_map_key: operation.hash,
            timestamp,
            execution: Execution {
                ok,
                duration: duration.as_nanos() as u64,
                errors_total,
            },
            metadata: client.map(|client| SampleMetadata {
                client: Some(client),
            }),
        });
    }

    fn size(&self) -> usize {
        self.operations.len()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.operations.clear();
    }
}

/// Serialize a [`UsageBuffer`] into the collector's report body.
pub fn usage_report_body(buffer: &UsageBuffer) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Report<'a> {
        size: usize,
        map: &'a HashMap<String, OperationMapRecord>,
        operations: &'a [RequestSample],
    }

    serde_json::to_vec(&Report {
        size: buffer.operations.len(),
        map: &buffer.map,
        operations: &buffer.operations,
    })
    .map_err(|error| AgentError::Serialize {
        reason: error.to_string(),
    })
}
