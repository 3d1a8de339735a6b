//! Generic telemetry delivery agent.
//!
//! The agent buffers events and ships them to a collector in batches:
//! - Events fold into an [`EventBuffer`] without blocking the caller
//! - A single timer flushes the buffer on an interval
//! - A full buffer flushes ahead of schedule
//! - Delivery uses bearer auth with exponential-backoff retry
//! - Disposal drains pending captures and sends one final report

mod agent;
mod buffer;
mod error;
mod options;

pub use agent::Agent;
pub use buffer::{BodySerializer, EventBuffer, VecEventBuffer, json_array_body};
pub use error::{AgentError, Result};
pub use options::AgentOptions;
