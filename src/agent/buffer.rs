//! Buffering collaborators for the telemetry agent.
//!
//! The agent itself never inspects events. It folds them into an
//! [`EventBuffer`], asks a [`BodySerializer`] to turn the buffer into
//! a wire body, and clears the buffer once the body has been taken.
//! The buffer decides the storage shape: a plain list, or an
//! aggregation keyed by operation hash.

use super::error::{AgentError, Result};

/// Event store owned by an agent.
pub trait EventBuffer<T>: Send {
    /// Fold one event into the buffer.
    fn add(&mut self, event: T);

    /// Number of buffered events, counted for the flush threshold.
    fn size(&self) -> usize;

    /// Drop all buffered events.
    fn clear(&mut self);
}

/// Turns buffered events into a report body.
pub trait BodySerializer<B>: Send + Sync {
    fn serialize(&self, buffer: &B) -> Result<Vec<u8>>;
}

impl<B, F> BodySerializer<B> for F
where
    F: Fn(&B) -> Result<Vec<u8>> + Send + Sync,
{
    fn serialize(&self, buffer: &B) -> Result<Vec<u8>> {
        self(buffer)
    }
}

/// Plain list buffer for agents without aggregation needs.
#[derive(Debug)]
pub struct VecEventBuffer<T> {
    events: Vec<T>,
}

impl<T> VecEventBuffer<T> {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Buffered events, oldest first.
    pub fn events(&self) -> &[T] {
        &self.events
    }
}

impl<T> Default for VecEventBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> EventBuffer<T> for VecEventBuffer<T> {
    fn add(&mut self, event: T) {
        self.events.push(event);
    }

    fn size(&self) -> usize {
        self.events.len()
    }

    fn clear(&mut self) {
        self.events.clear();
    }
}

/// Serialize a [`VecEventBuffer`] of serde values as a JSON array.
pub fn json_array_body<T: serde::Serialize>(buffer: &VecEventBuffer<T>) -> Result<Vec<u8>> {
    serde_json::to_vec(buffer.events()).map_err(|error| AgentError::Serialize {
        reason: error.to_string(),
    })
}
