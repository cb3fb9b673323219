//! The aggregate engine boundary.
//!
//! The runtime (store, orchestrator) is agnostic of concrete aggregate types:
//! it only sees opaque [`Event`] payloads and a value implementing
//! [`AggregateEngine`]. Engines are pure: no IO, no clocks, no randomness.

use eventide_core::{AggregateRef, DomainError};
use thiserror::Error;

use crate::{Event, NewEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The command was rejected by domain rules.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A stored payload could not be decoded for this aggregate.
    #[error("cannot decode {event_type} (global #{global_sequence}) for {aggregate_ref}: {reason}")]
    Decode {
        aggregate_ref: AggregateRef,
        event_type: String,
        global_sequence: u64,
        reason: String,
    },

    /// An event or snapshot could not be encoded.
    #[error("cannot encode {what}: {reason}")]
    Encode { what: String, reason: String },

    /// A snapshot blob could not be restored.
    #[error("cannot restore snapshot of {aggregate_ref}: {reason}")]
    Snapshot {
        aggregate_ref: AggregateRef,
        reason: String,
    },

    /// History was not contiguous in local-sequence order.
    #[error("out-of-order history for {aggregate_ref}: expected local #{expected}, found #{found}")]
    OutOfOrder {
        aggregate_ref: AggregateRef,
        expected: u64,
        found: u64,
    },
}

/// Pure aggregate state machine over opaque, committed events.
pub trait AggregateEngine: Clone + core::fmt::Debug + Send + Sync + Sized + 'static {
    type Command: Clone + core::fmt::Debug + Send + Sync + 'static;

    /// Empty state for an aggregate that has no events yet.
    ///
    /// Fails with a validation error when the aggregate type is unknown.
    fn initial(aggregate_ref: &AggregateRef) -> Result<Self, DomainError>;

    /// Fold one committed event into the state.
    fn apply(&mut self, event: &Event) -> Result<(), EngineError>;

    /// Decide which events to emit for `command`; must not mutate state.
    fn decide(&self, command: &Self::Command) -> Result<Vec<NewEvent>, EngineError>;

    /// Serialize the state for a snapshot.
    fn snapshot(&self) -> Result<Vec<u8>, EngineError>;

    /// Rebuild state from a snapshot blob produced by [`AggregateEngine::snapshot`].
    fn restore(aggregate_ref: &AggregateRef, blob: &[u8]) -> Result<Self, EngineError>;

    /// JSON view of the state for read endpoints.
    fn view(&self) -> serde_json::Value;
}

/// Engine state together with the local sequence it has been folded up to.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<E> {
    pub aggregate_ref: AggregateRef,
    pub state: E,
    pub version: u64,
}

impl<E: AggregateEngine> Versioned<E> {
    /// Empty state at version 0.
    pub fn initial(aggregate_ref: AggregateRef) -> Result<Self, EngineError> {
        let state = E::initial(&aggregate_ref)?;
        Ok(Self {
            aggregate_ref,
            state,
            version: 0,
        })
    }

    pub fn at(aggregate_ref: AggregateRef, state: E, version: u64) -> Self {
        Self {
            aggregate_ref,
            state,
            version,
        }
    }

    /// Apply events that must continue exactly at `version + 1`.
    pub fn fold<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Result<(), EngineError> {
        for event in events {
            let expected = self.version + 1;
            if event.aggregate_ref != self.aggregate_ref || event.local_sequence != expected {
                return Err(EngineError::OutOfOrder {
                    aggregate_ref: self.aggregate_ref.clone(),
                    expected,
                    found: event.local_sequence,
                });
            }
            self.state.apply(event)?;
            self.version = expected;
        }
        Ok(())
    }
}
