use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use eventide_core::AggregateRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form string metadata carried with every event (correlation ids, actors, ...).
pub type Metadata = BTreeMap<String, String>;

/// A committed event.
///
/// Events are:
/// - **immutable** (treat them as facts; never updated or deleted)
/// - **ordered twice**: `local_sequence` within the aggregate (1..N, no gaps),
///   `global_sequence` across the whole store (strictly increasing, never reused)
/// - **opaque** to the runtime: `payload` is interpreted only by the aggregate engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub aggregate_ref: AggregateRef,
    pub local_sequence: u64,
    pub global_sequence: u64,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: Metadata,
    pub recorded_at: DateTime<Utc>,
}

impl Event {
    /// Assign sequences to a decided event. Only event stores call this, inside
    /// their commit.
    pub fn commit(
        aggregate_ref: AggregateRef,
        local_sequence: u64,
        global_sequence: u64,
        new_event: NewEvent,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_ref,
            local_sequence,
            global_sequence,
            event_type: new_event.event_type,
            payload: new_event.payload,
            metadata: new_event.metadata,
            recorded_at,
        }
    }

    /// Payload decoded as JSON, falling back to a string for non-JSON payloads.
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.payload).into_owned())
        })
    }
}

/// An event decided by an aggregate engine but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: Metadata::new(),
        }
    }
}
