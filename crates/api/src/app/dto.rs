use std::sync::Arc;

use serde::{Deserialize, Serialize};

use eventide_events::Event;

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /aggregates/:type/:id/commands`.
///
/// With `expected_version` the command is submitted strictly; without it the
/// server executes against the current version and retries conflicts.
#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    pub expected_version: Option<u64>,
    pub command: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub pattern: Option<String>,
    pub since: Option<u64>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct EventDto {
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub local_sequence: u64,
    pub global_sequence: u64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub recorded_at: String,
}

impl From<&Event> for EventDto {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id.to_string(),
            aggregate_type: event.aggregate_ref.aggregate_type().to_string(),
            aggregate_id: event.aggregate_ref.aggregate_id().to_string(),
            local_sequence: event.local_sequence,
            global_sequence: event.global_sequence,
            event_type: event.event_type.clone(),
            payload: event.payload_json(),
            metadata: serde_json::to_value(&event.metadata).unwrap_or_default(),
            recorded_at: event.recorded_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: u64,
    pub events: Vec<EventDto>,
}

impl CommandResponse {
    /// `version` is the version before the command when nothing was committed.
    pub fn new(aggregate_type: &str, aggregate_id: &str, version: u64, events: &[Arc<Event>]) -> Self {
        Self {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            version: events.last().map(|e| e.local_sequence).unwrap_or(version),
            events: events.iter().map(|e| EventDto::from(e.as_ref())).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AggregateStateResponse {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: u64,
    pub state: serde_json::Value,
}
