//! Server-Sent Events stream of committed events.
//!
//! Frames:
//! - `snapshot`: current directory state for the pattern (only without a resume token)
//! - `event`: one committed event; SSE `id` is its global sequence
//! - `heartbeat`: sent when nothing else was sent for the heartbeat interval
//! - `reconnect`: final frame; reconnect with its `id` as `Last-Event-ID`

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse,
    },
};
use futures::StreamExt;
use serde::Serialize;

use eventide_events::SubscriptionPattern;
use eventide_infra::stream::{StreamFrame, StreamRequest};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// GET /stream?pattern=..&since=..
///
/// `Last-Event-ID` takes precedence over `since`.
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Query(query): Query<dto::StreamQuery>,
) -> axum::response::Response {
    let pattern = match query.pattern.as_deref() {
        Some(raw) => match SubscriptionPattern::parse(raw) {
            Ok(pattern) => pattern,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_pattern", e.to_string()),
        },
        None => SubscriptionPattern::all(),
    };

    let last_event_id = match headers.get("last-event-id") {
        Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(id) => Some(id),
            None => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_last_event_id",
                    "Last-Event-ID must be a global sequence number",
                );
            }
        },
        None => None,
    };

    let request = StreamRequest {
        pattern,
        resume_from: last_event_id.or(query.since),
    };
    let session = match services.streams.open(request).await {
        Ok(session) => session,
        Err(e) => return errors::store_error_to_response(e),
    };

    let frames = session
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(to_sse(frame)));
    Sse::new(frames).into_response()
}

fn to_sse(frame: StreamFrame) -> SseEvent {
    match frame {
        StreamFrame::Snapshot { id, body } => json_event("snapshot", Some(id), &body),
        StreamFrame::Event { id, event } => {
            json_event("event", Some(id), &dto::EventDto::from(event.as_ref()))
        }
        StreamFrame::Heartbeat => SseEvent::default().event("heartbeat").data("{}"),
        StreamFrame::Reconnect {
            last_event_id,
            reason,
        } => json_event(
            "reconnect",
            Some(last_event_id),
            &serde_json::json!({
                "last_event_id": last_event_id,
                "reason": reason,
            }),
        ),
    }
}

fn json_event(kind: &'static str, id: Option<u64>, body: &impl Serialize) -> SseEvent {
    let data = serde_json::to_string(body).unwrap_or_else(|_| "null".to_string());
    let event = SseEvent::default().event(kind).data(data);
    match id {
        Some(id) => event.id(id.to_string()),
        None => event,
    }
}
