use axum::{
    routing::{get, post},
    Router,
};

pub mod aggregates;
pub mod event_stream;
pub mod stats;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/aggregates/:aggregate_type/:aggregate_id", get(aggregates::get_aggregate))
        .route(
            "/aggregates/:aggregate_type/:aggregate_id/commands",
            post(aggregates::submit_command),
        )
        .route("/stream", get(event_stream::stream_events))
        .route("/stats/:aggregate_type", get(stats::get_type_stats))
}
