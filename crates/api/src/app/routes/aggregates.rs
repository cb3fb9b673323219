use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use eventide_core::AggregateRef;
use eventide_domain::{AggregateKind, DomainCommand};
use eventide_events::AggregateEngine;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

fn resolve(
    aggregate_type: &str,
    aggregate_id: &str,
) -> Result<(AggregateRef, AggregateKind), axum::response::Response> {
    let aggregate_ref =
        AggregateRef::new(aggregate_type, aggregate_id).map_err(errors::domain_error_to_response)?;
    let kind = AggregateKind::of(&aggregate_ref).map_err(errors::domain_error_to_response)?;
    Ok((aggregate_ref, kind))
}

/// POST /aggregates/:aggregate_type/:aggregate_id/commands
pub async fn submit_command(
    Extension(services): Extension<Arc<AppServices>>,
    Path((aggregate_type, aggregate_id)): Path<(String, String)>,
    body: Result<Json<dto::SubmitCommandRequest>, JsonRejection>,
) -> axum::response::Response {
    let (aggregate_ref, kind) = match resolve(&aggregate_type, &aggregate_id) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };

    let command = match DomainCommand::from_json(kind, body.command) {
        Ok(command) => command,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let committed = match body.expected_version {
        Some(expected) => services.orchestrator.submit(&aggregate_ref, expected, command).await,
        None => services.orchestrator.execute(&aggregate_ref, command).await,
    };

    match committed {
        Ok(events) => (
            StatusCode::OK,
            Json(dto::CommandResponse::new(
                &aggregate_type,
                &aggregate_id,
                body.expected_version.unwrap_or_default(),
                &events,
            )),
        )
            .into_response(),
        Err(e) => errors::command_error_to_response(e),
    }
}

/// GET /aggregates/:aggregate_type/:aggregate_id
///
/// Folded from the event store, so it reflects every committed command.
pub async fn get_aggregate(
    Extension(services): Extension<Arc<AppServices>>,
    Path((aggregate_type, aggregate_id)): Path<(String, String)>,
) -> axum::response::Response {
    let (aggregate_ref, _) = match resolve(&aggregate_type, &aggregate_id) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };

    let current = match services.orchestrator.load_state(&aggregate_ref).await {
        Ok(current) => current,
        Err(e) => return errors::command_error_to_response(e),
    };
    if current.version == 0 {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{aggregate_ref} has no events"),
        );
    }

    Json(dto::AggregateStateResponse {
        aggregate_type,
        aggregate_id,
        version: current.version,
        state: current.state.view(),
    })
    .into_response()
}
