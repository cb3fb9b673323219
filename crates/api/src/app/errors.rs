use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use eventide_core::DomainError;
use eventide_infra::cache::CacheError;
use eventide_infra::event_store::StoreError;
use eventide_infra::CommandError;

pub fn command_error_to_response(err: CommandError) -> axum::response::Response {
    match err {
        CommandError::Rejected(reason) => domain_error_to_response(reason),
        CommandError::VersionConflict {
            expected, actual, ..
        } => {
            let mut response = json_error(
                StatusCode::CONFLICT,
                "version_conflict",
                format!("expected version {expected}, actual {actual}"),
            );
            response
                .headers_mut()
                .insert("x-current-version", actual.into());
            response
        }
        CommandError::Corrupted { .. } => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "stream_corrupted",
            err.to_string(),
        ),
        CommandError::Storage(e) => store_error_to_response(e),
        CommandError::Engine(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "engine_error",
            e.to_string(),
        ),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::UnknownAggregateType(t) => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_aggregate_type",
            format!("unknown aggregate type {t:?}"),
        ),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::InvalidTransition(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition", msg)
        }
        DomainError::NotFound(msg) => json_error(StatusCode::UNPROCESSABLE_ENTITY, "not_found", msg),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Timeout { .. } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_timeout",
            err.to_string(),
        ),
        StoreError::VersionConflict { .. } => {
            json_error(StatusCode::CONFLICT, "version_conflict", err.to_string())
        }
        StoreError::Backend(_) | StoreError::Corrupted { .. } => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        ),
    }
}

pub fn cache_error_to_response(err: CacheError) -> axum::response::Response {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "cache_compute_failed", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
