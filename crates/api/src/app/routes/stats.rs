use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use eventide_domain::AggregateKind;
use eventide_infra::cache::CacheKey;
use eventide_infra::projections::type_stats_from_log;

use crate::app::errors;
use crate::app::services::AppServices;

/// Events read per page while computing statistics.
const STATS_PAGE_SIZE: usize = 1000;

/// GET /stats/:aggregate_type
///
/// Cached until an event of that type is committed (or the entry expires).
pub async fn get_type_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(aggregate_type): Path<String>,
) -> axum::response::Response {
    let Some(kind) = AggregateKind::from_type(&aggregate_type) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "unknown_aggregate_type",
            format!("unknown aggregate type {aggregate_type:?}"),
        );
    };

    let key = CacheKey::new(format!("stats:{}", kind.aggregate_type())).depends_on(kind.aggregate_type());
    let store = Arc::clone(&services.store);
    let stats = services
        .stats_cache
        .get_or_compute(&key, None, || async move {
            type_stats_from_log(&store, kind.aggregate_type(), STATS_PAGE_SIZE).await
        })
        .await;

    match stats {
        Ok(stats) => Json(serde_json::json!({
            "aggregate_type": kind.aggregate_type(),
            "aggregate_count": stats.aggregate_count,
            "event_count": stats.event_count,
            "last_global_sequence": stats.last_global_sequence,
            "cache": services.stats_cache.stats(),
        }))
        .into_response(),
        Err(e) => errors::cache_error_to_response(e),
    }
}
