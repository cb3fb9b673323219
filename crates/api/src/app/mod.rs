//! HTTP application: router plus the services behind it.
//!
//! - `services.rs`: runtime wiring (store, bus, relay, orchestrator, streams, cache)
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: error → response mapping

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices};

/// Build the full HTTP router around already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
