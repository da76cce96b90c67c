use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::handlers;
use crate::ServientContext;

/// Builds the servient router with shared state and request tracing.
pub fn router(context: Arc<ServientContext>) -> Router {
    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/api/events", get(handlers::events))
        .route(
            "/api/plc/{property}",
            get(handlers::read_property).put(handlers::write_property),
        )
        .route("/api/plc", post(handlers::invoke_form))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}
