use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::SharedState;

/// `/daemon/status`.
pub mod daemon;
/// Swagger UI and the OpenAPI document.
pub mod docs;
/// `/healthcheck`.
pub mod health;
/// Collaborator hooks under `/games`.
pub mod schedule;
/// `/deliveries/stream`.
pub mod sse;

/// Compose all route trees and bind the shared state.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(schedule::router())
        .merge(daemon::router())
        .merge(sse::router())
        .merge(docs::router());

    api_router.with_state(state)
}

/// Top-level router with the cross-cutting middleware layers attached.
pub fn app(state: SharedState) -> Router<()> {
    router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
