use axum::Router;

use crate::state::SharedState;

/// Admin management endpoints.
pub mod admin;
/// Swagger UI and OpenAPI document.
pub mod docs;
/// Liveness endpoint.
pub mod health;
/// Scan upload and status endpoints.
pub mod scans;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(scans::router(state.clone()))
        .merge(admin::router(state.clone()));

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
