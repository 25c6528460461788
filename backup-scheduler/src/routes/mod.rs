pub mod health;
pub mod runs;
pub mod sets;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .nest("/runs", runs::router())
        .nest("/sets", sets::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
