use crate::{
    AppState,
    handlers::{
        health_check_handler,
        review::submit_review_handler,
        sync::{pull_handler, push_handler},
    },
};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/healthcheck", get(health_check_handler))
        // Sync
        .route("/api/sync/push", post(push_handler))
        .route("/api/sync/pull", get(pull_handler))
        // Review
        .route(
            "/api/decks/:deck_id/study/:card_id",
            post(submit_review_handler),
        )
        .with_state(app_state)
}
