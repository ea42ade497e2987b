use crate::{
    AppState,
    handlers::{error_to_response, require_user},
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use kioku::{
    api::review::submit_review,
    schema::{ErrorResponse, review::RatingSubmission},
};
use std::sync::Arc;
use uuid::Uuid;

pub async fn submit_review_handler(
    State(data): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((deck_id, card_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<RatingSubmission>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let user_id = require_user(&headers)?;
    let card = submit_review(&data.db, user_id, deck_id, card_id, body, Utc::now())
        .await
        .map_err(error_to_response)?;
    Ok(Json(card))
}
