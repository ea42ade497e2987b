use crate::{
    AppState,
    handlers::{error_to_response, require_user},
};
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use kioku::{
    api::sync::{apply_push, pull_changes},
    schema::{
        ErrorResponse,
        sync::{PullQuery, PushRequest},
    },
};
use std::sync::Arc;

pub async fn push_handler(
    State(data): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PushRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let user_id = require_user(&headers)?;
    let response = apply_push(&data.db, user_id, &body, Utc::now())
        .await
        .map_err(error_to_response)?;
    Ok(Json(response))
}

pub async fn pull_handler(
    State(data): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PullQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let user_id = require_user(&headers)?;
    let response = pull_changes(
        &data.db,
        user_id,
        query.last_sync_version,
        data.tuning.pull_page_size,
    )
    .await
    .map_err(error_to_response)?;
    Ok(Json(response))
}
