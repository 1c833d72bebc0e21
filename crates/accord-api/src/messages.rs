use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use accord_core::Delivery;
use accord_types::ChannelKey;
use accord_types::api::{Claims, SendMessageRequest, SendMessageResponse};
use accord_types::models::Message;

use crate::AppState;
use crate::error::ApiError;

pub async fn get_messages(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.engine.message_history(&claims.sub, &key).await?;
    Ok(Json(messages))
}

/// Clients retrying a send pass the same `id` so the append happens once.
pub async fn send_message(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = Message {
        id: req.id.unwrap_or_else(Uuid::new_v4),
        author_id: claims.sub,
        body: req.body,
        timestamp: chrono::Utc::now(),
    };

    let delivery = state.engine.write_message(&key, message.clone()).await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message,
            persisted: delivery == Delivery::Persisted,
        }),
    ))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((key, message_id)): Path<(ChannelKey, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .delete_message(&claims.sub, &key, message_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
