use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use accord_core::Named;
use accord_types::AccountId;
use accord_types::api::{AcceptResponse, AccountEntry, Claims, FriendRequestBody, PendingResponse};

use crate::AppState;
use crate::error::ApiError;

pub(crate) fn entries(named: Vec<Named>) -> Vec<AccountEntry> {
    named
        .into_iter()
        .map(|(id, username)| AccountEntry { id, username })
        .collect()
}

pub async fn list_friends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.engine.friend_list(&claims.sub).await?;
    Ok(Json(entries(friends)))
}

pub async fn pending_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (sent, received) = state.engine.pending_requests(&claims.sub).await?;
    Ok(Json(PendingResponse {
        sent: entries(sent),
        received: entries(received),
    }))
}

pub async fn send_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<FriendRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state
        .engine
        .send_friend_request(&claims.sub, &req.username)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AccountEntry {
            id: target,
            username: req.username,
        }),
    ))
}

pub async fn accept_request(
    State(state): State<AppState>,
    Path(requester_id): Path<AccountId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let channel_key = state
        .engine
        .accept_friend_request(&claims.sub, &requester_id)
        .await?;
    Ok(Json(AcceptResponse { channel_key }))
}

pub async fn decline_request(
    State(state): State<AppState>,
    Path(requester_id): Path<AccountId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .decline_friend_request(&claims.sub, &requester_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_friend(
    State(state): State<AppState>,
    Path(friend_id): Path<AccountId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.remove_friend(&claims.sub, &friend_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Authoritative state for polling clients.
pub async fn snapshot(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.account_snapshot(&claims.sub).await?))
}
