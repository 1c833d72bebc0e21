use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use accord_core::NewChannel;
use accord_types::api::{
    AddMemberRequest, ChannelResponse, Claims, CreateChannelRequest, PromoteAdminRequest,
    RemoveMemberResponse, SetCaptureRequest,
};
use accord_types::models::Channel;
use accord_types::{AccountId, ChannelKey};

use crate::AppState;
use crate::error::ApiError;
use crate::friends::entries;

fn channel_response(channel: Channel) -> ChannelResponse {
    ChannelResponse {
        channel_key: channel.key,
        kind: channel.kind,
        name: channel.name,
        owner_id: channel.owner_id,
        member_ids: channel.member_ids.into_iter().collect(),
        admin_ids: channel.admin_ids.into_iter().collect(),
        capture_history: channel.capture_history,
        has_exchanged_message: channel.has_exchanged_message,
    }
}

pub async fn list_channels(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let channels = state.engine.channels_for(&claims.sub).await?;
    let body: Vec<ChannelResponse> = channels.into_iter().map(channel_response).collect();
    Ok(Json(body))
}

/// The caller becomes the owner.
pub async fn create_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state
        .engine
        .create_named_channel(NewChannel {
            name: req.name,
            owner_id: claims.sub,
            member_ids: req.member_ids,
            admin_ids: req.admin_ids,
            capture_history: req.capture_history,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(channel_response(channel))))
}

pub async fn get_channel(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state.engine.channel(&claims.sub, &key).await?;
    Ok(Json(channel_response(channel)))
}

pub async fn list_members(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let members = state.engine.members(&claims.sub, &key).await?;
    Ok(Json(entries(members)))
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let added = state
        .engine
        .add_member(&claims.sub, &key, &req.member_id)
        .await?;
    Ok(if added { StatusCode::CREATED } else { StatusCode::OK })
}

/// Membership is part of the key, so the response carries the new one.
pub async fn remove_member(
    State(state): State<AppState>,
    Path((key, member_id)): Path<(ChannelKey, AccountId)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let channel_key = state
        .engine
        .remove_member(&claims.sub, &key, &member_id)
        .await?;
    Ok(Json(RemoveMemberResponse { channel_key }))
}

pub async fn promote_admin(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PromoteAdminRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let promoted = state
        .engine
        .promote_admin(&claims.sub, &key, &req.account_id)
        .await?;
    Ok(if promoted { StatusCode::CREATED } else { StatusCode::OK })
}

pub async fn relinquish_admin(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.relinquish_admin(&claims.sub, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_capture(
    State(state): State<AppState>,
    Path(key): Path<ChannelKey>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetCaptureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .set_capture_history(&claims.sub, &key, req.enabled)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
