//! REST surface of the social-graph engine.

pub mod accounts;
pub mod channels;
pub mod error;
pub mod friends;
pub mod messages;
pub mod middleware;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use accord_core::Engine;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: Engine,
    pub jwt_secret: String,
    /// Provisioning is disabled when unset.
    pub webhook_secret: Option<String>,
}

/// Every HTTP route except the gateway upgrade, which the server owns.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/webhooks/accounts", post(accounts::provisioning_webhook))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/me/snapshot", get(friends::snapshot))
        .route("/friends", get(friends::list_friends))
        .route("/friends/pending", get(friends::pending_requests))
        .route("/friends/requests", post(friends::send_request))
        .route("/friends/requests/{requester_id}/accept", post(friends::accept_request))
        .route("/friends/requests/{requester_id}/decline", post(friends::decline_request))
        .route("/friends/{friend_id}", delete(friends::remove_friend))
        .route("/channels", get(channels::list_channels).post(channels::create_channel))
        .route("/channels/{key}", get(channels::get_channel))
        .route("/channels/{key}/members", get(channels::list_members).post(channels::add_member))
        .route("/channels/{key}/members/{member_id}", delete(channels::remove_member))
        .route("/channels/{key}/admins", post(channels::promote_admin))
        .route("/channels/{key}/admins/me", delete(channels::relinquish_admin))
        .route("/channels/{key}/capture", put(channels::set_capture))
        .route("/channels/{key}/messages", get(messages::get_messages).post(messages::send_message))
        .route("/channels/{key}/messages/{message_id}", delete(messages::delete_message))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}
