use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{AccountId, ChannelKey};
use crate::models::{ChannelKind, Message};

// -- Identity provider tokens --

/// Claims issued by the external identity provider. Shared by the REST
/// middleware and the gateway socket handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: AccountId,
    pub username: String,
    pub exp: usize,
}

// -- Provisioning --

/// Account lifecycle events pushed by the identity provider.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProvisioningEvent {
    #[serde(rename = "account.created")]
    AccountCreated { id: AccountId, username: String },
    #[serde(rename = "account.updated")]
    AccountUpdated { id: AccountId, username: String },
    #[serde(rename = "account.deleted")]
    AccountDeleted { id: AccountId },
}

// -- Friends --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FriendRequestBody {
    pub username: String,
}

/// An account id with its current username, as listed in friend and
/// member lists.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountEntry {
    pub id: AccountId,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub sent: Vec<AccountEntry>,
    pub received: Vec<AccountEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub channel_key: ChannelKey,
}

// -- Channels --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<AccountId>,
    #[serde(default)]
    pub admin_ids: Vec<AccountId>,
    #[serde(default = "default_capture")]
    pub capture_history: bool,
}

fn default_capture() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub channel_key: ChannelKey,
    pub kind: ChannelKind,
    pub name: Option<String>,
    pub owner_id: Option<AccountId>,
    pub member_ids: Vec<AccountId>,
    pub admin_ids: Vec<AccountId>,
    pub capture_history: bool,
    pub has_exchanged_message: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddMemberRequest {
    pub member_id: AccountId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveMemberResponse {
    pub channel_key: ChannelKey,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromoteAdminRequest {
    pub account_id: AccountId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetCaptureRequest {
    pub enabled: bool,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    /// Dedup token. Clients retrying a send must reuse the same id.
    pub id: Option<Uuid>,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: Message,
    pub persisted: bool,
}
