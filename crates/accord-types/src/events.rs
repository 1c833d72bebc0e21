use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{AccountId, ChannelKey};
use crate::models::{AccountSnapshot, Message};

/// Domain events carried on the shared relay topic.
///
/// Every event names the accounts it concerns so subscribers can be filtered
/// server-side instead of each client sifting the whole stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    FriendRequestSent {
        from: AccountId,
        from_username: String,
        to: AccountId,
    },

    FriendRequestAccepted {
        requester: AccountId,
        accepter: AccountId,
        channel_key: ChannelKey,
    },

    FriendRequestDeclined {
        requester: AccountId,
        decliner: AccountId,
    },

    FriendRemoved {
        account_id: AccountId,
        friend_id: AccountId,
    },

    TextChannelCreated {
        channel_key: ChannelKey,
        name: String,
        owner_id: AccountId,
        member_ids: Vec<AccountId>,
    },

    MemberAdded {
        channel_key: ChannelKey,
        member_id: AccountId,
        member_ids: Vec<AccountId>,
    },

    /// A member left and the channel now lives under `new_key`.
    RemovedFromChannel {
        old_key: ChannelKey,
        new_key: ChannelKey,
        removed_member_id: AccountId,
        member_ids: Vec<AccountId>,
    },

    AdminChanged {
        channel_key: ChannelKey,
        account_id: AccountId,
        is_admin: bool,
        member_ids: Vec<AccountId>,
    },

    CaptureHistoryChanged {
        channel_key: ChannelKey,
        capture_history: bool,
        member_ids: Vec<AccountId>,
    },

    /// A message was accepted. When `persisted` is false this event is the
    /// only copy that will ever exist.
    MessagePosted {
        channel_key: ChannelKey,
        message: Message,
        persisted: bool,
        member_ids: Vec<AccountId>,
    },

    MessageDeleted {
        channel_key: ChannelKey,
        message_id: Uuid,
        member_ids: Vec<AccountId>,
    },

    /// Full state for one account, pushed on connect and on request.
    Snapshot { snapshot: AccountSnapshot },
}

impl RelayEvent {
    /// Kebab-case event name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FriendRequestSent { .. } => "friend-request-sent",
            Self::FriendRequestAccepted { .. } => "friend-request-accepted",
            Self::FriendRequestDeclined { .. } => "friend-request-declined",
            Self::FriendRemoved { .. } => "friend-removed",
            Self::TextChannelCreated { .. } => "text-channel-created",
            Self::MemberAdded { .. } => "member-added",
            Self::RemovedFromChannel { .. } => "removed-from-channel",
            Self::AdminChanged { .. } => "admin-changed",
            Self::CaptureHistoryChanged { .. } => "capture-history-changed",
            Self::MessagePosted { .. } => "message-posted",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::Snapshot { .. } => "snapshot",
        }
    }

    /// Whether `account` should see this event.
    pub fn is_relevant_to(&self, account: &AccountId) -> bool {
        match self {
            Self::FriendRequestSent { from, to, .. } => from == account || to == account,
            Self::FriendRequestAccepted {
                requester, accepter, ..
            } => requester == account || accepter == account,
            Self::FriendRequestDeclined {
                requester, decliner,
            } => requester == account || decliner == account,
            Self::FriendRemoved {
                account_id,
                friend_id,
            } => account_id == account || friend_id == account,
            Self::RemovedFromChannel {
                removed_member_id,
                member_ids,
                ..
            } => removed_member_id == account || member_ids.contains(account),
            Self::TextChannelCreated { member_ids, .. }
            | Self::MemberAdded { member_ids, .. }
            | Self::AdminChanged { member_ids, .. }
            | Self::CaptureHistoryChanged { member_ids, .. }
            | Self::MessagePosted { member_ids, .. }
            | Self::MessageDeleted { member_ids, .. } => member_ids.contains(account),
            Self::Snapshot { snapshot } => &snapshot.account_id == account,
        }
    }
}

/// Commands sent FROM client TO server over the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate a socket that was opened without a token.
    Identify { token: String },

    /// Ask for a fresh snapshot, e.g. after a missed event was suspected.
    Resync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_kind() {
        let event = RelayEvent::FriendRequestAccepted {
            requester: "a".into(),
            accepter: "b".into(),
            channel_key: ChannelKey::from_hex("00ff"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
        assert_eq!(json["data"]["requester"], "a");
    }

    #[test]
    fn removed_member_still_hears_about_removal() {
        let event = RelayEvent::RemovedFromChannel {
            old_key: ChannelKey::from_hex("01"),
            new_key: ChannelKey::from_hex("02"),
            removed_member_id: "b".into(),
            member_ids: vec!["a".into(), "c".into()],
        };
        assert!(event.is_relevant_to(&"b".into()));
        assert!(event.is_relevant_to(&"c".into()));
        assert!(!event.is_relevant_to(&"d".into()));
    }
}
