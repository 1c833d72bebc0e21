use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{AccountId, ChannelKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub friends: BTreeSet<AccountId>,
    pub sent_pending: BTreeSet<AccountId>,
    pub received_pending: BTreeSet<AccountId>,
    pub created_at: DateTime<Utc>,
}

/// Relationship between two accounts, seen from the first account's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    NoRelation,
    /// This account sent a request that the other has not answered.
    PendingOutgoing,
    /// The other account sent this account a request.
    PendingIncoming,
    Friends,
}

impl Account {
    /// Reads the relation off this account's own sets only. The counterpart's
    /// document may disagree until reconciliation has run.
    pub fn relation_to(&self, other: &AccountId) -> Relation {
        if self.friends.contains(other) {
            Relation::Friends
        } else if self.sent_pending.contains(other) {
            Relation::PendingOutgoing
        } else if self.received_pending.contains(other) {
            Relation::PendingIncoming
        } else {
            Relation::NoRelation
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    DirectMessage,
    NamedChannel,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectMessage => "direct_message",
            Self::NamedChannel => "named_channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct_message" => Some(Self::DirectMessage),
            "named_channel" => Some(Self::NamedChannel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub key: ChannelKey,
    pub kind: ChannelKind,
    pub name: Option<String>,
    pub owner_id: Option<AccountId>,
    pub member_ids: BTreeSet<AccountId>,
    /// Always empty for direct messages.
    pub admin_ids: BTreeSet<AccountId>,
    pub capture_history: bool,
    pub has_exchanged_message: bool,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn is_member(&self, id: &AccountId) -> bool {
        self.member_ids.contains(id)
    }

    /// Owners carry admin rights without appearing in `admin_ids`.
    pub fn is_admin(&self, id: &AccountId) -> bool {
        self.admin_ids.contains(id) || self.owner_id.as_ref() == Some(id)
    }

    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            key: self.key.clone(),
            kind: self.kind,
            name: self.name.clone(),
            member_ids: self.member_ids.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Client-chosen when retrying, so a repeated append is recognised.
    pub id: Uuid,
    pub author_id: AccountId,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Lightweight channel listing used in snapshots and channel lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub key: ChannelKey,
    pub kind: ChannelKind,
    pub name: Option<String>,
    pub member_ids: Vec<AccountId>,
}

/// Everything a client needs to rebuild its view of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub username: String,
    pub friends: Vec<AccountId>,
    pub sent_pending: Vec<AccountId>,
    pub received_pending: Vec<AccountId>,
    pub channels: Vec<ChannelSummary>,
}
