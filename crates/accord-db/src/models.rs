//! Store-level vocabulary: which set a relation row belongs to, what a
//! single-document update did, and timestamp helpers for the TEXT columns.

use accord_types::AccountId;
use chrono::{DateTime, Utc};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationSet {
    Friends,
    SentPending,
    ReceivedPending,
}

impl RelationSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Friends => "friends",
            Self::SentPending => "sent_pending",
            Self::ReceivedPending => "received_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "friends" => Some(Self::Friends),
            "sent_pending" => Some(Self::SentPending),
            "received_pending" => Some(Self::ReceivedPending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Member,
    Admin,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }
}

/// One set operation inside a single-account update, in the spirit of a
/// document store's `$addToSet` / `$pull`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOp {
    Add(RelationSet, AccountId),
    Pull(RelationSet, AccountId),
}

/// Outcome of a single-document set update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// The document changed.
    Applied,
    /// The document exists but already had the requested shape.
    Unchanged,
    /// No document under that key.
    Missing,
}

impl Update {
    pub fn from_changes(changes: usize) -> Self {
        if changes > 0 { Self::Applied } else { Self::Unchanged }
    }
}

/// Outcome of moving a channel aggregate to a new key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    /// `new_owner` is set when the removed member owned the channel and the
    /// earliest remaining admin took over.
    Moved { new_owner: Option<AccountId> },
    /// The source key does not resolve (already moved or never existed).
    Missing,
    /// The member is not in the channel.
    NotMember,
    /// Another channel already lives at the target key.
    KeyTaken,
    /// The owner was being removed and no other admin can take over.
    NoSuccessor,
}

/// Outcome of recording a message against a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageWrite {
    /// Appended to history. `duplicate` is set when the id was already there.
    Persisted { duplicate: bool },
    /// Capture is off: nothing was written besides the exchange latch.
    LiveOnly,
    /// Another author already stored a message under this id in the channel.
    IdTaken,
    Missing,
}

/// Outcome of a capture-mode toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureUpdate {
    Applied,
    /// A message has been exchanged; the flag can no longer change.
    Locked,
    Missing,
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by hand through sqlite3 use "YYYY-MM-DD HH:MM:SS".
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}
