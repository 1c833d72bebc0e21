//! Client-side mirror of one account's social state.
//!
//! The relay gives no delivery or ordering guarantee, so a client keeps two
//! inputs flowing into the same view: relay events as they arrive, and full
//! snapshots from periodic polls. Both paths must be idempotent: applying an
//! event twice, or applying it after a snapshot that already reflects it,
//! leaves the view unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use accord_types::events::RelayEvent;
use accord_types::models::{AccountSnapshot, ChannelKind, ChannelSummary};
use accord_types::{AccountId, ChannelKey};

/// Reference polling interval for reconciliation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountView {
    pub account_id: AccountId,
    pub friends: BTreeSet<AccountId>,
    pub sent_pending: BTreeSet<AccountId>,
    pub received_pending: BTreeSet<AccountId>,
    pub channels: BTreeMap<ChannelKey, ChannelSummary>,
}

impl AccountView {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            friends: BTreeSet::new(),
            sent_pending: BTreeSet::new(),
            received_pending: BTreeSet::new(),
            channels: BTreeMap::new(),
        }
    }

    /// Replace everything with an authoritative poll result.
    pub fn merge_snapshot(&mut self, snapshot: &AccountSnapshot) -> bool {
        if snapshot.account_id != self.account_id {
            return false;
        }
        let mut next = Self::new(self.account_id.clone());
        next.friends = snapshot.friends.iter().cloned().collect();
        next.sent_pending = snapshot.sent_pending.iter().cloned().collect();
        next.received_pending = snapshot.received_pending.iter().cloned().collect();
        next.channels = snapshot
            .channels
            .iter()
            .map(|c| (c.key.clone(), c.clone()))
            .collect();

        let changed = next != *self;
        *self = next;
        changed
    }

    /// Fold one relay event into the view. Returns whether anything changed.
    pub fn apply(&mut self, event: &RelayEvent) -> bool {
        let before = self.clone();
        let me = self.account_id.clone();

        match event {
            RelayEvent::FriendRequestSent { from, to, .. } => {
                if *from == me && !self.friends.contains(to) {
                    self.sent_pending.insert(to.clone());
                } else if *to == me && !self.friends.contains(from) {
                    self.received_pending.insert(from.clone());
                }
            }
            RelayEvent::FriendRequestAccepted {
                requester,
                accepter,
                channel_key,
            } => {
                if let Some(other) = counterpart(&me, requester, accepter) {
                    self.sent_pending.remove(other);
                    self.received_pending.remove(other);
                    self.friends.insert(other.clone());
                    self.channels
                        .entry(channel_key.clone())
                        .or_insert_with(|| ChannelSummary {
                            key: channel_key.clone(),
                            kind: ChannelKind::DirectMessage,
                            name: None,
                            member_ids: vec![requester.clone(), accepter.clone()],
                        });
                }
            }
            RelayEvent::FriendRequestDeclined {
                requester,
                decliner,
            } => {
                if let Some(other) = counterpart(&me, requester, decliner) {
                    self.sent_pending.remove(other);
                    self.received_pending.remove(other);
                }
            }
            RelayEvent::FriendRemoved {
                account_id,
                friend_id,
            } => {
                if let Some(other) = counterpart(&me, account_id, friend_id) {
                    self.friends.remove(other);
                }
            }
            RelayEvent::TextChannelCreated {
                channel_key,
                name,
                member_ids,
                ..
            } => {
                if member_ids.contains(&me) {
                    self.channels.insert(
                        channel_key.clone(),
                        ChannelSummary {
                            key: channel_key.clone(),
                            kind: ChannelKind::NamedChannel,
                            name: Some(name.clone()),
                            member_ids: member_ids.clone(),
                        },
                    );
                }
            }
            RelayEvent::MemberAdded {
                channel_key,
                member_ids,
                ..
            } => {
                if member_ids.contains(&me) {
                    // Unknown channels get a placeholder; the next poll fills in the name.
                    let entry = self
                        .channels
                        .entry(channel_key.clone())
                        .or_insert_with(|| ChannelSummary {
                            key: channel_key.clone(),
                            kind: ChannelKind::NamedChannel,
                            name: None,
                            member_ids: vec![],
                        });
                    entry.member_ids = member_ids.clone();
                }
            }
            RelayEvent::RemovedFromChannel {
                old_key,
                new_key,
                removed_member_id,
                member_ids,
            } => {
                if *removed_member_id == me {
                    self.channels.remove(old_key);
                    self.channels.remove(new_key);
                } else if let Some(mut summary) = self.channels.remove(old_key) {
                    summary.key = new_key.clone();
                    summary.member_ids = member_ids.clone();
                    self.channels.insert(new_key.clone(), summary);
                } else if let Some(summary) = self.channels.get_mut(new_key) {
                    // Replay of a rekey we already followed.
                    summary.member_ids = member_ids.clone();
                }
            }
            RelayEvent::Snapshot { snapshot } => {
                return self.merge_snapshot(snapshot);
            }
            RelayEvent::AdminChanged { .. }
            | RelayEvent::CaptureHistoryChanged { .. }
            | RelayEvent::MessagePosted { .. }
            | RelayEvent::MessageDeleted { .. } => {}
        }

        before != *self
    }
}

fn counterpart<'a>(me: &AccountId, a: &'a AccountId, b: &'a AccountId) -> Option<&'a AccountId> {
    if a == me {
        Some(b)
    } else if b == me {
        Some(a)
    } else {
        None
    }
}

/// Decides when a client polls next: the base interval while polls succeed,
/// exponential backoff while they fail.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_POLL_INTERVAL)
    }
}

impl PollSchedule {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub fn on_success(&mut self) -> Duration {
        self.failures = 0;
        self.base
    }

    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}
