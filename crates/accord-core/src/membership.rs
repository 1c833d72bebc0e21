use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info};

use accord_db::{MemberRole, Relocation, Update};
use accord_types::events::RelayEvent;
use accord_types::models::{Channel, ChannelKind};
use accord_types::{AccountId, ChannelKey};

use crate::error::{Error, Result};
use crate::identity::{derive_channel_key, derive_direct_message_key};
use crate::{Engine, Named};

const CHANNEL_NAME_MAX_LEN: usize = 100;

/// Parameters for a named channel.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub owner_id: AccountId,
    pub member_ids: Vec<AccountId>,
    pub admin_ids: Vec<AccountId>,
    pub capture_history: bool,
}

impl Engine {
    pub(crate) async fn load_channel(&self, key: &ChannelKey) -> Result<Channel> {
        let target = key.clone();
        self.store("load channel", move |db| db.get_channel(&target))
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {}", key)))
    }

    /// Returns the direct-message key for `a` and `b`, creating the channel
    /// if it does not exist yet.
    pub(crate) async fn ensure_direct_message(&self, a: &AccountId, b: &AccountId) -> Result<ChannelKey> {
        let key = derive_direct_message_key(a, b)?;
        let target = key.clone();
        if self.store("load channel", move |db| db.get_channel(&target)).await?.is_some() {
            return Ok(key);
        }

        let channel = Channel {
            key: key.clone(),
            kind: ChannelKind::DirectMessage,
            name: None,
            owner_id: None,
            member_ids: [a.clone(), b.clone()].into_iter().collect(),
            admin_ids: BTreeSet::new(),
            capture_history: true,
            has_exchanged_message: false,
            created_at: Utc::now(),
        };
        // A lost race means the other writer created the same channel.
        let created = self.store_once("insert channel", move |db| db.insert_channel(&channel)).await?;
        if created {
            info!("Created direct message {} for {} and {}", key, a, b);
        }
        Ok(key)
    }

    /// Get-or-create the direct message between two friends.
    pub async fn create_direct_message_channel(&self, a: &AccountId, b: &AccountId) -> Result<Channel> {
        if a == b {
            return Err(Error::Validation("a direct message needs two distinct accounts".into()));
        }
        let first = self.account(a).await?;
        let second = self.account(b).await?;
        if !first.friends.contains(b) || !second.friends.contains(a) {
            return Err(Error::Unauthorized(
                "direct messages are only open between friends".into(),
            ));
        }

        let key = self.ensure_direct_message(a, b).await?;
        self.load_channel(&key).await
    }

    pub async fn create_named_channel(&self, new: NewChannel) -> Result<Channel> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("channel name is required".into()));
        }
        if name.chars().count() > CHANNEL_NAME_MAX_LEN {
            return Err(Error::Validation(format!(
                "channel name must be at most {} characters",
                CHANNEL_NAME_MAX_LEN
            )));
        }

        let mut member_ids: BTreeSet<AccountId> = new.member_ids.into_iter().collect();
        member_ids.insert(new.owner_id.clone());
        let mut admin_ids: BTreeSet<AccountId> = new.admin_ids.into_iter().collect();
        admin_ids.insert(new.owner_id.clone());

        if let Some(outsider) = admin_ids.iter().find(|a| !member_ids.contains(*a)) {
            return Err(Error::Validation(format!("admin {} is not a member", outsider)));
        }

        let ids: Vec<AccountId> = member_ids.iter().cloned().collect();
        let known: BTreeSet<AccountId> = self
            .store("resolve usernames", move |db| db.get_usernames(&ids))
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        if let Some(missing) = member_ids.iter().find(|m| !known.contains(*m)) {
            return Err(Error::NotFound(format!("account {}", missing)));
        }

        let key = derive_channel_key(&member_ids, Some(&name), None)?;
        let channel = Channel {
            key: key.clone(),
            kind: ChannelKind::NamedChannel,
            name: Some(name.clone()),
            owner_id: Some(new.owner_id.clone()),
            member_ids,
            admin_ids,
            capture_history: new.capture_history,
            has_exchanged_message: false,
            created_at: Utc::now(),
        };

        let record = channel.clone();
        let created = self.store_once("insert channel", move |db| db.insert_channel(&record)).await?;
        if !created {
            return Err(Error::Conflict(format!(
                "a channel named '{}' with these members already exists",
                name
            )));
        }

        info!("{} created channel '{}' ({})", new.owner_id, name, key);
        self.relay().publish(RelayEvent::TextChannelCreated {
            channel_key: key,
            name,
            owner_id: new.owner_id,
            member_ids: channel.member_ids.iter().cloned().collect(),
        });
        Ok(channel)
    }

    /// Adds `member` to a named channel. The key does not change. Returns
    /// whether the member was newly added.
    pub async fn add_member(&self, actor: &AccountId, key: &ChannelKey, member: &AccountId) -> Result<bool> {
        let channel = self.load_channel(key).await?;
        if channel.kind == ChannelKind::DirectMessage {
            return Err(Error::Validation("direct message membership is fixed".into()));
        }
        if !channel.is_admin(actor) {
            return Err(Error::Unauthorized("only admins can add members".into()));
        }
        self.account(member).await?;

        let (target, who) = (key.clone(), member.clone());
        let update = self
            .store("add channel member", move |db| db.add_channel_member(&target, MemberRole::Member, &who))
            .await?;

        match update {
            Update::Missing => Err(Error::NotFound(format!("channel {}", key))),
            Update::Unchanged => {
                debug!("{} is already in {}", member, key);
                Ok(false)
            }
            Update::Applied => {
                self.invalidate_members(key);
                let mut member_ids = channel.member_ids;
                member_ids.insert(member.clone());
                info!("{} added {} to {}", actor, member, key);
                self.relay().publish(RelayEvent::MemberAdded {
                    channel_key: key.clone(),
                    member_id: member.clone(),
                    member_ids: member_ids.into_iter().collect(),
                });
                Ok(true)
            }
        }
    }

    /// Removes `member` from a named channel and moves the channel, history
    /// included, to the key derived from the remaining members. Admins may
    /// remove anyone; any member may remove themselves.
    pub async fn remove_member(&self, actor: &AccountId, key: &ChannelKey, member: &AccountId) -> Result<ChannelKey> {
        let channel = self.load_channel(key).await?;
        if channel.kind == ChannelKind::DirectMessage {
            return Err(Error::Validation("direct message membership is fixed".into()));
        }
        if actor != member && !channel.is_admin(actor) {
            return Err(Error::Unauthorized("only admins can remove other members".into()));
        }
        if !channel.is_member(member) {
            return Err(Error::NotFound(format!("{} is not a member of {}", member, key)));
        }

        let remaining: BTreeSet<AccountId> = channel.member_ids.iter().filter(|m| *m != member).cloned().collect();
        if remaining.is_empty() {
            return Err(Error::Conflict("cannot remove the last member".into()));
        }
        let new_key = derive_channel_key(&remaining, channel.name.as_deref(), None)?;

        let (old, new, who) = (key.clone(), new_key.clone(), member.clone());
        let moved = self
            .store_once("relocate channel", move |db| db.relocate_channel(&old, &new, &who))
            .await?;

        match moved {
            Relocation::Moved { new_owner } => {
                if let Some(owner) = new_owner {
                    info!("Ownership of {} passed from {} to {}", new_key, member, owner);
                }
                self.invalidate_members(key);
                info!("{} removed {} from {}, rekeyed to {}", actor, member, key, new_key);
                self.relay().publish(RelayEvent::RemovedFromChannel {
                    old_key: key.clone(),
                    new_key: new_key.clone(),
                    removed_member_id: member.clone(),
                    member_ids: remaining.into_iter().collect(),
                });
                Ok(new_key)
            }
            Relocation::Missing => Err(Error::NotFound(format!("channel {}", key))),
            Relocation::NotMember => Err(Error::NotFound(format!("{} is not a member of {}", member, key))),
            Relocation::KeyTaken => Err(Error::Conflict(format!(
                "another channel already lives at {}",
                new_key
            ))),
            Relocation::NoSuccessor => Err(Error::Conflict(
                "the owner cannot leave until another admin can take over".into(),
            )),
        }
    }

    /// `promoter` grants admin rights to `promoted`. Promoting an existing
    /// admin is a no-op that returns false.
    pub async fn promote_admin(&self, promoter: &AccountId, key: &ChannelKey, promoted: &AccountId) -> Result<bool> {
        let channel = self.load_channel(key).await?;
        if channel.kind == ChannelKind::DirectMessage {
            return Err(Error::Validation("direct messages have no admins".into()));
        }
        if !channel.is_admin(promoter) {
            return Err(Error::Unauthorized("only admins can promote".into()));
        }
        if promoter == promoted {
            return Err(Error::Conflict("cannot promote yourself".into()));
        }
        if channel.owner_id.as_ref() == Some(promoted) {
            return Err(Error::Conflict("the owner already has every right".into()));
        }
        if !channel.is_member(promoted) {
            return Err(Error::Validation(format!("{} is not a member", promoted)));
        }
        if channel.admin_ids.contains(promoted) {
            return Ok(false);
        }

        let (target, who) = (key.clone(), promoted.clone());
        let update = self
            .store("promote admin", move |db| db.add_channel_member(&target, MemberRole::Admin, &who))
            .await?;
        if update == Update::Missing {
            return Err(Error::NotFound(format!("channel {}", key)));
        }

        info!("{} promoted {} in {}", promoter, promoted, key);
        self.relay().publish(RelayEvent::AdminChanged {
            channel_key: key.clone(),
            account_id: promoted.clone(),
            is_admin: true,
            member_ids: channel.member_ids.into_iter().collect(),
        });
        Ok(update == Update::Applied)
    }

    /// `actor` steps down as admin. The owner cannot.
    pub async fn relinquish_admin(&self, actor: &AccountId, key: &ChannelKey) -> Result<()> {
        let channel = self.load_channel(key).await?;
        if !channel.is_member(actor) {
            return Err(Error::Unauthorized(format!("not a member of {}", key)));
        }
        if channel.owner_id.as_ref() == Some(actor) {
            return Err(Error::Conflict("the owner cannot relinquish admin rights".into()));
        }
        if !channel.admin_ids.contains(actor) {
            return Err(Error::NotFound(format!("not an admin of {}", key)));
        }

        let (target, who) = (key.clone(), actor.clone());
        self.store("relinquish admin", move |db| db.pull_channel_member(&target, MemberRole::Admin, &who))
            .await?;

        info!("{} relinquished admin in {}", actor, key);
        self.relay().publish(RelayEvent::AdminChanged {
            channel_key: key.clone(),
            account_id: actor.clone(),
            is_admin: false,
            member_ids: channel.member_ids.into_iter().collect(),
        });
        Ok(())
    }

    /// A channel as seen by one of its members.
    pub async fn channel(&self, requester: &AccountId, key: &ChannelKey) -> Result<Channel> {
        let channel = self.load_channel(key).await?;
        if !channel.is_member(requester) {
            return Err(Error::Unauthorized(format!("not a member of {}", key)));
        }
        Ok(channel)
    }

    pub async fn channels_for(&self, account: &AccountId) -> Result<Vec<Channel>> {
        let target = account.clone();
        self.store("list channels", move |db| db.channels_for_account(&target)).await
    }

    /// Members of a channel with their usernames. Concurrent reads by the
    /// same requester share one store call.
    pub async fn members(&self, requester: &AccountId, key: &ChannelKey) -> Result<Vec<Named>> {
        let engine = self.clone();
        let (target, who) = (key.clone(), requester.clone());
        self.inner
            .member_reads
            .get_or_fetch((key.clone(), requester.clone()), move || async move {
                let channel = engine.channel(&who, &target).await?;
                let ids: Vec<AccountId> = channel.member_ids.into_iter().collect();
                engine.store("resolve usernames", move |db| db.get_usernames(&ids)).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, engine_with, id, listen};
    use accord_types::models::Message;
    use uuid::Uuid;

    async fn quartet() -> Engine {
        engine_with(&[("a", "alice"), ("b", "bob"), ("c", "carol"), ("d", "dave")]).await
    }

    fn team(members: &[&str]) -> NewChannel {
        NewChannel {
            name: "Team".into(),
            owner_id: id("a"),
            member_ids: members.iter().map(|m| id(m)).collect(),
            admin_ids: vec![id("a")],
            capture_history: true,
        }
    }

    fn message(author: &str, body: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            author_id: id(author),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn removal_rekeys_and_keeps_history() {
        let engine = quartet().await;
        let channel = engine.create_named_channel(team(&["a", "b", "c"])).await.unwrap();
        let hello = message("a", "hello");
        engine.write_message(&channel.key, hello.clone()).await.unwrap();

        let mut events = listen(&engine);
        let new_key = engine.remove_member(&id("a"), &channel.key, &id("b")).await.unwrap();

        assert_ne!(new_key, channel.key);
        assert_eq!(
            new_key,
            derive_channel_key(&[id("a"), id("c")], Some("Team"), None).unwrap()
        );
        assert!(matches!(engine.channel(&id("a"), &channel.key).await, Err(Error::NotFound(_))));

        let moved = engine.channel(&id("a"), &new_key).await.unwrap();
        assert_eq!(moved.name.as_deref(), Some("Team"));
        assert_eq!(moved.member_ids, [id("a"), id("c")].into_iter().collect());
        assert_eq!(engine.message_history(&id("c"), &new_key).await.unwrap(), vec![hello]);
        assert_eq!(drain(&mut events), vec!["removed-from-channel"]);
    }

    #[tokio::test]
    async fn remove_after_add_keeps_key() {
        let engine = quartet().await;
        let channel = engine.create_named_channel(team(&["a", "b"])).await.unwrap();
        engine.add_member(&id("a"), &channel.key, &id("c")).await.unwrap();
        let hello = message("c", "hello");
        engine.write_message(&channel.key, hello.clone()).await.unwrap();

        let mut events = listen(&engine);
        let new_key = engine.remove_member(&id("a"), &channel.key, &id("c")).await.unwrap();
        assert_eq!(new_key, channel.key);

        let kept = engine.channel(&id("a"), &channel.key).await.unwrap();
        assert_eq!(kept.member_ids, [id("a"), id("b")].into_iter().collect());
        assert_eq!(engine.message_history(&id("b"), &channel.key).await.unwrap(), vec![hello]);

        match events.try_recv() {
            Some(RelayEvent::RemovedFromChannel { old_key, new_key, removed_member_id, .. }) => {
                assert_eq!(old_key, new_key);
                assert_eq!(old_key, channel.key);
                assert_eq!(removed_member_id, id("c"));
            }
            other => panic!("expected removed-from-channel, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn creation_validates_input() {
        let engine = quartet().await;

        let mut blank = team(&["b"]);
        blank.name = "   ".into();
        assert!(matches!(engine.create_named_channel(blank).await, Err(Error::Validation(_))));

        let mut stray_admin = team(&["b"]);
        stray_admin.admin_ids.push(id("c"));
        assert!(matches!(engine.create_named_channel(stray_admin).await, Err(Error::Validation(_))));

        assert!(matches!(
            engine.create_named_channel(team(&["b", "ghost"])).await,
            Err(Error::NotFound(_))
        ));

        let created = engine.create_named_channel(team(&["b"])).await.unwrap();
        assert!(created.is_member(&id("a")));
        assert!(matches!(engine.create_named_channel(team(&["b"])).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn add_member_is_keyed_stable_and_idempotent() {
        let engine = quartet().await;
        let channel = engine.create_named_channel(team(&["b"])).await.unwrap();
        let mut events = listen(&engine);

        assert!(engine.add_member(&id("a"), &channel.key, &id("c")).await.unwrap());
        assert!(!engine.add_member(&id("a"), &channel.key, &id("c")).await.unwrap());
        assert!(matches!(
            engine.add_member(&id("b"), &channel.key, &id("d")).await,
            Err(Error::Unauthorized(_))
        ));

        let members = engine.members(&id("c"), &channel.key).await.unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(drain(&mut events), vec!["member-added"]);
    }

    #[tokio::test]
    async fn member_reads_see_additions() {
        let engine = quartet().await;
        let channel = engine.create_named_channel(team(&["b"])).await.unwrap();
        assert_eq!(engine.members(&id("a"), &channel.key).await.unwrap().len(), 2);

        engine.add_member(&id("a"), &channel.key, &id("c")).await.unwrap();
        assert_eq!(engine.members(&id("a"), &channel.key).await.unwrap().len(), 3);
        assert!(matches!(
            engine.members(&id("d"), &channel.key).await,
            Err(Error::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn owner_leaving_hands_over_to_earliest_admin() {
        let engine = quartet().await;
        let channel = engine.create_named_channel(team(&["b", "c"])).await.unwrap();

        assert!(matches!(
            engine.remove_member(&id("a"), &channel.key, &id("a")).await,
            Err(Error::Conflict(_))
        ));

        engine.promote_admin(&id("a"), &channel.key, &id("c")).await.unwrap();
        engine.promote_admin(&id("a"), &channel.key, &id("b")).await.unwrap();
        let new_key = engine.remove_member(&id("a"), &channel.key, &id("a")).await.unwrap();

        let moved = engine.channel(&id("b"), &new_key).await.unwrap();
        assert_eq!(moved.owner_id, Some(id("c")));
        assert!(!moved.admin_ids.contains(&id("a")));
    }

    #[tokio::test]
    async fn members_may_leave_but_not_evict() {
        let engine = quartet().await;
        let channel = engine.create_named_channel(team(&["b", "c"])).await.unwrap();

        assert!(matches!(
            engine.remove_member(&id("b"), &channel.key, &id("c")).await,
            Err(Error::Unauthorized(_))
        ));
        let new_key = engine.remove_member(&id("b"), &channel.key, &id("b")).await.unwrap();
        assert!(matches!(
            engine.remove_member(&id("a"), &new_key, &id("b")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rekey_collision_changes_nothing() {
        let engine = quartet().await;
        let small = engine.create_named_channel(team(&["c"])).await.unwrap();
        let big = engine.create_named_channel(team(&["b", "c"])).await.unwrap();

        assert!(matches!(
            engine.remove_member(&id("a"), &big.key, &id("b")).await,
            Err(Error::Conflict(_))
        ));
        assert!(engine.channel(&id("b"), &big.key).await.is_ok());
        assert!(engine.channel(&id("c"), &small.key).await.is_ok());
    }

    #[tokio::test]
    async fn direct_messages_require_friendship_and_fixed_members() {
        let engine = quartet().await;
        assert!(matches!(
            engine.create_direct_message_channel(&id("a"), &id("b")).await,
            Err(Error::Unauthorized(_))
        ));

        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        let key = engine.accept_friend_request(&id("b"), &id("a")).await.unwrap();
        let dm = engine.create_direct_message_channel(&id("b"), &id("a")).await.unwrap();
        assert_eq!(dm.key, key);

        assert!(matches!(
            engine.add_member(&id("a"), &key, &id("c")).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine.remove_member(&id("a"), &key, &id("b")).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn admin_promotion_rules() {
        let engine = quartet().await;
        let channel = engine.create_named_channel(team(&["b", "c"])).await.unwrap();

        assert!(matches!(
            engine.promote_admin(&id("b"), &channel.key, &id("c")).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            engine.promote_admin(&id("a"), &channel.key, &id("a")).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            engine.promote_admin(&id("a"), &channel.key, &id("d")).await,
            Err(Error::Validation(_))
        ));

        assert!(engine.promote_admin(&id("a"), &channel.key, &id("b")).await.unwrap());
        assert!(!engine.promote_admin(&id("a"), &channel.key, &id("b")).await.unwrap());
        assert!(matches!(
            engine.promote_admin(&id("b"), &channel.key, &id("a")).await,
            Err(Error::Conflict(_))
        ));

        engine.relinquish_admin(&id("b"), &channel.key).await.unwrap();
        assert!(matches!(
            engine.relinquish_admin(&id("b"), &channel.key).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            engine.relinquish_admin(&id("a"), &channel.key).await,
            Err(Error::Conflict(_))
        ));
    }
}
