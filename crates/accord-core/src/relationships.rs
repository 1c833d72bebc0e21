//! Friend-request lifecycle between pairs of accounts.
//!
//! Each transition touches two account documents with two separate writes.
//! The order of those writes is fixed so that a crash between them leaves a
//! shape the reconciliation pass recognises and completes.

use tracing::{debug, info, warn};

use accord_db::{RelationSet, SetOp, Update};
use accord_types::events::RelayEvent;
use accord_types::models::Relation;
use accord_types::{AccountId, ChannelKey};

use crate::error::{Error, Result};
use crate::{Engine, Named};

impl Engine {
    /// Applies `ops` to one account document.
    pub(crate) async fn update_relations(&self, account: &AccountId, ops: Vec<SetOp>) -> Result<Update> {
        let target = account.clone();
        self.store("update relations", move |db| db.update_relations(&target, &ops))
            .await
    }

    /// Sends a request from `actor` to the account called `target_username`.
    /// Repeating a pending request is a no-op. Returns the target's id.
    pub async fn send_friend_request(&self, actor: &AccountId, target_username: &str) -> Result<AccountId> {
        let username = target_username.trim();
        if username.is_empty() {
            return Err(Error::Validation("username is required".into()));
        }

        let me = self.account(actor).await?;
        let target = self
            .account_by_username(username)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no account named '{}'", username)))?;

        if target.id == me.id {
            return Err(Error::Conflict("cannot send a friend request to yourself".into()));
        }
        match me.relation_to(&target.id) {
            Relation::Friends => {
                return Err(Error::Conflict(format!("already friends with {}", target.username)));
            }
            Relation::PendingIncoming => {
                return Err(Error::Conflict(format!(
                    "{} already sent you a request",
                    target.username
                )));
            }
            Relation::PendingOutgoing | Relation::NoRelation => {}
        }
        if target.friends.contains(&me.id) || target.sent_pending.contains(&me.id) {
            return Err(Error::Conflict(format!(
                "{} already has a relationship with you",
                target.username
            )));
        }

        // Sender first: a lone sent edge is completed by reconciliation.
        let sent = self
            .update_relations(&me.id, vec![SetOp::Add(RelationSet::SentPending, target.id.clone())])
            .await?;
        let received = self
            .update_relations(&target.id, vec![SetOp::Add(RelationSet::ReceivedPending, me.id.clone())])
            .await?;

        if sent == Update::Applied || received == Update::Applied {
            info!("{} sent a friend request to {}", me.username, target.username);
            self.relay().publish(RelayEvent::FriendRequestSent {
                from: me.id.clone(),
                from_username: me.username.clone(),
                to: target.id.clone(),
            });
        } else {
            debug!("{} re-sent a pending request to {}", me.username, target.username);
        }
        Ok(target.id)
    }

    /// `actor` accepts the pending request from `requester`. Both become
    /// friends and their direct-message channel is created if absent.
    pub async fn accept_friend_request(&self, actor: &AccountId, requester: &AccountId) -> Result<ChannelKey> {
        let me = self.account(actor).await?;
        if me.friends.contains(requester) {
            return Err(Error::Conflict(format!("already friends with {}", requester)));
        }
        if !me.received_pending.contains(requester) {
            if me.sent_pending.contains(requester) {
                return Err(Error::Unauthorized("cannot accept your own request".into()));
            }
            return Err(Error::NotFound(format!("no pending request from {}", requester)));
        }

        let requester_exists = {
            let target = requester.clone();
            self.store("load account", move |db| db.get_account(&target)).await?.is_some()
        };
        if !requester_exists {
            warn!("Dropping request from deleted account {} to {}", requester, actor);
            self.update_relations(actor, vec![SetOp::Pull(RelationSet::ReceivedPending, requester.clone())])
                .await?;
            return Err(Error::NotFound(format!("account {}", requester)));
        }

        // Step 1, the accepting side. Also clears a crossed request in the
        // other direction.
        self.update_relations(
            actor,
            vec![
                SetOp::Pull(RelationSet::ReceivedPending, requester.clone()),
                SetOp::Pull(RelationSet::SentPending, requester.clone()),
                SetOp::Add(RelationSet::Friends, requester.clone()),
            ],
        )
        .await?;

        // Step 2, the requesting side.
        self.update_relations(
            requester,
            vec![
                SetOp::Pull(RelationSet::SentPending, actor.clone()),
                SetOp::Pull(RelationSet::ReceivedPending, actor.clone()),
                SetOp::Add(RelationSet::Friends, actor.clone()),
            ],
        )
        .await?;

        let channel_key = self.ensure_direct_message(requester, actor).await?;
        self.invalidate_friends(&[actor, requester]);

        info!("{} accepted the friend request from {}", actor, requester);
        self.relay().publish(RelayEvent::FriendRequestAccepted {
            requester: requester.clone(),
            accepter: actor.clone(),
            channel_key: channel_key.clone(),
        });
        Ok(channel_key)
    }

    /// `actor` turns down the pending request from `requester`.
    pub async fn decline_friend_request(&self, actor: &AccountId, requester: &AccountId) -> Result<()> {
        let me = self.account(actor).await?;
        if !me.received_pending.contains(requester) {
            return Err(Error::NotFound(format!("no pending request from {}", requester)));
        }

        // Sender first: a lone received edge is dropped by reconciliation.
        let sender = self
            .update_relations(requester, vec![SetOp::Pull(RelationSet::SentPending, actor.clone())])
            .await?;
        if sender == Update::Missing {
            debug!("Requester {} no longer exists", requester);
        }
        self.update_relations(actor, vec![SetOp::Pull(RelationSet::ReceivedPending, requester.clone())])
            .await?;

        info!("{} declined the friend request from {}", actor, requester);
        self.relay().publish(RelayEvent::FriendRequestDeclined {
            requester: requester.clone(),
            decliner: actor.clone(),
        });
        Ok(())
    }

    /// Ends a friendship. The direct-message channel and its history stay.
    pub async fn remove_friend(&self, actor: &AccountId, friend: &AccountId) -> Result<()> {
        let me = self.account(actor).await?;
        if !me.friends.contains(friend) {
            return Err(Error::NotFound(format!("not friends with {}", friend)));
        }

        // Actor first: a lone friend edge on the other side is pulled by
        // reconciliation.
        self.update_relations(actor, vec![SetOp::Pull(RelationSet::Friends, friend.clone())])
            .await?;
        self.update_relations(friend, vec![SetOp::Pull(RelationSet::Friends, actor.clone())])
            .await?;
        self.invalidate_friends(&[actor, friend]);

        info!("{} removed {} as a friend", actor, friend);
        self.relay().publish(RelayEvent::FriendRemoved {
            account_id: actor.clone(),
            friend_id: friend.clone(),
        });
        Ok(())
    }

    /// Friends of `account` with their usernames. Concurrent calls for the
    /// same account share one store read.
    pub async fn friend_list(&self, account: &AccountId) -> Result<Vec<Named>> {
        let engine = self.clone();
        let target = account.clone();
        self.inner
            .friend_reads
            .get_or_fetch(account.clone(), move || async move {
                let me = engine.account(&target).await?;
                let ids: Vec<AccountId> = me.friends.into_iter().collect();
                engine.store("resolve usernames", move |db| db.get_usernames(&ids)).await
            })
            .await
    }

    /// Outgoing and incoming pending requests of `account`.
    pub async fn pending_requests(&self, account: &AccountId) -> Result<(Vec<Named>, Vec<Named>)> {
        let me = self.account(account).await?;
        let sent: Vec<AccountId> = me.sent_pending.into_iter().collect();
        let received: Vec<AccountId> = me.received_pending.into_iter().collect();

        let sent = self.store("resolve usernames", move |db| db.get_usernames(&sent)).await?;
        let received = self.store("resolve usernames", move |db| db.get_usernames(&received)).await?;
        Ok((sent, received))
    }

    /// The relation between `account` and `other`, read from `account`'s side.
    pub async fn relation(&self, account: &AccountId, other: &AccountId) -> Result<Relation> {
        Ok(self.account(account).await?.relation_to(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain, engine_with, id, listen};
    use accord_types::models::ChannelKind;

    async fn trio() -> Engine {
        engine_with(&[("a", "alice"), ("b", "bob"), ("c", "carol")]).await
    }

    #[tokio::test]
    async fn request_then_accept_makes_symmetric_friends() {
        let engine = trio().await;
        let mut events = listen(&engine);

        let bob = engine.send_friend_request(&id("a"), "bob").await.unwrap();
        assert_eq!(bob, id("b"));
        let alice = engine.account(&id("a")).await.unwrap();
        let bobs = engine.account(&id("b")).await.unwrap();
        assert!(alice.sent_pending.contains(&id("b")) && alice.sent_pending.len() == 1);
        assert!(bobs.received_pending.contains(&id("a")) && bobs.received_pending.len() == 1);

        let key = engine.accept_friend_request(&id("b"), &id("a")).await.unwrap();
        let alice = engine.account(&id("a")).await.unwrap();
        let bobs = engine.account(&id("b")).await.unwrap();
        assert!(alice.sent_pending.is_empty() && alice.received_pending.is_empty());
        assert!(bobs.sent_pending.is_empty() && bobs.received_pending.is_empty());
        assert_eq!(alice.friends.iter().collect::<Vec<_>>(), vec![&id("b")]);
        assert_eq!(bobs.friends.iter().collect::<Vec<_>>(), vec![&id("a")]);

        let dm = engine.channel(&id("a"), &key).await.unwrap();
        assert_eq!(dm.kind, ChannelKind::DirectMessage);
        assert_eq!(dm.member_ids, [id("a"), id("b")].into_iter().collect());
        assert!(dm.capture_history);

        assert_eq!(drain(&mut events), vec!["friend-request-sent", "friend-request-accepted"]);
    }

    #[tokio::test]
    async fn repeated_request_is_a_no_op() {
        let engine = trio().await;
        let mut events = listen(&engine);

        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        engine.send_friend_request(&id("a"), "bob").await.unwrap();

        assert_eq!(engine.account(&id("a")).await.unwrap().sent_pending.len(), 1);
        assert_eq!(engine.account(&id("b")).await.unwrap().received_pending.len(), 1);
        assert_eq!(drain(&mut events), vec!["friend-request-sent"]);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let engine = trio().await;
        assert!(matches!(
            engine.send_friend_request(&id("a"), "alice").await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            engine.send_friend_request(&id("a"), "nobody").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            engine.send_friend_request(&id("ghost"), "bob").await,
            Err(Error::NotFound(_))
        ));

        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        assert!(matches!(
            engine.send_friend_request(&id("b"), "alice").await,
            Err(Error::Conflict(_))
        ));

        engine.accept_friend_request(&id("b"), &id("a")).await.unwrap();
        assert!(matches!(
            engine.send_friend_request(&id("a"), "bob").await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn accept_guards_each_state() {
        let engine = trio().await;
        assert!(matches!(
            engine.accept_friend_request(&id("b"), &id("a")).await,
            Err(Error::NotFound(_))
        ));

        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        assert!(matches!(
            engine.accept_friend_request(&id("a"), &id("b")).await,
            Err(Error::Unauthorized(_))
        ));

        engine.accept_friend_request(&id("b"), &id("a")).await.unwrap();
        let mut events = listen(&engine);
        assert!(matches!(
            engine.accept_friend_request(&id("b"), &id("a")).await,
            Err(Error::Conflict(_))
        ));
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn decline_clears_both_sides() {
        let engine = trio().await;
        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        engine.decline_friend_request(&id("b"), &id("a")).await.unwrap();

        assert_eq!(engine.relation(&id("a"), &id("b")).await.unwrap(), Relation::NoRelation);
        assert_eq!(engine.relation(&id("b"), &id("a")).await.unwrap(), Relation::NoRelation);
        assert!(matches!(
            engine.decline_friend_request(&id("b"), &id("a")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_friend_keeps_direct_message() {
        let engine = trio().await;
        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        let key = engine.accept_friend_request(&id("b"), &id("a")).await.unwrap();

        engine.remove_friend(&id("a"), &id("b")).await.unwrap();
        assert_eq!(engine.relation(&id("a"), &id("b")).await.unwrap(), Relation::NoRelation);
        assert_eq!(engine.relation(&id("b"), &id("a")).await.unwrap(), Relation::NoRelation);
        assert!(engine.channel(&id("a"), &key).await.is_ok());

        assert!(matches!(
            engine.remove_friend(&id("a"), &id("b")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn friend_list_tracks_writes() {
        let engine = trio().await;
        assert!(engine.friend_list(&id("a")).await.unwrap().is_empty());

        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        engine.accept_friend_request(&id("b"), &id("a")).await.unwrap();
        assert_eq!(
            engine.friend_list(&id("a")).await.unwrap(),
            vec![(id("b"), "bob".to_string())]
        );

        engine.remove_friend(&id("b"), &id("a")).await.unwrap();
        assert!(engine.friend_list(&id("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_lists_carry_usernames() {
        let engine = trio().await;
        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        engine.send_friend_request(&id("c"), "alice").await.unwrap();

        let (sent, received) = engine.pending_requests(&id("a")).await.unwrap();
        assert_eq!(sent, vec![(id("b"), "bob".to_string())]);
        assert_eq!(received, vec![(id("c"), "carol".to_string())]);
    }
}
