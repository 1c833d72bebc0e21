//! Whether a message is kept.
//!
//! A channel that captures history appends every message durably; one that
//! does not only relays it to whoever is connected. Either way the first
//! message latches `has_exchanged_message`, after which capture mode is
//! frozen.

use tracing::{debug, info};
use uuid::Uuid;

use accord_db::{CaptureUpdate, MessageWrite};
use accord_types::events::RelayEvent;
use accord_types::models::{ChannelKind, Message};
use accord_types::{AccountId, ChannelKey};

use crate::Engine;
use crate::error::{Error, Result};

const MESSAGE_MAX_LEN: usize = 4000;

/// What happened to an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Persisted,
    /// Relayed to live subscribers only; no copy was stored.
    LiveOnly,
}

impl Engine {
    /// Accepts `message` into the channel. Appends are keyed by message id,
    /// so a retried write with the same id is stored and relayed once.
    pub async fn write_message(&self, key: &ChannelKey, message: Message) -> Result<Delivery> {
        if message.body.trim().is_empty() {
            return Err(Error::Validation("message body is required".into()));
        }
        if message.body.chars().count() > MESSAGE_MAX_LEN {
            return Err(Error::Validation(format!(
                "message body must be at most {} characters",
                MESSAGE_MAX_LEN
            )));
        }

        let channel = self.load_channel(key).await?;
        if !channel.is_member(&message.author_id) {
            return Err(Error::Unauthorized(format!("not a member of {}", key)));
        }

        let (target, record) = (key.clone(), message.clone());
        let outcome = self
            .store("record message", move |db| db.record_message(&target, &record))
            .await?;

        let delivery = match outcome {
            MessageWrite::Missing => return Err(Error::NotFound(format!("channel {}", key))),
            MessageWrite::Persisted { duplicate: true } => {
                debug!("Message {} already stored in {}", message.id, key);
                return Ok(Delivery::Persisted);
            }
            MessageWrite::Persisted { duplicate: false } => Delivery::Persisted,
            MessageWrite::LiveOnly => Delivery::LiveOnly,
            MessageWrite::IdTaken => {
                return Err(Error::Conflict(format!(
                    "message id {} is already used in {}",
                    message.id, key
                )));
            }
        };

        debug!("Message {} in {} delivered as {:?}", message.id, key, delivery);
        self.relay().publish(RelayEvent::MessagePosted {
            channel_key: key.clone(),
            message,
            persisted: delivery == Delivery::Persisted,
            member_ids: channel.member_ids.into_iter().collect(),
        });
        Ok(delivery)
    }

    /// Deletes a stored message. Its author, a channel admin or the owner
    /// may delete it.
    pub async fn delete_message(&self, actor: &AccountId, key: &ChannelKey, message_id: Uuid) -> Result<()> {
        let channel = self.load_channel(key).await?;
        if !channel.is_member(actor) {
            return Err(Error::Unauthorized(format!("not a member of {}", key)));
        }

        let target = key.clone();
        let message = self
            .store("load message", move |db| db.get_message(&target, message_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;

        if message.author_id != *actor && !channel.is_admin(actor) {
            return Err(Error::Unauthorized("only the author or an admin can delete".into()));
        }

        let target = key.clone();
        let deleted = self
            .store("delete message", move |db| db.delete_message(&target, message_id))
            .await?;
        if !deleted {
            return Err(Error::NotFound(format!("message {}", message_id)));
        }

        info!("{} deleted message {} in {}", actor, message_id, key);
        self.relay().publish(RelayEvent::MessageDeleted {
            channel_key: key.clone(),
            message_id,
            member_ids: channel.member_ids.into_iter().collect(),
        });
        Ok(())
    }

    /// Switches capture mode on a named channel. Returns false when the flag
    /// already had the requested value.
    pub async fn set_capture_history(&self, actor: &AccountId, key: &ChannelKey, enabled: bool) -> Result<bool> {
        let channel = self.load_channel(key).await?;
        if channel.kind == ChannelKind::DirectMessage {
            return Err(Error::Validation("direct messages always capture history".into()));
        }
        if !channel.is_admin(actor) {
            return Err(Error::Unauthorized("only admins can change capture mode".into()));
        }
        if channel.capture_history == enabled {
            return Ok(false);
        }
        if channel.has_exchanged_message {
            return Err(Error::Conflict("capture mode is locked once messages were exchanged".into()));
        }

        let target = key.clone();
        let update = self
            .store("set capture history", move |db| db.set_capture_history(&target, enabled))
            .await?;

        match update {
            CaptureUpdate::Applied => {
                info!("{} set capture history on {} to {}", actor, key, enabled);
                self.relay().publish(RelayEvent::CaptureHistoryChanged {
                    channel_key: key.clone(),
                    capture_history: enabled,
                    member_ids: channel.member_ids.into_iter().collect(),
                });
                Ok(true)
            }
            CaptureUpdate::Locked => Err(Error::Conflict(
                "capture mode is locked once messages were exchanged".into(),
            )),
            CaptureUpdate::Missing => Err(Error::NotFound(format!("channel {}", key))),
        }
    }

    /// Most recent stored messages, oldest first. Members only.
    pub async fn message_history(&self, requester: &AccountId, key: &ChannelKey) -> Result<Vec<Message>> {
        self.channel(requester, key).await?;
        let target = key.clone();
        let limit = self.config().history_limit;
        self.store("load history", move |db| db.get_messages(&target, limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewChannel;
    use crate::testing::{engine_with, id, listen};
    use accord_gateway::Topic;
    use chrono::Utc;

    async fn setup(capture: bool) -> (Engine, ChannelKey) {
        let engine = engine_with(&[("a", "alice"), ("b", "bob"), ("c", "carol"), ("d", "dave")]).await;
        let channel = engine
            .create_named_channel(NewChannel {
                name: "Team".into(),
                owner_id: id("a"),
                member_ids: vec![id("b"), id("c")],
                admin_ids: vec![],
                capture_history: capture,
            })
            .await
            .unwrap();
        (engine, channel.key)
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
    async fn live_only_channel_relays_but_never_stores() {
        let (engine, key) = setup(false).await;
        let mut carol = engine.relay().receiver(Topic::Account(id("c")));
        let mut dave = engine.relay().receiver(Topic::Account(id("d")));

        let delivery = engine.write_message(&key, message("b", "hi")).await.unwrap();
        assert_eq!(delivery, Delivery::LiveOnly);
        assert!(engine.message_history(&id("a"), &key).await.unwrap().is_empty());

        match carol.try_recv() {
            Some(RelayEvent::MessagePosted { message, persisted, .. }) => {
                assert_eq!(message.body, "hi");
                assert!(!persisted);
            }
            other => panic!("expected a live message, got {:?}", other),
        }
        assert!(dave.try_recv().is_none());
    }

    #[tokio::test]
    async fn capturing_channel_stores_once_per_id() {
        let (engine, key) = setup(true).await;
        let mut events = listen(&engine);
        let msg = message("b", "hello");

        assert_eq!(engine.write_message(&key, msg.clone()).await.unwrap(), Delivery::Persisted);
        assert_eq!(engine.write_message(&key, msg.clone()).await.unwrap(), Delivery::Persisted);

        assert_eq!(engine.message_history(&id("c"), &key).await.unwrap(), vec![msg]);
        assert!(events.try_recv().is_some());
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn message_ids_do_not_collide_across_channels_or_authors() {
        let (engine, key) = setup(true).await;
        let other = engine
            .create_named_channel(NewChannel {
                name: "Side".into(),
                owner_id: id("a"),
                member_ids: vec![id("b")],
                admin_ids: vec![],
                capture_history: true,
            })
            .await
            .unwrap()
            .key;
        let first = message("b", "first");
        let mut reused = message("a", "second");
        reused.id = first.id;

        engine.write_message(&key, first.clone()).await.unwrap();
        let mut events = listen(&engine);
        assert_eq!(engine.write_message(&other, reused.clone()).await.unwrap(), Delivery::Persisted);
        assert_eq!(engine.message_history(&id("a"), &other).await.unwrap(), vec![reused.clone()]);
        assert!(matches!(events.try_recv(), Some(RelayEvent::MessagePosted { .. })));

        assert!(matches!(
            engine.write_message(&key, reused).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(engine.message_history(&id("a"), &key).await.unwrap(), vec![first]);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn writes_are_validated() {
        let (engine, key) = setup(true).await;
        assert!(matches!(
            engine.write_message(&key, message("b", "  ")).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine.write_message(&key, message("b", &"x".repeat(4001))).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            engine.write_message(&key, message("d", "let me in")).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            engine.message_history(&id("d"), &key).await,
            Err(Error::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn capture_mode_locks_after_first_message() {
        let (engine, key) = setup(true).await;
        assert!(matches!(
            engine.set_capture_history(&id("b"), &key, false).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(engine.set_capture_history(&id("a"), &key, false).await.unwrap());
        assert!(!engine.set_capture_history(&id("a"), &key, false).await.unwrap());

        engine.write_message(&key, message("b", "secret")).await.unwrap();
        assert!(matches!(
            engine.set_capture_history(&id("a"), &key, true).await,
            Err(Error::Conflict(_))
        ));
        // Re-asserting the current value is still fine.
        assert!(!engine.set_capture_history(&id("a"), &key, false).await.unwrap());
    }

    #[tokio::test]
    async fn deletion_by_author_or_admin_only() {
        let (engine, key) = setup(true).await;
        let first = message("b", "one");
        let second = message("b", "two");
        engine.write_message(&key, first.clone()).await.unwrap();
        engine.write_message(&key, second.clone()).await.unwrap();

        assert!(matches!(
            engine.delete_message(&id("c"), &key, first.id).await,
            Err(Error::Unauthorized(_))
        ));
        engine.delete_message(&id("b"), &key, first.id).await.unwrap();
        engine.delete_message(&id("a"), &key, second.id).await.unwrap();
        assert!(matches!(
            engine.delete_message(&id("a"), &key, second.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(engine.message_history(&id("a"), &key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_messages_cannot_be_deleted() {
        let (engine, key) = setup(false).await;
        let msg = message("b", "gone already");
        engine.write_message(&key, msg.clone()).await.unwrap();
        assert!(matches!(
            engine.delete_message(&id("b"), &key, msg.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn direct_messages_always_capture() {
        let (engine, _) = setup(true).await;
        engine.send_friend_request(&id("a"), "bob").await.unwrap();
        let dm = engine.accept_friend_request(&id("b"), &id("a")).await.unwrap();
        assert!(matches!(
            engine.set_capture_history(&id("a"), &dm, false).await,
            Err(Error::Validation(_))
        ));
    }
}
