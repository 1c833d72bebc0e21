use std::collections::BTreeSet;

use accord_types::models::{Channel, ChannelKind, Message};
use accord_types::{AccountId, ChannelKey};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Transaction};
use uuid::Uuid;

use crate::Database;
use crate::models::{
    CaptureUpdate, MemberRole, MessageWrite, Relocation, Update, parse_timestamp,
};
use crate::queries::OptionalExt;

impl Database {
    // -- Channels --

    /// Inserts a new channel aggregate. Returns false if the key is taken.
    pub fn insert_channel(&self, channel: &Channel) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO channels
                    (channel_key, kind, name, owner_id, capture_history, has_exchanged_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    channel.key.as_str(),
                    channel.kind.as_str(),
                    channel.name,
                    channel.owner_id.as_ref().map(|o| o.as_str()),
                    channel.capture_history,
                    channel.has_exchanged_message,
                    channel.created_at.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                return Ok(false);
            }

            // Owner joins first so it heads the succession order.
            let ordered_members = channel
                .owner_id
                .iter()
                .chain(channel.member_ids.iter().filter(|m| Some(*m) != channel.owner_id.as_ref()));
            for member in ordered_members {
                insert_member(&tx, &channel.key, MemberRole::Member, member)?;
            }
            for admin in &channel.admin_ids {
                insert_member(&tx, &channel.key, MemberRole::Admin, admin)?;
            }

            tx.commit()?;
            Ok(true)
        })
    }

    pub fn get_channel(&self, key: &ChannelKey) -> Result<Option<Channel>> {
        self.with_conn(|conn| query_channel(conn, key))
    }

    /// Every channel `account` is a member of, newest first.
    pub fn channels_for_account(&self, account: &AccountId) -> Result<Vec<Channel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.channel_key FROM channels c
                 JOIN channel_members m ON m.channel_key = c.channel_key
                 WHERE m.account_id = ?1 AND m.role = 'member'
                 ORDER BY c.created_at DESC, c.channel_key",
            )?;
            let keys = stmt
                .query_map([account.as_str()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut channels = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(channel) = query_channel(conn, &ChannelKey::from_hex(key))? {
                    channels.push(channel);
                }
            }
            Ok(channels)
        })
    }

    pub fn add_channel_member(&self, key: &ChannelKey, role: MemberRole, account: &AccountId) -> Result<Update> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if !channel_exists(&tx, key)? {
                return Ok(Update::Missing);
            }
            let n = insert_member(&tx, key, role, account)?;
            tx.commit()?;
            Ok(Update::from_changes(n))
        })
    }

    pub fn pull_channel_member(&self, key: &ChannelKey, role: MemberRole, account: &AccountId) -> Result<Update> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if !channel_exists(&tx, key)? {
                return Ok(Update::Missing);
            }
            let n = tx.execute(
                "DELETE FROM channel_members WHERE channel_key = ?1 AND role = ?2 AND account_id = ?3",
                (key.as_str(), role.as_str(), account.as_str()),
            )?;
            tx.commit()?;
            Ok(Update::from_changes(n))
        })
    }

    /// Removes `member` (and their admin role) and moves the whole aggregate,
    /// members and history included, from `old` to `new` in one step.
    ///
    /// If `member` owns the channel, ownership passes to the earliest
    /// remaining admin; without one nothing changes.
    pub fn relocate_channel(
        &self,
        old: &ChannelKey,
        new: &ChannelKey,
        member: &AccountId,
    ) -> Result<Relocation> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let owner: Option<Option<String>> = tx
                .query_row(
                    "SELECT owner_id FROM channels WHERE channel_key = ?1",
                    [old.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(owner) = owner else {
                return Ok(Relocation::Missing);
            };

            let is_member = tx
                .query_row(
                    "SELECT 1 FROM channel_members
                     WHERE channel_key = ?1 AND role = 'member' AND account_id = ?2",
                    (old.as_str(), member.as_str()),
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !is_member {
                return Ok(Relocation::NotMember);
            }

            if old != new && channel_exists(&tx, new)? {
                return Ok(Relocation::KeyTaken);
            }

            let mut new_owner = None;
            if owner.as_deref() == Some(member.as_str()) {
                let successor: Option<String> = tx
                    .query_row(
                        "SELECT account_id FROM channel_members
                         WHERE channel_key = ?1 AND role = 'admin' AND account_id != ?2
                         ORDER BY rowid LIMIT 1",
                        (old.as_str(), member.as_str()),
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(successor) = successor else {
                    return Ok(Relocation::NoSuccessor);
                };
                tx.execute(
                    "UPDATE channels SET owner_id = ?2 WHERE channel_key = ?1",
                    (old.as_str(), successor.as_str()),
                )?;
                new_owner = Some(AccountId::new(successor));
            }

            tx.execute(
                "DELETE FROM channel_members WHERE channel_key = ?1 AND account_id = ?2",
                (old.as_str(), member.as_str()),
            )?;

            if old != new {
                // ON UPDATE CASCADE carries members and messages along.
                tx.execute(
                    "UPDATE channels SET channel_key = ?2 WHERE channel_key = ?1",
                    (old.as_str(), new.as_str()),
                )?;
            }

            tx.commit()?;
            Ok(Relocation::Moved { new_owner })
        })
    }

    /// Changes the capture flag unless a message has already been exchanged.
    pub fn set_capture_history(&self, key: &ChannelKey, enabled: bool) -> Result<CaptureUpdate> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE channels SET capture_history = ?2
                 WHERE channel_key = ?1 AND has_exchanged_message = 0",
                (key.as_str(), enabled),
            )?;
            if n > 0 {
                return Ok(CaptureUpdate::Applied);
            }
            if channel_exists(conn, key)? {
                Ok(CaptureUpdate::Locked)
            } else {
                Ok(CaptureUpdate::Missing)
            }
        })
    }

    /// Latches `has_exchanged_message` and, only if the channel captures
    /// history, appends the message. Both happen under one transaction so a
    /// concurrent capture toggle cannot slip in between.
    pub fn record_message(&self, key: &ChannelKey, message: &Message) -> Result<MessageWrite> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let latched = tx.execute(
                "UPDATE channels SET has_exchanged_message = 1 WHERE channel_key = ?1",
                [key.as_str()],
            )?;
            if latched == 0 {
                return Ok(MessageWrite::Missing);
            }

            let capture: bool = tx.query_row(
                "SELECT capture_history FROM channels WHERE channel_key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )?;

            let outcome = if capture {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO messages (id, channel_key, author_id, body, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        message.id.to_string(),
                        key.as_str(),
                        message.author_id.as_str(),
                        message.body,
                        message.timestamp.to_rfc3339(),
                    ],
                )?;
                if inserted == 0 {
                    let stored_author: String = tx.query_row(
                        "SELECT author_id FROM messages WHERE channel_key = ?1 AND id = ?2",
                        (key.as_str(), message.id.to_string()),
                        |row| row.get(0),
                    )?;
                    if stored_author != message.author_id.as_str() {
                        // Dropping the transaction also undoes the latch.
                        return Ok(MessageWrite::IdTaken);
                    }
                }
                MessageWrite::Persisted {
                    duplicate: inserted == 0,
                }
            } else {
                MessageWrite::LiveOnly
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// The most recent `limit` messages, oldest first.
    pub fn get_messages(&self, key: &ChannelKey, limit: u32) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, author_id, body, created_at FROM (
                     SELECT rowid AS seq, id, author_id, body, created_at FROM messages
                     WHERE channel_key = ?1
                     ORDER BY rowid DESC
                     LIMIT ?2
                 ) ORDER BY seq ASC",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![key.as_str(), limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, author, body, created_at)| message_from_row(id, author, body, created_at))
                .collect()
        })
    }

    pub fn get_message(&self, key: &ChannelKey, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, author_id, body, created_at FROM messages
                     WHERE channel_key = ?1 AND id = ?2",
                    (key.as_str(), id.to_string()),
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(id, author, body, created_at)| message_from_row(id, author, body, created_at))
                .transpose()
        })
    }

    pub fn delete_message(&self, key: &ChannelKey, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM messages WHERE channel_key = ?1 AND id = ?2",
                (key.as_str(), id.to_string()),
            )?;
            Ok(n > 0)
        })
    }
}

fn channel_exists(conn: &Connection, key: &ChannelKey) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM channels WHERE channel_key = ?1", [key.as_str()], |_| Ok(()))
        .optional()?
        .is_some())
}

fn insert_member(tx: &Transaction<'_>, key: &ChannelKey, role: MemberRole, account: &AccountId) -> Result<usize> {
    Ok(tx.execute(
        "INSERT OR IGNORE INTO channel_members (channel_key, role, account_id) VALUES (?1, ?2, ?3)",
        (key.as_str(), role.as_str(), account.as_str()),
    )?)
}

fn query_channel(conn: &Connection, key: &ChannelKey) -> Result<Option<Channel>> {
    let row = conn
        .query_row(
            "SELECT kind, name, owner_id, capture_history, has_exchanged_message, created_at
             FROM channels WHERE channel_key = ?1",
            [key.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((kind, name, owner_id, capture_history, has_exchanged_message, created_at)) = row else {
        return Ok(None);
    };

    let kind = ChannelKind::parse(&kind).ok_or_else(|| anyhow!("Corrupt channel kind '{}' on {}", kind, key))?;

    let mut stmt = conn.prepare(
        "SELECT role, account_id FROM channel_members WHERE channel_key = ?1 ORDER BY rowid",
    )?;
    let members = stmt
        .query_map([key.as_str()], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut member_ids = BTreeSet::new();
    let mut admin_ids = BTreeSet::new();
    for (role, account) in members {
        if role == MemberRole::Admin.as_str() {
            admin_ids.insert(AccountId::new(account));
        } else {
            member_ids.insert(AccountId::new(account));
        }
    }

    Ok(Some(Channel {
        key: key.clone(),
        kind,
        name,
        owner_id: owner_id.map(AccountId::new),
        member_ids,
        admin_ids,
        capture_history,
        has_exchanged_message,
        created_at: parse_timestamp(&created_at),
    }))
}

fn message_from_row(id: String, author: String, body: String, created_at: String) -> Result<Message> {
    Ok(Message {
        id: id.parse().map_err(|e| anyhow!("Corrupt message id '{}': {}", id, e))?,
        author_id: AccountId::new(author),
        body,
        timestamp: parse_timestamp(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ids(raw: &[&str]) -> BTreeSet<AccountId> {
        raw.iter().map(|s| AccountId::from(*s)).collect()
    }

    fn team(key: &str, capture: bool) -> Channel {
        Channel {
            key: ChannelKey::from_hex(key),
            kind: ChannelKind::NamedChannel,
            name: Some("Team".into()),
            owner_id: Some("a".into()),
            member_ids: ids(&["a", "b", "c"]),
            admin_ids: ids(&["a"]),
            capture_history: capture,
            has_exchanged_message: false,
            created_at: Utc::now(),
        }
    }

    fn message(author: &str, body: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            author_id: author.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn insert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", true);
        assert!(db.insert_channel(&channel).unwrap());
        assert!(!db.insert_channel(&channel).unwrap());

        let loaded = db.get_channel(&channel.key).unwrap().unwrap();
        assert_eq!(loaded.member_ids, channel.member_ids);
        assert_eq!(loaded.admin_ids, channel.admin_ids);
        assert_eq!(loaded.owner_id, channel.owner_id);
        assert_eq!(db.channels_for_account(&"b".into()).unwrap().len(), 1);
    }

    #[test]
    fn relocation_carries_history() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", true);
        db.insert_channel(&channel).unwrap();
        let msg = message("a", "hello");
        db.record_message(&channel.key, &msg).unwrap();

        let new = ChannelKey::from_hex("k2");
        let moved = db.relocate_channel(&channel.key, &new, &"b".into()).unwrap();
        assert_eq!(moved, Relocation::Moved { new_owner: None });

        assert!(db.get_channel(&channel.key).unwrap().is_none());
        let relocated = db.get_channel(&new).unwrap().unwrap();
        assert_eq!(relocated.member_ids, ids(&["a", "c"]));
        assert_eq!(db.get_messages(&new, 50).unwrap(), vec![msg]);
        assert!(db.get_messages(&channel.key, 50).unwrap().is_empty());
    }

    #[test]
    fn relocation_refuses_taken_key_and_strangers() {
        let db = Database::open_in_memory().unwrap();
        db.insert_channel(&team("k1", true)).unwrap();
        db.insert_channel(&team("k2", true)).unwrap();

        let (k1, k2) = (ChannelKey::from_hex("k1"), ChannelKey::from_hex("k2"));
        assert_eq!(db.relocate_channel(&k1, &k2, &"b".into()).unwrap(), Relocation::KeyTaken);
        assert_eq!(
            db.relocate_channel(&k1, &ChannelKey::from_hex("k3"), &"zed".into()).unwrap(),
            Relocation::NotMember
        );
        assert_eq!(
            db.relocate_channel(&ChannelKey::from_hex("nope"), &k2, &"b".into()).unwrap(),
            Relocation::Missing
        );
        // Nothing moved.
        assert_eq!(db.get_channel(&k1).unwrap().unwrap().member_ids.len(), 3);
    }

    #[test]
    fn owner_succession_picks_earliest_admin() {
        let db = Database::open_in_memory().unwrap();
        let mut channel = team("k1", true);
        channel.admin_ids = ids(&["a"]);
        db.insert_channel(&channel).unwrap();
        db.add_channel_member(&channel.key, MemberRole::Admin, &"c".into()).unwrap();
        db.add_channel_member(&channel.key, MemberRole::Admin, &"b".into()).unwrap();

        let new = ChannelKey::from_hex("k2");
        let moved = db.relocate_channel(&channel.key, &new, &"a".into()).unwrap();
        assert_eq!(moved, Relocation::Moved { new_owner: Some("c".into()) });
        assert_eq!(db.get_channel(&new).unwrap().unwrap().owner_id, Some("c".into()));
    }

    #[test]
    fn owner_without_successor_stays() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", true);
        db.insert_channel(&channel).unwrap();
        let moved = db
            .relocate_channel(&channel.key, &ChannelKey::from_hex("k2"), &"a".into())
            .unwrap();
        assert_eq!(moved, Relocation::NoSuccessor);
        assert!(db.get_channel(&channel.key).unwrap().is_some());
    }

    #[test]
    fn live_only_channel_persists_nothing_but_latches() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", false);
        db.insert_channel(&channel).unwrap();

        assert_eq!(db.record_message(&channel.key, &message("a", "hi")).unwrap(), MessageWrite::LiveOnly);
        assert!(db.get_messages(&channel.key, 50).unwrap().is_empty());
        assert!(db.get_channel(&channel.key).unwrap().unwrap().has_exchanged_message);
        assert_eq!(db.set_capture_history(&channel.key, true).unwrap(), CaptureUpdate::Locked);
    }

    #[test]
    fn repeated_append_is_deduplicated() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", true);
        db.insert_channel(&channel).unwrap();
        let msg = message("a", "once");

        assert_eq!(
            db.record_message(&channel.key, &msg).unwrap(),
            MessageWrite::Persisted { duplicate: false }
        );
        assert_eq!(
            db.record_message(&channel.key, &msg).unwrap(),
            MessageWrite::Persisted { duplicate: true }
        );
        assert_eq!(db.get_messages(&channel.key, 50).unwrap().len(), 1);
    }

    #[test]
    fn message_ids_are_scoped_to_channel_and_author() {
        let db = Database::open_in_memory().unwrap();
        let (one, two) = (team("k1", true), team("k2", true));
        db.insert_channel(&one).unwrap();
        db.insert_channel(&two).unwrap();
        let first = message("a", "first");
        let mut second = message("b", "second");
        second.id = first.id;

        db.record_message(&one.key, &first).unwrap();
        assert_eq!(
            db.record_message(&two.key, &second).unwrap(),
            MessageWrite::Persisted { duplicate: false }
        );
        assert_eq!(db.get_messages(&two.key, 50).unwrap(), vec![second.clone()]);

        assert_eq!(db.record_message(&one.key, &second).unwrap(), MessageWrite::IdTaken);
        assert_eq!(db.get_messages(&one.key, 50).unwrap(), vec![first]);
    }

    #[test]
    fn capture_toggle_before_first_message() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", true);
        db.insert_channel(&channel).unwrap();
        assert_eq!(db.set_capture_history(&channel.key, false).unwrap(), CaptureUpdate::Applied);
        assert_eq!(
            db.set_capture_history(&ChannelKey::from_hex("zz"), false).unwrap(),
            CaptureUpdate::Missing
        );
    }

    #[test]
    fn messages_keep_insertion_order_and_limit() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", true);
        db.insert_channel(&channel).unwrap();
        let bodies = ["one", "two", "three"];
        for body in bodies {
            db.record_message(&channel.key, &message("a", body)).unwrap();
        }

        let last_two: Vec<String> = db
            .get_messages(&channel.key, 2)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(last_two, vec!["two", "three"]);
    }

    #[test]
    fn delete_message_by_id() {
        let db = Database::open_in_memory().unwrap();
        let channel = team("k1", true);
        db.insert_channel(&channel).unwrap();
        let msg = message("b", "oops");
        db.record_message(&channel.key, &msg).unwrap();

        assert!(db.get_message(&channel.key, msg.id).unwrap().is_some());
        assert!(db.delete_message(&channel.key, msg.id).unwrap());
        assert!(!db.delete_message(&channel.key, msg.id).unwrap());
    }
}
