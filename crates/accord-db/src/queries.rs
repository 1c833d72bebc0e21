use std::collections::{BTreeSet, HashMap};

use accord_types::AccountId;
use accord_types::models::Account;
use anyhow::Result;
use rusqlite::Connection;

use crate::Database;
use crate::models::{RelationSet, SetOp, Update, now_timestamp, parse_timestamp};

/// Whether a provisioning upsert created a new account or renamed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Renamed,
    Unchanged,
}

impl Database {
    // -- Accounts --

    pub fn upsert_account(&self, id: &AccountId, username: &str) -> Result<Upsert> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row("SELECT username FROM accounts WHERE id = ?1", [id.as_str()], |row| {
                    row.get(0)
                })
                .optional()?;

            let outcome = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO accounts (id, username, created_at) VALUES (?1, ?2, ?3)",
                        (id.as_str(), username, now_timestamp()),
                    )?;
                    Upsert::Created
                }
                Some(current) if current == username => Upsert::Unchanged,
                Some(_) => {
                    tx.execute(
                        "UPDATE accounts SET username = ?2 WHERE id = ?1",
                        (id.as_str(), username),
                    )?;
                    Upsert::Renamed
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Deletes the account document. Its own relation rows go with it; the
    /// counterparts' rows are separate documents and are pulled by the caller.
    pub fn delete_account(&self, id: &AccountId) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM accounts WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }

    pub fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.with_conn(|conn| query_account(conn, "id", id.as_str()))
    }

    pub fn get_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        self.with_conn(|conn| query_account(conn, "username", username))
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, username, created_at FROM accounts ORDER BY id")?;
            let mut accounts: Vec<Account> = stmt
                .query_map([], |row| {
                    Ok(bare_account(row.get(0)?, row.get(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt =
                conn.prepare("SELECT account_id, set_name, other_id FROM account_relations")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut by_id: HashMap<String, usize> = HashMap::new();
            for (i, a) in accounts.iter().enumerate() {
                by_id.insert(a.id.as_str().to_string(), i);
            }
            for (account_id, set_name, other_id) in rows {
                if let Some(&i) = by_id.get(&account_id) {
                    push_relation(&mut accounts[i], &set_name, other_id);
                }
            }

            Ok(accounts)
        })
    }

    /// Id/username pairs for the given ids. Unknown ids are skipped.
    pub fn get_usernames(&self, ids: &[AccountId]) -> Result<Vec<(AccountId, String)>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, username FROM accounts WHERE id IN ({}) ORDER BY username",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(ids.iter().map(|id| id.as_str()));

            let rows = stmt
                .query_map(params, |row| {
                    Ok((AccountId::new(row.get::<_, String>(0)?), row.get(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Accounts whose relation sets mention `id` in any position.
    pub fn accounts_referencing(&self, id: &AccountId) -> Result<Vec<AccountId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT account_id FROM account_relations WHERE other_id = ?1 ORDER BY account_id",
            )?;
            let ids = stmt
                .query_map([id.as_str()], |row| row.get::<_, String>(0))?
                .map(|r| r.map(AccountId::new))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Relation sets --

    /// Applies `ops` to one account atomically. Reports `Missing` without
    /// writing anything if the account does not exist.
    pub fn update_relations(&self, account: &AccountId, ops: &[SetOp]) -> Result<Update> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row("SELECT 1 FROM accounts WHERE id = ?1", [account.as_str()], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Ok(Update::Missing);
            }

            let mut changes = 0;
            for op in ops {
                changes += match op {
                    SetOp::Add(set, other) => tx.execute(
                        "INSERT OR IGNORE INTO account_relations (account_id, set_name, other_id)
                         VALUES (?1, ?2, ?3)",
                        (account.as_str(), set.as_str(), other.as_str()),
                    )?,
                    SetOp::Pull(set, other) => tx.execute(
                        "DELETE FROM account_relations
                         WHERE account_id = ?1 AND set_name = ?2 AND other_id = ?3",
                        (account.as_str(), set.as_str(), other.as_str()),
                    )?,
                };
            }
            tx.commit()?;
            Ok(Update::from_changes(changes))
        })
    }

    #[cfg(test)]
    pub(crate) fn add_to_set(&self, account: &AccountId, set: RelationSet, other: &AccountId) -> Result<Update> {
        self.update_relations(account, &[SetOp::Add(set, other.clone())])
    }
}

fn bare_account(id: String, username: String, created_at: String) -> Account {
    Account {
        id: AccountId::new(id),
        username,
        friends: BTreeSet::new(),
        sent_pending: BTreeSet::new(),
        received_pending: BTreeSet::new(),
        created_at: parse_timestamp(&created_at),
    }
}

fn push_relation(account: &mut Account, set_name: &str, other: String) {
    let other = AccountId::new(other);
    match RelationSet::parse(set_name) {
        Some(RelationSet::Friends) => {
            account.friends.insert(other);
        }
        Some(RelationSet::SentPending) => {
            account.sent_pending.insert(other);
        }
        Some(RelationSet::ReceivedPending) => {
            account.received_pending.insert(other);
        }
        None => tracing::warn!("Unknown relation set '{}' on account {}", set_name, account.id),
    }
}

fn query_account(conn: &Connection, column: &str, value: &str) -> Result<Option<Account>> {
    let sql = format!("SELECT id, username, created_at FROM accounts WHERE {} = ?1", column);
    let account = conn
        .query_row(&sql, [value], |row| {
            Ok(bare_account(row.get(0)?, row.get(1)?, row.get::<_, String>(2)?))
        })
        .optional()?;

    let Some(mut account) = account else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT set_name, other_id FROM account_relations WHERE account_id = ?1")?;
    let rows = stmt
        .query_map([account.id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (set_name, other) in rows {
        push_relation(&mut account, &set_name, other);
    }

    Ok(Some(account))
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with(names: &[(&str, &str)]) -> Database {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in names {
            db.upsert_account(&AccountId::from(*id), name).unwrap();
        }
        db
    }

    #[test]
    fn upsert_creates_then_renames() {
        let db = db_with(&[]);
        let id = AccountId::from("a");
        assert_eq!(db.upsert_account(&id, "alice").unwrap(), Upsert::Created);
        assert_eq!(db.upsert_account(&id, "alice").unwrap(), Upsert::Unchanged);
        assert_eq!(db.upsert_account(&id, "alicia").unwrap(), Upsert::Renamed);
        assert!(db.get_account_by_username("alice").unwrap().is_none());
        assert_eq!(db.get_account_by_username("alicia").unwrap().unwrap().id, id);
    }

    #[test]
    fn add_to_set_is_idempotent() {
        let db = db_with(&[("a", "alice"), ("b", "bob")]);
        let (a, b) = (AccountId::from("a"), AccountId::from("b"));

        assert_eq!(db.add_to_set(&a, RelationSet::SentPending, &b).unwrap(), Update::Applied);
        assert_eq!(db.add_to_set(&a, RelationSet::SentPending, &b).unwrap(), Update::Unchanged);

        let alice = db.get_account(&a).unwrap().unwrap();
        assert_eq!(alice.sent_pending.len(), 1);
    }

    #[test]
    fn update_relations_on_missing_account() {
        let db = db_with(&[]);
        let ghost = AccountId::from("ghost");
        let ops = [SetOp::Add(RelationSet::Friends, AccountId::from("x"))];
        assert_eq!(db.update_relations(&ghost, &ops).unwrap(), Update::Missing);
    }

    #[test]
    fn combined_pull_and_add_in_one_update() {
        let db = db_with(&[("a", "alice"), ("b", "bob")]);
        let (a, b) = (AccountId::from("a"), AccountId::from("b"));
        db.add_to_set(&b, RelationSet::ReceivedPending, &a).unwrap();

        let ops = [
            SetOp::Pull(RelationSet::ReceivedPending, a.clone()),
            SetOp::Add(RelationSet::Friends, a.clone()),
        ];
        assert_eq!(db.update_relations(&b, &ops).unwrap(), Update::Applied);

        let bob = db.get_account(&b).unwrap().unwrap();
        assert!(bob.received_pending.is_empty());
        assert!(bob.friends.contains(&a));
    }

    #[test]
    fn list_accounts_groups_relations() {
        let db = db_with(&[("a", "alice"), ("b", "bob"), ("c", "carol")]);
        let (a, b, c) = (AccountId::from("a"), AccountId::from("b"), AccountId::from("c"));
        db.add_to_set(&a, RelationSet::Friends, &b).unwrap();
        db.add_to_set(&c, RelationSet::SentPending, &a).unwrap();

        let all = db.list_accounts().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].friends.contains(&b));
        assert!(all[2].sent_pending.contains(&a));

        assert_eq!(db.accounts_referencing(&a).unwrap(), vec![c.clone()]);
        assert_eq!(db.accounts_referencing(&b).unwrap(), vec![a.clone()]);
    }

    #[test]
    fn delete_account_drops_own_relations_only() {
        let db = db_with(&[("a", "alice"), ("b", "bob")]);
        let (a, b) = (AccountId::from("a"), AccountId::from("b"));
        db.add_to_set(&a, RelationSet::Friends, &b).unwrap();
        db.add_to_set(&b, RelationSet::Friends, &a).unwrap();

        assert!(db.delete_account(&a).unwrap());
        assert!(db.get_account(&a).unwrap().is_none());
        // bob's document is untouched until someone pulls the dangling edge
        assert!(db.get_account(&b).unwrap().unwrap().friends.contains(&a));
    }

    #[test]
    fn usernames_skip_unknown_ids() {
        let db = db_with(&[("a", "alice"), ("b", "bob")]);
        let pairs = db
            .get_usernames(&[AccountId::from("b"), AccountId::from("zz"), AccountId::from("a")])
            .unwrap();
        assert_eq!(
            pairs,
            vec![(AccountId::from("a"), "alice".to_string()), (AccountId::from("b"), "bob".to_string())]
        );
    }
}
