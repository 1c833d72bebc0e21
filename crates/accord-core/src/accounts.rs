use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use accord_db::{RelationSet, SetOp, Upsert};
use accord_gateway::connection::SnapshotSource;
use accord_types::AccountId;
use accord_types::models::{Account, AccountSnapshot};

use crate::Engine;
use crate::error::{Error, Result};

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 32;

fn validate_username(raw: &str) -> Result<String> {
    let username = raw.trim();
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(Error::Validation(format!(
            "username must be {}-{} characters",
            USERNAME_MIN_LEN, USERNAME_MAX_LEN
        )));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(Error::Validation("username must not contain whitespace".into()));
    }
    Ok(username.to_string())
}

impl Engine {
    /// Creates the account, or renames it if the provider already knew it.
    pub async fn provision_account(&self, id: &AccountId, username: &str) -> Result<Upsert> {
        if id.is_blank() {
            return Err(Error::Validation("account id must not be blank".into()));
        }
        let username = validate_username(username)?;

        if let Some(holder) = self.account_by_username(&username).await? {
            if holder.id != *id {
                return Err(Error::Conflict(format!("username '{}' is taken", username)));
            }
        }

        let (account, name) = (id.clone(), username.clone());
        let outcome = self
            .store("upsert account", move |db| db.upsert_account(&account, &name))
            .await?;

        match outcome {
            Upsert::Created => info!("Provisioned account {} ({})", username, id),
            Upsert::Renamed => {
                info!("Account {} renamed to {}", id, username);
                // Usernames are denormalised into every cached listing.
                self.inner.friend_reads.clear();
                self.inner.member_reads.clear();
            }
            Upsert::Unchanged => debug!("Account {} already provisioned", id),
        }
        Ok(outcome)
    }

    /// Deletes the account and pulls it out of every counterpart's relation
    /// sets. Channel memberships and history are left in place.
    pub async fn deprovision_account(&self, id: &AccountId) -> Result<bool> {
        let target = id.clone();
        let referencing = self
            .store("find referencing accounts", move |db| db.accounts_referencing(&target))
            .await?;

        for other in &referencing {
            let ops = vec![
                SetOp::Pull(RelationSet::Friends, id.clone()),
                SetOp::Pull(RelationSet::SentPending, id.clone()),
                SetOp::Pull(RelationSet::ReceivedPending, id.clone()),
            ];
            self.update_relations(other, ops).await?;
        }

        let target = id.clone();
        let deleted = self.store("delete account", move |db| db.delete_account(&target)).await?;

        self.inner.friend_reads.clear();
        if deleted {
            info!("Deprovisioned account {} ({} counterparts updated)", id, referencing.len());
        }
        Ok(deleted)
    }

    pub async fn account(&self, id: &AccountId) -> Result<Account> {
        let target = id.clone();
        self.store("load account", move |db| db.get_account(&target))
            .await?
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))
    }

    pub(crate) async fn account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let name = username.to_string();
        self.store("find account by username", move |db| db.get_account_by_username(&name))
            .await
    }

    /// Everything a client needs to rebuild its view of `id`.
    pub async fn account_snapshot(&self, id: &AccountId) -> Result<AccountSnapshot> {
        let account = self.account(id).await?;
        let channels = self.channels_for(id).await?;

        Ok(AccountSnapshot {
            account_id: account.id,
            username: account.username,
            friends: account.friends.into_iter().collect(),
            sent_pending: account.sent_pending.into_iter().collect(),
            received_pending: account.received_pending.into_iter().collect(),
            channels: channels.iter().map(|c| c.summary()).collect(),
        })
    }
}

impl SnapshotSource for Engine {
    fn snapshot(&self, account: AccountId) -> BoxFuture<'static, Option<AccountSnapshot>> {
        let engine = self.clone();
        async move {
            match engine.account_snapshot(&account).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Snapshot for {} failed: {}", account, e);
                    None
                }
            }
        }
        .boxed()
    }
}
