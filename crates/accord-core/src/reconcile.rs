//! Server-side repair of half-applied relationship writes.
//!
//! Relationship transitions write two account documents one after the other.
//! A crash between the two leaves the pair asymmetric. This pass scans every
//! account, finishes or rolls back each interrupted transition, and logs what
//! it changed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use accord_db::{RelationSet, SetOp};
use accord_types::AccountId;
use accord_types::models::Account;

use crate::Engine;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// An account listed itself in one of its own sets.
    SelfEdge { account: AccountId, set: &'static str },
    /// An edge pointed at an account that no longer exists.
    DanglingEdge { account: AccountId, missing: AccountId, set: &'static str },
    /// The accepter recorded the friendship but the requester did not.
    CompletedAccept { requester: AccountId, accepter: AccountId },
    /// One side dropped the friendship and the other did not.
    CompletedRemoval { account: AccountId, former_friend: AccountId },
    /// The sender recorded a request the receiver never saw.
    CompletedRequest { sender: AccountId, receiver: AccountId },
    /// A pending edge that no longer describes an open request.
    DroppedStalePending { account: AccountId, other: AccountId, set: &'static str },
    /// Two friends had no direct-message channel.
    CreatedDirectMessage { a: AccountId, b: AccountId },
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfEdge { account, set } => write!(f, "{} listed itself in {}", account, set),
            Self::DanglingEdge { account, missing, set } => {
                write!(f, "{} referenced deleted account {} in {}", account, missing, set)
            }
            Self::CompletedAccept { requester, accepter } => {
                write!(f, "{} accepted {} but the requester side was not updated", accepter, requester)
            }
            Self::CompletedRemoval { account, former_friend } => {
                write!(f, "{} still listed {} as a friend after removal", account, former_friend)
            }
            Self::CompletedRequest { sender, receiver } => {
                write!(f, "{} sent a request that {} never received", sender, receiver)
            }
            Self::DroppedStalePending { account, other, set } => {
                write!(f, "{} had a stale {} edge to {}", account, set, other)
            }
            Self::CreatedDirectMessage { a, b } => {
                write!(f, "friends {} and {} had no direct message", a, b)
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub repairs: Vec<Repair>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty()
    }
}

const ALL_SETS: [RelationSet; 3] = [
    RelationSet::Friends,
    RelationSet::SentPending,
    RelationSet::ReceivedPending,
];

fn set_of(account: &Account, set: RelationSet) -> &BTreeSet<AccountId> {
    match set {
        RelationSet::Friends => &account.friends,
        RelationSet::SentPending => &account.sent_pending,
        RelationSet::ReceivedPending => &account.received_pending,
    }
}

impl Engine {
    async fn load_all_accounts(&self) -> Result<BTreeMap<AccountId, Account>> {
        let accounts = self.store("list accounts", |db| db.list_accounts()).await?;
        Ok(accounts.into_iter().map(|a| (a.id.clone(), a)).collect())
    }

    async fn apply_repair(&self, report: &mut ReconcileReport, repair: Repair, account: &AccountId, ops: Vec<SetOp>) -> Result<()> {
        warn!("Repaired {}", Error::InvariantViolation(repair.to_string()));
        self.update_relations(account, ops).await?;
        self.invalidate_friends(&[account]);
        report.repairs.push(repair);
        Ok(())
    }

    /// One full pass over every account. Each phase re-reads the store so it
    /// sees the previous phase's repairs.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        // Self edges and edges to deleted accounts.
        let accounts = self.load_all_accounts().await?;
        report.scanned = accounts.len();
        for account in accounts.values() {
            for set in ALL_SETS {
                for other in set_of(account, set) {
                    let repair = if *other == account.id {
                        Repair::SelfEdge { account: account.id.clone(), set: set.as_str() }
                    } else if !accounts.contains_key(other) {
                        Repair::DanglingEdge {
                            account: account.id.clone(),
                            missing: other.clone(),
                            set: set.as_str(),
                        }
                    } else {
                        continue;
                    };
                    self.apply_repair(&mut report, repair, &account.id, vec![SetOp::Pull(set, other.clone())])
                        .await?;
                }
            }
        }

        // Friend symmetry.
        let accounts = self.load_all_accounts().await?;
        for x in accounts.values() {
            for o_id in &x.friends {
                let Some(o) = accounts.get(o_id) else { continue };
                if o.friends.contains(&x.id) {
                    continue;
                }
                if o.sent_pending.contains(&x.id) {
                    // x accepted o's request; o's half never landed.
                    let repair = Repair::CompletedAccept { requester: o.id.clone(), accepter: x.id.clone() };
                    let ops = vec![
                        SetOp::Pull(RelationSet::SentPending, x.id.clone()),
                        SetOp::Pull(RelationSet::ReceivedPending, x.id.clone()),
                        SetOp::Add(RelationSet::Friends, x.id.clone()),
                    ];
                    self.apply_repair(&mut report, repair, &o.id, ops).await?;
                } else {
                    // o removed x; x's half never landed.
                    let repair = Repair::CompletedRemoval { account: x.id.clone(), former_friend: o.id.clone() };
                    self.apply_repair(&mut report, repair, &x.id, vec![SetOp::Pull(RelationSet::Friends, o.id.clone())])
                        .await?;
                }
            }
        }

        // Pending duality.
        let accounts = self.load_all_accounts().await?;
        for x in accounts.values() {
            for o_id in &x.sent_pending {
                let Some(o) = accounts.get(o_id) else { continue };
                if x.friends.contains(o_id) {
                    let repair = Repair::DroppedStalePending {
                        account: x.id.clone(),
                        other: o.id.clone(),
                        set: RelationSet::SentPending.as_str(),
                    };
                    self.apply_repair(&mut report, repair, &x.id, vec![SetOp::Pull(RelationSet::SentPending, o.id.clone())])
                        .await?;
                } else if !o.received_pending.contains(&x.id) {
                    let repair = Repair::CompletedRequest { sender: x.id.clone(), receiver: o.id.clone() };
                    self.apply_repair(&mut report, repair, &o.id, vec![SetOp::Add(RelationSet::ReceivedPending, x.id.clone())])
                        .await?;
                }
            }
            for o_id in &x.received_pending {
                let Some(o) = accounts.get(o_id) else { continue };
                if x.friends.contains(o_id) || !o.sent_pending.contains(&x.id) {
                    let repair = Repair::DroppedStalePending {
                        account: x.id.clone(),
                        other: o.id.clone(),
                        set: RelationSet::ReceivedPending.as_str(),
                    };
                    self.apply_repair(&mut report, repair, &x.id, vec![SetOp::Pull(RelationSet::ReceivedPending, o.id.clone())])
                        .await?;
                }
            }
        }

        // Every pair of friends has a direct message.
        let accounts = self.load_all_accounts().await?;
        for x in accounts.values() {
            for o_id in x.friends.iter().filter(|o| **o > x.id) {
                let Some(o) = accounts.get(o_id) else { continue };
                if !o.friends.contains(&x.id) {
                    continue;
                }
                let key = crate::identity::derive_direct_message_key(&x.id, o_id)?;
                let target = key.clone();
                if self.store("load channel", move |db| db.get_channel(&target)).await?.is_some() {
                    continue;
                }
                let repair = Repair::CreatedDirectMessage { a: x.id.clone(), b: o_id.clone() };
                warn!("Repaired {}", Error::InvariantViolation(repair.to_string()));
                self.ensure_direct_message(&x.id, o_id).await?;
                report.repairs.push(repair);
            }
        }

        Ok(report)
    }
}

/// Background task that runs the reconciliation pass on an interval.
pub async fn run_reconcile_loop(engine: Engine, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        match engine.reconcile().await {
            Ok(report) => {
                if !report.is_clean() {
                    info!(
                        "Reconcile: repaired {} invariant violations across {} accounts",
                        report.repairs.len(),
                        report.scanned
                    );
                }
            }
            Err(e) => {
                warn!("Reconcile error: {}", e);
            }
        }
    }
}
