pub mod accounts;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod history;
pub mod identity;
pub mod membership;
pub mod reconcile;
pub mod relationships;
pub mod retry;
mod store;

use std::sync::Arc;

use accord_db::Database;
use accord_gateway::Dispatcher;
use accord_types::{AccountId, ChannelKey};

use crate::coalesce::Coalescer;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use history::Delivery;
pub use membership::NewChannel;
pub use reconcile::{ReconcileReport, Repair, run_reconcile_loop};
pub use retry::RetryPolicy;

/// An account id paired with its current username.
pub type Named = (AccountId, String);

/// The social-graph engine. Cheap to clone; clones share the store, the
/// relay and the read caches.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    db: Arc<Database>,
    relay: Dispatcher,
    config: EngineConfig,
    /// Keyed by the account whose friends are listed.
    friend_reads: Coalescer<AccountId, Vec<Named>>,
    /// Keyed by channel and requester, since membership gates the read.
    member_reads: Coalescer<(ChannelKey, AccountId), Vec<Named>>,
}

impl Engine {
    pub fn new(db: Arc<Database>, relay: Dispatcher, config: EngineConfig) -> Self {
        let ttl = config.read_cache_ttl;
        Self {
            inner: Arc::new(EngineInner {
                db,
                relay,
                config,
                friend_reads: Coalescer::new(ttl),
                member_reads: Coalescer::new(ttl),
            }),
        }
    }

    pub fn relay(&self) -> &Dispatcher {
        &self.inner.relay
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn invalidate_friends(&self, accounts: &[&AccountId]) {
        for account in accounts {
            self.inner.friend_reads.invalidate(account);
        }
    }

    fn invalidate_members(&self, key: &ChannelKey) {
        self.inner.member_reads.invalidate_where(|(k, _)| k == key);
    }
}
