use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use accord_types::AccountId;
use accord_types::events::RelayEvent;

/// Events buffered per subscriber before the slowest one starts lagging.
const RELAY_CAPACITY: usize = 1024;

/// What a subscriber wants to hear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// The raw shared topic: every event.
    All,
    /// Only events that concern this account.
    Account(AccountId),
}

impl Topic {
    fn accepts(&self, event: &RelayEvent) -> bool {
        match self {
            Self::All => true,
            Self::Account(id) => event.is_relevant_to(id),
        }
    }
}

/// The event relay: one shared broadcast topic, filtered per subscriber.
///
/// Delivery is fire-and-forget and at-most-once. A subscriber that is not
/// connected when an event is published never sees it, and a subscriber that
/// falls more than `RELAY_CAPACITY` events behind loses the oldest ones.
/// Clients are expected to poll for snapshots to cover both gaps.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<RelayEvent>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_capacity(RELAY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(DispatcherInner { broadcast_tx }),
        }
    }

    /// Publish an event to whoever is listening right now.
    pub fn publish(&self, event: RelayEvent) {
        let kind = event.kind();
        match self.inner.broadcast_tx.send(event) {
            Ok(n) => debug!("Relayed {} to {} subscribers", kind, n),
            Err(_) => debug!("Relayed {} with no subscribers", kind),
        }
    }

    /// A pull-style subscription.
    pub fn receiver(&self, topic: Topic) -> Subscription {
        Subscription {
            rx: self.inner.broadcast_tx.subscribe(),
            topic,
        }
    }

    /// Runs `handler` on a background task for every matching event until
    /// the returned handle is dropped.
    pub fn subscribe<F>(&self, topic: Topic, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(RelayEvent) + Send + 'static,
    {
        let mut subscription = self.receiver(topic);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
        });
        SubscriptionHandle { task }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<RelayEvent>,
    topic: Topic,
}

impl Subscription {
    /// Next matching event, or `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topic.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!("Relay subscriber lagged by {} events", n);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.topic.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Relay subscriber lagged by {} events", n);
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Keeps a handler subscription alive; dropping it unsubscribes.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
