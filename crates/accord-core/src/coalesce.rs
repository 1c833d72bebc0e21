//! In-flight read coalescing with a soft cache window.
//!
//! Concurrent reads of the same key share one store call. A completed
//! result is reused until the window expires or a write invalidates it.
//! Failures are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::error::{Error, Result};

type SharedFetch<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;

struct Entry<V> {
    fetch: SharedFetch<V>,
    started: Instant,
    generation: u64,
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_generation: u64,
}

pub struct Coalescer<K, V> {
    ttl: Duration,
    state: Mutex<State<K, V>>,
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(State {
                entries: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        // The map holds no invariants a panicking holder could break.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Joins an in-flight or still-fresh read of `key`, or starts one with
    /// `fetch`.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (shared, generation) = {
            let mut state = self.lock();
            let now = Instant::now();

            let reusable = state.entries.get(&key).filter(|entry| match entry.fetch.peek() {
                None => true,
                Some(Ok(_)) => now.duration_since(entry.started) < self.ttl,
                Some(Err(_)) => false,
            });

            match reusable {
                Some(entry) => (entry.fetch.clone(), entry.generation),
                None => {
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    let shared = fetch().map(|r| r.map_err(Arc::new)).boxed().shared();
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            fetch: shared.clone(),
                            started: now,
                            generation,
                        },
                    );
                    (shared, generation)
                }
            }
        };

        let result = shared.await;
        if result.is_err() {
            let mut state = self.lock();
            if state.entries.get(&key).is_some_and(|e| e.generation == generation) {
                state.entries.remove(&key);
            }
        }
        result.map_err(|e| e.duplicate())
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().entries.remove(key);
    }

    pub fn invalidate_where(&self, mut predicate: impl FnMut(&K) -> bool) {
        self.lock().entries.retain(|k, _| !predicate(k));
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
