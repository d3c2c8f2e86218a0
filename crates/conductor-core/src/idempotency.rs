use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use conductor_types::ActionResult;

enum EntryState {
    Inflight(watch::Sender<Option<ActionResult>>),
    Done {
        result: ActionResult,
        completed_at: Instant,
    },
}

/// Outcome of admitting a key.
#[derive(Debug)]
pub enum Admission {
    /// First caller within the TTL window: execute, then `complete` (or
    /// `abandon` on the way out of an aborted path).
    Fresh,
    /// A finished result was already cached for this key.
    Cached(ActionResult),
    /// Another caller was in flight; this is its result.
    Joined(ActionResult),
}

/// At-most-once guard: per idempotency key, the first caller executes and
/// everyone else waits for (or reads) that caller's result until the TTL
/// expires.
#[derive(Clone)]
pub struct IdempotencyGuard {
    entries: Arc<RwLock<HashMap<String, EntryState>>>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn admit(&self, key: &str) -> Admission {
        loop {
            let waiter = {
                let mut entries = self.entries.write().await;
                match entries.get(key) {
                    Some(EntryState::Done {
                        result,
                        completed_at,
                    }) => {
                        if completed_at.elapsed() < self.ttl {
                            return Admission::Cached(result.clone());
                        }
                        // Expired: this caller executes anew.
                        let (tx, _rx) = watch::channel(None);
                        entries.insert(key.to_string(), EntryState::Inflight(tx));
                        return Admission::Fresh;
                    }
                    Some(EntryState::Inflight(tx)) => tx.subscribe(),
                    None => {
                        let (tx, _rx) = watch::channel(None);
                        entries.insert(key.to_string(), EntryState::Inflight(tx));
                        return Admission::Fresh;
                    }
                }
            };

            let mut rx = waiter;
            let joined = loop {
                let current = rx.borrow().clone();
                if let Some(result) = current {
                    break Some(result);
                }
                if rx.changed().await.is_err() {
                    // First caller abandoned without a result; race for the
                    // slot again.
                    break None;
                }
            };
            match joined {
                Some(result) => return Admission::Joined(result),
                None => continue,
            }
        }
    }

    /// Record the result for a key this caller was admitted `Fresh` for and
    /// wake every joiner.
    pub async fn complete(&self, key: &str, result: ActionResult) {
        let mut entries = self.entries.write().await;
        if let Some(EntryState::Inflight(tx)) = entries.insert(
            key.to_string(),
            EntryState::Done {
                result: result.clone(),
                completed_at: Instant::now(),
            },
        ) {
            let _ = tx.send(Some(result));
        }
    }

    /// Drop an in-flight claim without caching anything; joiners re-admit.
    pub async fn abandon(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if matches!(entries.get(key), Some(EntryState::Inflight(_))) {
            entries.remove(key);
        }
    }

    /// Re-seed a `done` entry from the journal. `age` is how long ago the
    /// original execution finished; entries past the TTL are ignored.
    pub async fn restore_done(&self, key: &str, result: ActionResult, age: Duration) -> bool {
        if age >= self.ttl {
            return false;
        }
        let completed_at = Instant::now() - age;
        self.entries.write().await.insert(
            key.to_string(),
            EntryState::Done {
                result,
                completed_at,
            },
        );
        true
    }

    /// Drop expired `done` entries.
    pub async fn purge_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, state| match state {
            EntryState::Inflight(_) => true,
            EntryState::Done { completed_at, .. } => completed_at.elapsed() < self.ttl,
        });
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
