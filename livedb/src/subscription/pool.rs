use super::{CallbackId, Observer, QuerySubscription, RangeFetcher, UpdateOptions};
use crate::change::ChangeRecord;
use crate::error::{LiveDbError, Result};
use crate::query::{Query, QueryMode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// Shares one [`QuerySubscription`] between every observer of the same
/// query signature. Deliveries and teardowns run on `runtime`.
pub struct QuerySubscriptionPool {
    fetcher: Arc<dyn RangeFetcher>,
    teardown_grace: Duration,
    runtime: Handle,
    subscriptions: Mutex<HashMap<String, Arc<QuerySubscription>>>,
    created: AtomicU64,
    torn_down: AtomicU64,
}

impl QuerySubscriptionPool {
    pub fn new(fetcher: Arc<dyn RangeFetcher>, teardown_grace: Duration, runtime: Handle) -> Self {
        QuerySubscriptionPool {
            fetcher,
            teardown_grace,
            runtime,
            subscriptions: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            torn_down: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<QuerySubscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `observer` for `query`. An observer joining a subscription
    /// that already has results gets the cached set on a later task, before
    /// any newer one.
    pub fn add(self: &Arc<Self>, query: Query, observer: Observer) -> Result<Unsubscribe> {
        if query.mode() == QueryMode::Count {
            return Err(LiveDbError::InvalidQuery(
                "Count queries cannot be observed".to_string(),
            ));
        }
        let signature = query.signature().to_string();

        let (subscription, callback_id, is_new) = {
            let mut subscriptions = self.lock();
            let (subscription, is_new) = match subscriptions.get(&signature) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let created = Arc::new(QuerySubscription::new(
                        query,
                        self.fetcher.clone(),
                        self.runtime.clone(),
                    ));
                    subscriptions.insert(signature.clone(), created.clone());
                    self.created.fetch_add(1, Ordering::Relaxed);
                    (created, true)
                }
            };
            let callback_id = subscription.add_observer(observer);
            (subscription, callback_id, is_new)
        };

        if is_new {
            log::debug!("Starting live query {signature}");
            subscription.start();
        } else if subscription.last_result().is_some() {
            let cached = subscription.clone();
            self.runtime.spawn(async move { cached.deliver_cached(callback_id) });
        }

        Ok(Unsubscribe {
            pool: Arc::downgrade(self),
            signature,
            callback_id,
            done: AtomicBool::new(false),
        })
    }

    fn remove(self: &Arc<Self>, signature: &str, callback_id: CallbackId) {
        let subscription = {
            let subscriptions = self.lock();
            match subscriptions.get(signature) {
                Some(subscription) => subscription.clone(),
                None => return,
            }
        };
        subscription.remove_observer(callback_id);
        if subscription.observer_count() > 0 {
            return;
        }

        let pool = Arc::downgrade(self);
        let signature = signature.to_string();
        let grace = self.teardown_grace;
        self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(pool) = pool.upgrade() {
                pool.teardown(&signature, &subscription);
            }
        });
    }

    /// Dispose `subscription` unless it was reused or replaced meanwhile.
    fn teardown(&self, signature: &str, subscription: &Arc<QuerySubscription>) {
        let mut subscriptions = self.lock();
        let current = match subscriptions.get(signature) {
            Some(current) if Arc::ptr_eq(current, subscription) => current,
            _ => return,
        };
        if current.observer_count() > 0 {
            return;
        }
        current.dispose();
        subscriptions.remove(signature);
        self.torn_down.fetch_add(1, Ordering::Relaxed);
        log::debug!("Tore down live query {signature}");
    }

    /// Offer a committed change record to every live subscription.
    pub fn on_change(&self, record: &ChangeRecord) {
        for subscription in self.snapshot() {
            subscription.apply_change_record(record);
        }
    }

    /// Refetch every subscription, for when change records may have been
    /// missed.
    pub fn refresh_all(&self) {
        for subscription in self.snapshot() {
            subscription.update(UpdateOptions::refetch());
        }
    }

    /// Dispose everything. Used when the database closes.
    pub fn clear(&self) {
        let drained: Vec<Arc<QuerySubscription>> = self.lock().drain().map(|(_, s)| s).collect();
        for subscription in drained {
            subscription.dispose();
        }
    }

    fn snapshot(&self) -> Vec<Arc<QuerySubscription>> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, signature: &str) -> Option<Arc<QuerySubscription>> {
        self.lock().get(signature).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Subscriptions created since the pool was built.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Subscriptions disposed after losing their last observer.
    pub fn torn_down_count(&self) -> u64 {
        self.torn_down.load(Ordering::Relaxed)
    }
}

/// Removes one observer from the pool. Calling it more than once does
/// nothing.
#[must_use = "dropping an Unsubscribe without calling it keeps the observer registered"]
pub struct Unsubscribe {
    pool: Weak<QuerySubscriptionPool>,
    signature: String,
    callback_id: CallbackId,
    done: AtomicBool,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.remove(&self.signature, self.callback_id);
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("signature", &self.signature)
            .field("callback_id", &self.callback_id)
            .finish()
    }
}
