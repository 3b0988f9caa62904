pub mod live_query;
pub mod pool;

pub use live_query::LiveQuery;
pub use pool::{QuerySubscriptionPool, Unsubscribe};

use crate::change::{ChangeKind, ChangeRecord};
use crate::error::{LiveDbError, Result};
use crate::model::Model;
use crate::query::{MutableResultSet, Query, QueryRange, QueryResultSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ResultCallback = Arc<dyn Fn(Arc<QueryResultSet>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&LiveDbError) + Send + Sync>;

/// Runs a query window against the store.
pub trait RangeFetcher: Send + Sync {
    fn fetch(&self, query: Query) -> BoxFuture<'static, Result<Vec<Model>>>;
}

/// Callbacks registered on a live query. Errors never reach `on_result`.
#[derive(Clone)]
pub struct Observer {
    on_result: ResultCallback,
    on_error: Option<ErrorCallback>,
}

impl Observer {
    pub fn new(on_result: impl Fn(Arc<QueryResultSet>) + Send + Sync + 'static) -> Self {
        Observer {
            on_result: Arc::new(on_result),
            on_error: None,
        }
    }

    pub fn on_error(mut self, on_error: impl Fn(&LiveDbError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

pub type CallbackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Initializing,
    Ready,
    Updating,
    Disposed,
}

/// What [`QuerySubscription::apply_change_record`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Other class, or the subscription is disposed.
    Ignored,
    /// Nothing in the window was affected.
    Unchanged,
    /// Models were replaced or inserted without touching the store.
    UpdatedInPlace,
    /// Membership or order may have changed; a fetch was scheduled.
    RefetchScheduled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub must_refetch_entire_range: bool,
}

impl UpdateOptions {
    pub fn refetch() -> Self {
        UpdateOptions {
            must_refetch_entire_range: true,
        }
    }

    fn merge(self, other: UpdateOptions) -> Self {
        UpdateOptions {
            must_refetch_entire_range: self.must_refetch_entire_range
                || other.must_refetch_entire_range,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FetchPlan {
    Full(QueryRange),
    Splice(QueryRange),
}

impl FetchPlan {
    fn range(&self) -> QueryRange {
        match self {
            FetchPlan::Full(range) | FetchPlan::Splice(range) => *range,
        }
    }
}

struct ObserverEntry {
    id: CallbackId,
    observer: Observer,
    delivered_version: u64,
}

struct Inner {
    disposed: bool,
    in_flight: bool,
    set: Option<MutableResultSet>,
    observers: Vec<ObserverEntry>,
    next_callback_id: CallbackId,
    pending: Option<UpdateOptions>,
    version: u64,
    last_result: Option<Arc<QueryResultSet>>,
    fetch_token: u64,
}

impl Inner {
    fn state(&self) -> SubscriptionState {
        if self.disposed {
            SubscriptionState::Disposed
        } else if self.set.is_none() {
            SubscriptionState::Initializing
        } else if self.in_flight {
            SubscriptionState::Updating
        } else {
            SubscriptionState::Ready
        }
    }

    fn defer(&mut self, options: UpdateOptions) {
        self.pending = Some(self.pending.unwrap_or_default().merge(options));
    }

    /// Bump the version and publish the current window as the latest result.
    fn publish(&mut self, offset: u64) -> Arc<QueryResultSet> {
        self.version += 1;
        let version = self.version;
        let snapshot = Arc::new(match &self.set {
            Some(set) => set.immutable(version),
            None => {
                let mut empty = QueryResultSet::empty(offset);
                empty.version = version;
                empty
            }
        });
        self.last_result = Some(snapshot.clone());
        snapshot
    }
}

/// Keeps one query's window current. Fetches are spawned on `runtime`, so
/// any thread may drive it.
pub struct QuerySubscription {
    query: Query,
    fetcher: Arc<dyn RangeFetcher>,
    runtime: Handle,
    inner: Mutex<Inner>,
    delivery: Mutex<()>,
}

impl QuerySubscription {
    pub fn new(query: Query, fetcher: Arc<dyn RangeFetcher>, runtime: Handle) -> Self {
        QuerySubscription {
            query,
            fetcher,
            runtime,
            inner: Mutex::new(Inner {
                disposed: false,
                in_flight: false,
                set: None,
                observers: Vec::new(),
                next_callback_id: 1,
                pending: None,
                version: 0,
                last_result: None,
                fetch_token: 0,
            }),
            delivery: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn state(&self) -> SubscriptionState {
        self.lock().state()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn last_result(&self) -> Option<Arc<QueryResultSet>> {
        self.lock().last_result.clone()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Issue the initial fetch.
    pub fn start(self: &Arc<Self>) {
        self.update(UpdateOptions::default());
    }

    pub fn add_observer(&self, observer: Observer) -> CallbackId {
        let mut inner = self.lock();
        let id = inner.next_callback_id;
        inner.next_callback_id += 1;
        inner.observers.push(ObserverEntry {
            id,
            observer,
            delivered_version: 0,
        });
        id
    }

    pub fn remove_observer(&self, id: CallbackId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|entry| entry.id != id);
        inner.observers.len() != before
    }

    /// Hand the latest result to one observer, unless it already has it.
    pub fn deliver_cached(&self, id: CallbackId) {
        if let Some(result) = self.last_result() {
            self.deliver(result, Some(id));
        }
    }

    /// Stop for good. Safe to call repeatedly and while a fetch is in flight;
    /// that fetch's result is dropped when it lands.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        inner.disposed = true;
        inner.observers.clear();
        inner.pending = None;
    }

    /// Apply a change record to the window.
    pub fn apply_change_record(self: &Arc<Self>, record: &ChangeRecord) -> ChangeOutcome {
        if record.class() != self.query.class() || record.is_empty() {
            return ChangeOutcome::Ignored;
        }

        let mut inner = self.lock();
        if inner.disposed {
            return ChangeOutcome::Ignored;
        }
        if inner.in_flight {
            // The fetch in flight may have read the store before this
            // commit; check again once it lands.
            inner.defer(UpdateOptions::refetch());
            return ChangeOutcome::RefetchScheduled;
        }
        if inner.set.is_none() {
            // the initial fetch failed; this is the retry
            drop(inner);
            self.update(UpdateOptions::refetch());
            return ChangeOutcome::RefetchScheduled;
        }

        let (must_update, changed) = match inner.set.as_mut() {
            Some(set) => self.apply_to_set(set, record),
            None => (true, false),
        };
        if must_update {
            drop(inner);
            self.update(UpdateOptions::refetch());
            return ChangeOutcome::RefetchScheduled;
        }
        if !changed {
            return ChangeOutcome::Unchanged;
        }
        let snapshot = inner.publish(self.query.range().offset);
        drop(inner);
        self.deliver(snapshot, None);
        ChangeOutcome::UpdatedInPlace
    }

    /// Returns `(must_update, changed_in_place)`.
    fn apply_to_set(&self, set: &mut MutableResultSet, record: &ChangeRecord) -> (bool, bool) {
        let query = &self.query;
        let range = query.range();
        let whole_result = range.is_infinite() && range.offset == 0 && !query.is_searching();
        let mut must_update = false;
        let mut changed = false;

        for model in record.objects() {
            let present = set.contains_id(model.id());
            match record.kind() {
                ChangeKind::Unpersist => {
                    if present {
                        set.remove_model(model.id());
                        must_update = true;
                    }
                }
                ChangeKind::Persist => {
                    if !query.matches(model) {
                        if present {
                            set.remove_model(model.id());
                            must_update = true;
                        }
                        continue;
                    }
                    if !present {
                        let loaded = self.as_fetched(model, None);
                        match loaded {
                            Some(next) if whole_result && set.is_complete() => {
                                set.insert_sorted(next, |a, b| query.compare(a, b));
                                changed = true;
                            }
                            _ => must_update = true,
                        }
                        continue;
                    }
                    let Some(old) = set.model_with_id(model.id()) else {
                        must_update = true;
                        continue;
                    };
                    if !query.same_sort_keys(old, model) {
                        must_update = true;
                        continue;
                    }
                    match self.as_fetched(model, Some(old)) {
                        Some(next) => {
                            set.update_model(next);
                            changed = true;
                        }
                        None => must_update = true,
                    }
                }
            }
        }
        (must_update, changed)
    }

    /// `model` as a fetch of this query would return it: joined data the
    /// query doesn't include is dropped, and included joined data the
    /// record lacks is taken from `old`. `None` when that value can only
    /// come from the store.
    fn as_fetched(&self, model: &Model, old: Option<&Model>) -> Option<Model> {
        let mut next = model.clone();
        for attribute in model.schema().joined_attributes() {
            let key = attribute.model_key();
            let included = self
                .query
                .includes()
                .iter()
                .any(|include| include.model_key() == key);
            if !included {
                next.unset_loaded(key);
            } else if next.get(key).is_none() {
                let value = old?.get(key)?;
                next.set_loaded(key, value.clone());
            }
        }
        Some(next)
    }

    /// Bring the window up to date, fetching only what is missing unless a
    /// full refetch is requested. While a fetch is in flight the request is
    /// folded into a pending update instead.
    pub fn update(self: &Arc<Self>, options: UpdateOptions) {
        let mut inner = self.lock();
        if inner.disposed {
            return;
        }
        if inner.in_flight {
            inner.defer(options);
            return;
        }

        // Unbounded queries always fetch everything from their offset.
        let desired = self.query.range();
        let plan = match &inner.set {
            Some(set) if !options.must_refetch_entire_range && !desired.is_infinite() => {
                let covered = set.range().unwrap_or(QueryRange::new(desired.offset, 0));
                match QueryRange::subtract(&covered, &desired).as_slice() {
                    [] => None,
                    [only] => Some(FetchPlan::Splice(*only)),
                    _ => Some(FetchPlan::Full(desired)),
                }
            }
            _ => Some(FetchPlan::Full(desired)),
        };

        let Some(plan) = plan else {
            let snapshot = inner.publish(desired.offset);
            drop(inner);
            self.deliver(snapshot, None);
            return;
        };

        inner.in_flight = true;
        inner.fetch_token += 1;
        let token = inner.fetch_token;
        drop(inner);

        let fetch = self.fetcher.fetch(self.query.with_range(plan.range()));
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = fetch.await;
            this.on_fetch_completed(token, plan, result);
        });
    }

    fn on_fetch_completed(self: &Arc<Self>, token: u64, plan: FetchPlan, result: Result<Vec<Model>>) {
        let mut inner = self.lock();
        if inner.disposed || token != inner.fetch_token {
            log::debug!("Dropping stale fetch result for {}", self.query);
            return;
        }
        inner.in_flight = false;
        let follow_up = inner.pending.take();

        let models = match result {
            Ok(models) => models,
            Err(error) => {
                let callbacks: Vec<ErrorCallback> = inner
                    .observers
                    .iter()
                    .filter_map(|entry| entry.observer.on_error.clone())
                    .collect();
                drop(inner);
                if callbacks.is_empty() {
                    log::error!("Live query failed: {error}");
                }
                for callback in callbacks {
                    callback(&error);
                }
                if let Some(options) = follow_up {
                    self.update(options);
                }
                return;
            }
        };

        let desired = self.query.range();
        let set = inner.set.get_or_insert_with(MutableResultSet::new);
        match plan {
            FetchPlan::Full(range) => {
                *set = MutableResultSet::new();
                if let Err(e) = set.add_models_in_range(models, &range) {
                    log::error!("Could not apply fetch for {}: {e}", self.query);
                }
            }
            FetchPlan::Splice(range) => {
                if let Err(e) = set.add_models_in_range(models, &range) {
                    log::warn!("Splice failed for {}, refetching: {e}", self.query);
                    drop(inner);
                    self.update(follow_up.unwrap_or_default().merge(UpdateOptions::refetch()));
                    return;
                }
                set.clip_to_range(&desired);
            }
        }
        let snapshot = inner.publish(desired.offset);
        drop(inner);

        self.deliver(snapshot, None);
        if let Some(options) = follow_up {
            self.update(options);
        }
    }

    /// Hand a snapshot to observers that haven't seen it. An observer never
    /// receives a snapshot older than one it already got.
    fn deliver(&self, snapshot: Arc<QueryResultSet>, only: Option<CallbackId>) {
        let _ordered = self.delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let callbacks: Vec<ResultCallback> = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            inner
                .observers
                .iter_mut()
                .filter(|entry| only.map_or(true, |id| entry.id == id))
                .filter(|entry| entry.delivered_version < snapshot.version())
                .map(|entry| {
                    entry.delivered_version = snapshot.version();
                    entry.observer.on_result.clone()
                })
                .collect()
        };
        for callback in callbacks {
            callback(snapshot.clone());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::query::QueryBuilder;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn ids(set: &QueryResultSet) -> Vec<String> {
        set.ids().to_vec()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Arc<QueryResultSet>>) -> Arc<QueryResultSet> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for results")
            .expect("observer channel closed")
    }

    fn observe(
        subscription: &Arc<QuerySubscription>,
    ) -> (CallbackId, mpsc::UnboundedReceiver<Arc<QueryResultSet>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = subscription.add_observer(Observer::new(move |set| {
            let _ = tx.send(set);
        }));
        (id, rx)
    }

    fn windowed_query() -> Query {
        let schema = thread_schema();
        QueryBuilder::find_all(schema.clone())
            .where_(schema.attribute("accountId").unwrap().equal("a").unwrap())
            .order(schema.attribute("ts").unwrap().descending())
            .limit(4)
            .offset(2)
            .build()
            .unwrap()
    }

    fn windowed_table() -> TableFetcher {
        TableFetcher::with_rows(vec![
            thread("6", "a", 6.0),
            thread("5", "a", 5.0),
            thread("4", "a", 4.0),
            thread("3", "a", 3.0),
            thread("2", "a", 2.0),
            thread("1", "a", 1.0),
            thread("x", "b", 4.5),
        ])
    }

    async fn started(
        query: Query,
        table: &TableFetcher,
    ) -> (Arc<QuerySubscription>, mpsc::UnboundedReceiver<Arc<QueryResultSet>>) {
        let subscription = Arc::new(QuerySubscription::new(query, Arc::new(table.clone()), Handle::current()));
        let (_, mut rx) = observe(&subscription);
        assert_eq!(subscription.state(), SubscriptionState::Initializing);
        subscription.start();
        next(&mut rx).await;
        (subscription, rx)
    }

    #[tokio::test]
    async fn test_initial_fetch_fills_window() {
        let table = windowed_table();
        let subscription = Arc::new(QuerySubscription::new(windowed_query(), Arc::new(table.clone()), Handle::current()));
        let (_, mut rx) = observe(&subscription);
        subscription.start();
        let first = next(&mut rx).await;
        assert_eq!(ids(&first), vec!["4", "3", "2", "1"]);
        assert_eq!(first.offset(), 2);
        assert!(first.is_complete());
        assert_eq!(table.requests(), vec![QueryRange::new(2, 4)]);
        assert_eq!(subscription.state(), SubscriptionState::Ready);
    }

    #[tokio::test]
    async fn test_content_change_is_applied_in_place() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;

        let renamed = thread("4", "a", 4.0).with("subject", "renamed");
        table.upsert(renamed.clone());
        let outcome = subscription.apply_change_record(&ChangeRecord::persist(renamed));
        assert_eq!(outcome, ChangeOutcome::UpdatedInPlace);

        let set = next(&mut rx).await;
        assert_eq!(ids(&set), vec!["4", "3", "2", "1"]);
        assert_eq!(set.model_with_id("4").unwrap().str("subject"), Some("renamed"));
        assert_eq!(table.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_new_member_in_window_refetches() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;

        let inserted = thread("5b", "a", 3.5);
        table.upsert(inserted.clone());
        let outcome = subscription.apply_change_record(&ChangeRecord::persist(inserted));
        assert_eq!(outcome, ChangeOutcome::RefetchScheduled);

        let set = next(&mut rx).await;
        assert_eq!(ids(&set), vec!["4", "5b", "3", "2"]);
        assert_eq!(table.requests(), vec![QueryRange::new(2, 4), QueryRange::new(2, 4)]);
    }

    #[tokio::test]
    async fn test_unpersist_of_member_refetches() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;

        table.remove("4");
        let outcome = subscription.apply_change_record(&ChangeRecord::unpersist(thread("4", "a", 4.0)));
        assert_eq!(outcome, ChangeOutcome::RefetchScheduled);
        assert_eq!(ids(&*next(&mut rx).await), vec!["3", "2", "1"]);
    }

    #[tokio::test]
    async fn test_irrelevant_changes() {
        let table = windowed_table();
        let (subscription, _rx) = started(windowed_query(), &table).await;

        let other_account = thread("9", "b", 3.5);
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::persist(other_account.clone())),
            ChangeOutcome::Unchanged
        );
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::unpersist(other_account)),
            ChangeOutcome::Unchanged
        );
        let schema = Arc::new(
            crate::schema::ModelSchema::builder("Message").build().unwrap(),
        );
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::persist(Model::with_id(schema, "m"))),
            ChangeOutcome::Ignored
        );
        assert_eq!(table.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_member_leaving_or_reordering_refetches() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;

        let moved = thread("3", "b", 3.0);
        table.upsert(moved.clone());
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::persist(moved)),
            ChangeOutcome::RefetchScheduled
        );
        assert_eq!(ids(&*next(&mut rx).await), vec!["4", "2", "1"]);

        let bumped = thread("1", "a", 10.0);
        table.upsert(bumped.clone());
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::persist(bumped)),
            ChangeOutcome::RefetchScheduled
        );
        assert_eq!(ids(&*next(&mut rx).await), vec!["5", "4", "2"]);
    }

    #[tokio::test]
    async fn test_unbounded_update_fetches_superset() {
        let schema = thread_schema();
        let rows: Vec<Model> = (0..50).map(|i| thread(&format!("t{i:02}"), "a", i as f64)).collect();
        let table = TableFetcher::with_rows(rows);
        let query = QueryBuilder::find_all(schema).build().unwrap();
        let (subscription, mut rx) = started(query, &table).await;

        subscription.update(UpdateOptions::default());
        let set = next(&mut rx).await;
        assert_eq!(set.count(), 50);
        assert_eq!(table.requests(), vec![QueryRange::infinite(), QueryRange::infinite()]);
    }

    #[tokio::test]
    async fn test_unbounded_query_inserts_new_member_in_place() {
        let schema = thread_schema();
        let table = TableFetcher::with_rows(vec![thread("1", "a", 1.0), thread("3", "a", 3.0)]);
        let query = QueryBuilder::find_all(schema).build().unwrap();
        let (subscription, mut rx) = started(query, &table).await;

        let inserted = thread("2", "a", 2.0);
        table.upsert(inserted.clone());
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::persist(inserted)),
            ChangeOutcome::UpdatedInPlace
        );
        assert_eq!(ids(&*next(&mut rx).await), vec!["3", "2", "1"]);
        assert_eq!(table.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_short_window_fetches_only_the_missing_tail() {
        let table = windowed_table();
        table.remove("6");
        let (subscription, mut rx) = started(windowed_query(), &table).await;
        assert_eq!(ids(&subscription.last_result().unwrap()), vec!["3", "2", "1"]);

        table.upsert(thread("0", "a", 0.5));
        subscription.update(UpdateOptions::default());
        let set = next(&mut rx).await;
        assert_eq!(ids(&set), vec!["3", "2", "1", "0"]);
        assert_eq!(set.offset(), 2);
        assert!(set.model_with_id("0").is_some());
        assert_eq!(table.requests(), vec![QueryRange::new(2, 4), QueryRange::new(5, 1)]);

        // Nothing missing: the window is republished without a fetch.
        subscription.update(UpdateOptions::default());
        assert_eq!(ids(&*next(&mut rx).await), vec!["3", "2", "1", "0"]);
        assert_eq!(table.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_splice_refetches_whole_window() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;

        // A window that no longer touches the desired range can't take a splice.
        let mut displaced = MutableResultSet::new();
        displaced
            .add_models_in_range(vec![thread("6", "a", 6.0), thread("5", "a", 5.0)], &QueryRange::new(7, 2))
            .unwrap();
        subscription.lock().set = Some(displaced);

        subscription.update(UpdateOptions::default());
        let set = next(&mut rx).await;
        assert_eq!(ids(&set), vec!["4", "3", "2", "1"]);
        assert_eq!(set.offset(), 2);
        settle(&subscription).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(
            table.requests(),
            vec![QueryRange::new(2, 4), QueryRange::new(2, 4), QueryRange::new(2, 4)]
        );
    }

    #[tokio::test]
    async fn test_record_during_fetch_triggers_recheck() {
        let table = windowed_table();
        let gate = table.close_gate();
        let subscription = Arc::new(QuerySubscription::new(windowed_query(), Arc::new(table.clone()), Handle::current()));
        let (_, mut rx) = observe(&subscription);
        subscription.start();

        // Committed after the fetch read the table.
        let inserted = thread("5b", "a", 3.5);
        table.upsert(inserted.clone());
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::persist(inserted)),
            ChangeOutcome::RefetchScheduled
        );
        table.open_gate();
        gate.add_permits(10);

        assert_eq!(ids(&*next(&mut rx).await), vec!["4", "3", "2", "1"]);
        assert_eq!(ids(&*next(&mut rx).await), vec!["4", "5b", "3", "2"]);
        assert_eq!(table.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_updates_coalesce_while_in_flight() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;

        let gate = table.close_gate();
        subscription.update(UpdateOptions::refetch());
        assert_eq!(subscription.state(), SubscriptionState::Updating);
        subscription.update(UpdateOptions::refetch());
        subscription.update(UpdateOptions::default());
        table.open_gate();
        gate.add_permits(10);

        next(&mut rx).await;
        next(&mut rx).await;
        settle(&subscription).await;
        assert_eq!(table.requests().len(), 3);
        assert_eq!(subscription.version(), 3);
    }

    #[tokio::test]
    async fn test_update_from_plain_thread() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;

        table.upsert(thread("7", "a", 7.0));
        let remote = subscription.clone();
        std::thread::spawn(move || remote.update(UpdateOptions::refetch()))
            .join()
            .unwrap();
        assert_eq!(ids(&*next(&mut rx).await), vec!["5", "4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_dispose_discards_in_flight_result() {
        let table = windowed_table();
        let gate = table.close_gate();
        let subscription = Arc::new(QuerySubscription::new(windowed_query(), Arc::new(table.clone()), Handle::current()));
        let (_, mut rx) = observe(&subscription);
        subscription.start();

        subscription.dispose();
        subscription.dispose();
        assert_eq!(subscription.state(), SubscriptionState::Disposed);
        gate.add_permits(10);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx.try_recv().is_err());
        assert!(subscription.last_result().is_none());
        assert_eq!(
            subscription.apply_change_record(&ChangeRecord::persist(thread("4", "a", 4.0))),
            ChangeOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_fetch_error_goes_to_error_channel() {
        let table = windowed_table();
        let (subscription, mut rx) = started(windowed_query(), &table).await;
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        subscription.add_observer(
            Observer::new(|_| {}).on_error(move |e| {
                let _ = err_tx.send(e.to_string());
            }),
        );

        table.set_failing(true);
        subscription.update(UpdateOptions::refetch());
        let message = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.contains("store unavailable"));
        assert!(rx.try_recv().is_err());
        assert_eq!(subscription.state(), SubscriptionState::Ready);
        assert_eq!(ids(&subscription.last_result().unwrap()), vec!["4", "3", "2", "1"]);

        table.set_failing(false);
        subscription.update(UpdateOptions::refetch());
        assert_eq!(ids(&*next(&mut rx).await), vec!["4", "3", "2", "1"]);
    }

    /// Random writes applied through change records always settle to what a
    /// fresh query returns for the same window.
    #[tokio::test]
    async fn test_incremental_results_match_fresh_fetch() {
        let schema = thread_schema();
        let queries = vec![
            windowed_query(),
            QueryBuilder::find_all(schema.clone()).build().unwrap(),
            QueryBuilder::find_all(schema.clone())
                .where_(schema.attribute("accountId").unwrap().equal("a").unwrap())
                .limit(3)
                .build()
                .unwrap(),
        ];

        for query in queries {
            let table = windowed_table();
            let (subscription, _rx) = started(query.clone(), &table).await;
            let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
            for step in 0..60 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let id = format!("{}", seed % 9);
                let account = if seed % 3 == 0 { "b" } else { "a" };
                let ts = (seed % 11) as f64;
                let record = if seed % 5 == 0 {
                    table.remove(&id);
                    ChangeRecord::unpersist(thread(&id, account, ts))
                } else {
                    let model = if seed % 2 == 0 {
                        thread(&id, account, ts)
                    } else {
                        thread(&id, account, ts).with("subject", format!("edit {step}"))
                    };
                    table.upsert(model.clone());
                    ChangeRecord::persist(model)
                };
                subscription.apply_change_record(&record);
                settle(&subscription).await;

                let expected: Vec<Model> = table.evaluate(&query);
                let actual = subscription.last_result().unwrap();
                let actual_models: Vec<Model> = actual.models().into_iter().cloned().collect();
                assert_eq!(actual_models, expected, "step {step} of {query}");
            }
        }
    }
}
