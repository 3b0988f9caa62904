mod search;
pub mod transaction;

pub use transaction::{HookId, MutationHook, Transaction};

use crate::change::{ChangeBroadcast, ChangeEnvelope, ChangeRecord, ChangeRecordDebouncer};
use crate::config::DatabaseConfig;
use crate::error::{LiveDbError, Result};
use crate::model::Model;
use crate::query::sql::{decode_rows, setup_sql};
use crate::query::{Query, QueryBuilder, QueryMode};
use crate::schema::{ModelSchema, ModelType, SchemaRegistry, JSON_BLOB_CLASS};
use crate::store::{Store, StoreStats};
use crate::subscription::{
    BoxFuture, LiveQuery, Observer, QuerySubscriptionPool, RangeFetcher, Unsubscribe,
};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use transaction::{MutationHooks, TransactionQueue};

/// Runs live query windows on the read connection.
struct StoreFetcher {
    store: Arc<Store>,
}

impl RangeFetcher for StoreFetcher {
    fn fetch(&self, query: Query) -> BoxFuture<'static, Result<Vec<Model>>> {
        let store = self.store.clone();
        Box::pin(async move {
            let rows = store.query(query.sql().to_string(), Vec::new()).await?;
            decode_rows(&query, rows)
        })
    }
}

/// What [`Database::run`] returns, by query mode.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Models(Vec<Model>),
    One(Option<Model>),
    Count(u64),
}

/// Input to [`Database::modelify`].
#[derive(Debug, Clone)]
pub enum ModelOrId {
    Id(String),
    Model(Model),
}

impl From<&str> for ModelOrId {
    fn from(id: &str) -> Self {
        ModelOrId::Id(id.to_string())
    }
}

impl From<String> for ModelOrId {
    fn from(id: String) -> Self {
        ModelOrId::Id(id)
    }
}

impl From<Model> for ModelOrId {
    fn from(model: Model) -> Self {
        ModelOrId::Model(model)
    }
}

struct DatabaseInner {
    config: DatabaseConfig,
    registry: Arc<SchemaRegistry>,
    store: Arc<Store>,
    pool: Arc<QuerySubscriptionPool>,
    debouncer: ChangeRecordDebouncer,
    hooks: Arc<MutationHooks>,
    transactions: TransactionQueue,
    listeners: broadcast::Sender<ChangeRecord>,
    origin: String,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Ok(mut receiver) = self.receiver.lock() {
            if let Some(task) = receiver.take() {
                task.abort();
            }
        }
        self.pool.clear();
    }
}

/// Handle to one open database. Clones share everything.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open a database that only hears about its own writes.
    ///
    /// Must run inside a tokio runtime. Live query fetches and teardowns
    /// are spawned on that runtime for the life of the handle, whichever
    /// thread triggers them.
    pub async fn open(config: DatabaseConfig, registry: SchemaRegistry) -> Result<Self> {
        Self::open_inner(config, registry, None).await
    }

    /// Open a database that also exchanges change records with other handles
    /// on the same store through `broadcast`.
    pub async fn open_shared(
        config: DatabaseConfig,
        registry: SchemaRegistry,
        broadcast: Arc<dyn ChangeBroadcast>,
    ) -> Result<Self> {
        Self::open_inner(config, registry, Some(broadcast)).await
    }

    async fn open_inner(
        config: DatabaseConfig,
        registry: SchemaRegistry,
        broadcast: Option<Arc<dyn ChangeBroadcast>>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| LiveDbError::Other("livedb needs a tokio runtime".to_string()))?;
        let registry = Arc::new(registry);
        let store = Arc::new(Store::open(&config)?);
        Self::prepare(&store, &config, &registry).await?;

        let pool = Arc::new(QuerySubscriptionPool::new(
            Arc::new(StoreFetcher {
                store: store.clone(),
            }),
            config.teardown_grace(),
            runtime,
        ));
        let (listeners, _) = broadcast::channel(256);
        let origin = uuid::Uuid::new_v4().to_string();
        let namespace = config.namespace();

        let debouncer = {
            let pool = pool.clone();
            let listeners = listeners.clone();
            let broadcast = broadcast.clone();
            let origin = origin.clone();
            let namespace = namespace.clone();
            ChangeRecordDebouncer::new(config.debounce(), move |record: ChangeRecord| {
                if let Some(broadcast) = &broadcast {
                    let published = ChangeEnvelope::wrap(&namespace, &origin, &record)
                        .and_then(|envelope| broadcast.publish(envelope));
                    if let Err(e) = published {
                        log::warn!("Could not broadcast {} change: {e}", record.class());
                    }
                }
                pool.on_change(&record);
                let _ = listeners.send(record);
            })
        };

        let receiver = broadcast.map(|broadcast| {
            let mut incoming = broadcast.subscribe();
            let pool = pool.clone();
            let listeners = listeners.clone();
            let registry = registry.clone();
            let origin = origin.clone();
            tokio::spawn(async move {
                loop {
                    match incoming.recv().await {
                        Ok(envelope) => match envelope.open(&namespace, &origin, &registry) {
                            Ok(Some(record)) => {
                                pool.on_change(&record);
                                let _ = listeners.send(record);
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Dropping malformed change broadcast: {e}"),
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            log::warn!("Missed {missed} change broadcasts, refreshing live queries");
                            pool.refresh_all();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        let hooks = Arc::new(MutationHooks::default());
        let transactions = TransactionQueue::new(
            store.clone(),
            registry.clone(),
            hooks.clone(),
            debouncer.clone(),
            pool.clone(),
        );

        log::debug!("Opened database {} as {origin}", config.namespace());
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                config,
                registry,
                store,
                pool,
                debouncer,
                hooks,
                transactions,
                listeners,
                origin,
                receiver: Mutex::new(receiver),
            }),
        })
    }

    /// Version check and, on the primary handle, table setup.
    async fn prepare(store: &Store, config: &DatabaseConfig, registry: &Arc<SchemaRegistry>) -> Result<()> {
        let expected = config.version;
        let primary = config.primary;
        let schemas: Vec<Arc<ModelSchema>> = registry.iter().cloned().collect();
        store
            .call(move |connections| {
                let conn = &mut connections.writer;
                let actual = conn.user_version()?;
                let unset_allowed = primary && actual == 0;
                if actual != expected && !unset_allowed {
                    return Err(LiveDbError::SchemaVersionMismatch { actual, expected });
                }
                if primary {
                    for schema in &schemas {
                        for statement in setup_sql(schema) {
                            conn.execute_batch(&statement)?;
                        }
                    }
                    conn.set_user_version(expected)?;
                }
                Ok(())
            })
            .await
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    /// Shorthand for `registry().require(class)`.
    pub fn schema(&self, class: &str) -> Result<Arc<ModelSchema>> {
        self.inner.registry.require(class)
    }

    /// Identifies this handle in change broadcasts.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn stats(&self) -> &Arc<StoreStats> {
        self.inner.store.stats()
    }

    pub fn subscriptions(&self) -> &Arc<QuerySubscriptionPool> {
        &self.inner.pool
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Execute a query against the last committed state.
    pub async fn run(&self, query: &Query) -> Result<QueryOutput> {
        let rows = self
            .inner
            .store
            .query(query.sql().to_string(), Vec::new())
            .await?;
        match query.mode() {
            QueryMode::Count => {
                let count = match rows.first().and_then(|row| row.first()) {
                    Some(SqlValue::Integer(n)) => u64::try_from(*n).unwrap_or(0),
                    _ => 0,
                };
                Ok(QueryOutput::Count(count))
            }
            QueryMode::One => Ok(QueryOutput::One(decode_rows(query, rows)?.into_iter().next())),
            QueryMode::List => Ok(QueryOutput::Models(decode_rows(query, rows)?)),
        }
    }

    pub async fn find_all(&self, query: &Query) -> Result<Vec<Model>> {
        match self.run(query).await? {
            QueryOutput::Models(models) => Ok(models),
            QueryOutput::One(model) => Ok(model.into_iter().collect()),
            QueryOutput::Count(_) => Err(LiveDbError::InvalidQuery(
                "find_all called with a count query".to_string(),
            )),
        }
    }

    /// First result of `query`, whatever its mode.
    pub async fn find_one(&self, query: &Query) -> Result<Option<Model>> {
        let query = match query.mode() {
            QueryMode::Count => {
                return Err(LiveDbError::InvalidQuery(
                    "find_one called with a count query".to_string(),
                ))
            }
            QueryMode::One => query.clone(),
            QueryMode::List => query.with_range(crate::query::QueryRange::new(query.range().offset, 1)),
        };
        Ok(self.find_all(&query).await?.into_iter().next())
    }

    pub async fn count(&self, query: &Query) -> Result<u64> {
        match self.run(query).await? {
            QueryOutput::Count(count) => Ok(count),
            QueryOutput::Models(models) => Ok(models.len() as u64),
            QueryOutput::One(model) => Ok(model.map_or(0, |_| 1)),
        }
    }

    /// Look a model up by class and id.
    pub async fn find(&self, class: &str, id: &str) -> Result<Option<Model>> {
        let query = QueryBuilder::find(self.schema(class)?, id).build()?;
        self.find_one(&query).await
    }

    /// Typed lookup for a [`ModelType`].
    pub async fn find_as<T: ModelType>(&self, id: &str) -> Result<Option<T>> {
        match self.find(T::CLASS, id).await? {
            Some(model) => Ok(Some(model.decode()?)),
            None => Ok(None),
        }
    }

    /// Resolve ids to models, in input order. Models pass through untouched;
    /// ids with no stored model come back as `None`.
    pub async fn modelify(&self, class: &str, items: Vec<ModelOrId>) -> Result<Vec<Option<Model>>> {
        let schema = self.schema(class)?;
        let ids: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                ModelOrId::Id(id) => Some(id.clone()),
                ModelOrId::Model(_) => None,
            })
            .collect();

        let mut found: HashMap<String, Model> = HashMap::new();
        if !ids.is_empty() {
            let id_attribute = schema
                .attribute("id")
                .ok_or_else(|| LiveDbError::Schema(format!("{class} has no id attribute")))?;
            let query = QueryBuilder::find_all(schema.clone())
                .where_(id_attribute.is_in(ids)?)
                .build()?;
            for model in self.find_all(&query).await? {
                found.insert(model.id().to_string(), model);
            }
        }

        Ok(items
            .into_iter()
            .map(|item| match item {
                ModelOrId::Model(model) => Some(model),
                ModelOrId::Id(id) => found.get(&id).cloned(),
            })
            .collect())
    }

    /// The JSON document stored under `id`, if any.
    pub async fn find_json_blob(&self, id: &str) -> Result<Option<Value>> {
        Ok(self
            .find(JSON_BLOB_CLASS, id)
            .await?
            .and_then(|blob| blob.get("json").cloned()))
    }

    // ── Live queries ───────────────────────────────────────────────

    /// Call `observer` with every new result set of `query` until the
    /// returned handle is used to unsubscribe.
    pub fn observe(&self, query: Query, observer: Observer) -> Result<Unsubscribe> {
        self.inner.pool.add(query, observer)
    }

    /// [`observe`](Self::observe) as an async stream.
    pub fn subscribe(&self, query: Query) -> Result<LiveQuery> {
        LiveQuery::open(&self.inner.pool, query)
    }

    /// Every change record, after debouncing, in commit order. Records from
    /// other handles arrive here too when the database is shared.
    pub fn listen(&self) -> broadcast::Receiver<ChangeRecord> {
        self.inner.listeners.subscribe()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Run `body` in a write transaction.
    ///
    /// Transactions are queued and run one at a time. The transaction is
    /// committed even when `body` fails; the failure then comes back as
    /// [`LiveDbError::TransactionBody`]. Calling this from inside a body is
    /// an error.
    pub async fn in_transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.transactions.run(body).await
    }

    pub fn add_mutation_hook(&self, hook: Arc<dyn MutationHook>) -> HookId {
        self.inner.hooks.add(hook)
    }

    pub fn remove_mutation_hook(&self, id: HookId) -> bool {
        self.inner.hooks.remove(id)
    }

    /// Refresh SQLite's statistics for every model table.
    pub async fn analyze(&self) -> Result<()> {
        let classes: Vec<String> = self.inner.registry.classes().map(str::to_string).collect();
        self.inner
            .store
            .call(move |connections| {
                for class in &classes {
                    connections.writer.execute_batch(&format!("ANALYZE `{class}`"))?;
                }
                log::info!("Completed ANALYZE of database");
                Ok(())
            })
            .await
    }

    /// Deliver pending change records now instead of after the debounce
    /// window.
    pub fn flush_changes(&self) {
        self.inner.debouncer.flush();
    }

    /// Drop every live query, deliver pending changes and stop the store
    /// worker. Later calls on any clone fail with [`LiveDbError::Closed`].
    pub fn close(&self) {
        self.inner.pool.clear();
        self.inner.debouncer.flush();
        if let Ok(mut receiver) = self.inner.receiver.lock() {
            if let Some(task) = receiver.take() {
                task.abort();
            }
        }
        self.inner.store.close();
        log::debug!("Closed database {}", self.inner.config.namespace());
    }
}
