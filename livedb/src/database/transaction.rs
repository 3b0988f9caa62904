use crate::change::{ChangeKind, ChangeRecord, ChangeRecordDebouncer};
use crate::error::{LiveDbError, Result};
use crate::model::Model;
use crate::query::sql::{persist_commands, unpersist_commands};
use crate::schema::{SchemaRegistry, JSON_BLOB_CLASS};
use crate::store::{Store, StoreConnection};
use crate::subscription::QuerySubscriptionPool;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

tokio::task_local! {
    static IN_TRANSACTION: ();
}

/// Observes every write made through a [`Transaction`].
///
/// Both methods run on the store worker inside the open transaction, so they
/// can issue statements of their own through `conn`. An error aborts the
/// write and surfaces from the transaction body.
pub trait MutationHook: Send + Sync {
    fn before_database_change(&self, _conn: &mut StoreConnection, _record: &ChangeRecord) -> Result<()> {
        Ok(())
    }

    fn after_database_change(&self, _conn: &mut StoreConnection, _record: &ChangeRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
pub(crate) struct MutationHooks {
    hooks: RwLock<Vec<(HookId, Arc<dyn MutationHook>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl MutationHooks {
    pub(crate) fn add(&self, hook: Arc<dyn MutationHook>) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.push((id, hook));
        }
        id
    }

    pub(crate) fn remove(&self, id: HookId) -> bool {
        match self.hooks.write() {
            Ok(mut hooks) => {
                let before = hooks.len();
                hooks.retain(|(hook_id, _)| *hook_id != id);
                hooks.len() != before
            }
            Err(_) => false,
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn MutationHook>> {
        match self.hooks.read() {
            Ok(hooks) => hooks.iter().map(|(_, hook)| hook.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Handle passed to a transaction body. Cloning it is cheap; every clone
/// writes into the same transaction.
#[derive(Clone)]
pub struct Transaction {
    store: Arc<Store>,
    registry: Arc<SchemaRegistry>,
    hooks: Arc<Vec<Arc<dyn MutationHook>>>,
    changes: Arc<Mutex<Vec<ChangeRecord>>>,
}

impl Transaction {
    pub async fn persist_model(&self, model: Model) -> Result<()> {
        self.persist_models(vec![model]).await
    }

    /// Write models of one class.
    pub async fn persist_models(&self, models: Vec<Model>) -> Result<()> {
        self.write(ChangeKind::Persist, models).await
    }

    pub async fn unpersist_model(&self, model: Model) -> Result<()> {
        self.unpersist_models(vec![model]).await
    }

    /// Remove models of one class.
    pub async fn unpersist_models(&self, models: Vec<Model>) -> Result<()> {
        self.write(ChangeKind::Unpersist, models).await
    }

    /// Store an arbitrary JSON document under `id`.
    pub async fn persist_json_blob(&self, id: &str, json: Value) -> Result<()> {
        let schema = self.registry.require(JSON_BLOB_CLASS)?;
        self.persist_model(Model::with_id(schema, id).with("json", json)).await
    }

    /// Run a raw statement inside the transaction. Live queries are not told
    /// about it.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<usize> {
        self.store.execute(sql.to_string(), params).await
    }

    async fn write(&self, kind: ChangeKind, models: Vec<Model>) -> Result<()> {
        let Some(first) = models.first() else {
            return Ok(());
        };
        let class = first.class().to_string();
        let record = ChangeRecord::new(&class, kind, models).map_err(|_| {
            LiveDbError::InvalidQuery(format!(
                "persist/unpersist takes models of one class, expected {class}"
            ))
        })?;

        let hooks = self.hooks.clone();
        let record = self
            .store
            .call(move |connections| {
                let conn = &mut connections.writer;
                for hook in hooks.iter() {
                    hook.before_database_change(conn, &record)?;
                }
                for model in record.objects() {
                    let commands = match kind {
                        ChangeKind::Persist => persist_commands(model)?,
                        ChangeKind::Unpersist => unpersist_commands(model),
                    };
                    for command in &commands {
                        conn.execute_command(command)?;
                    }
                }
                for hook in hooks.iter() {
                    hook.after_database_change(conn, &record)?;
                }
                Ok(record)
            })
            .await?;

        if let Ok(mut changes) = self.changes.lock() {
            match changes.last_mut() {
                Some(last) if last.can_append(&record) => last.append(record)?,
                _ => changes.push(record),
            }
        }
        Ok(())
    }
}

/// Commits on the worker if a transaction future is dropped mid-body.
struct CommitGuard {
    store: Arc<Store>,
    pool: Arc<QuerySubscriptionPool>,
    armed: bool,
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("Transaction dropped before it finished, committing");
        let queued = self.store.call_detached(|connections| {
            if connections.writer.in_transaction() {
                if let Err(e) = connections.writer.commit() {
                    log::error!("Commit of abandoned transaction failed: {e}");
                    let _ = connections.writer.rollback();
                }
            }
        });
        if queued.is_err() {
            return;
        }
        // Its change records are lost; refetching queues behind the commit.
        self.pool.refresh_all();
    }
}

pub(crate) struct TransactionQueue {
    turn: tokio::sync::Mutex<()>,
    store: Arc<Store>,
    registry: Arc<SchemaRegistry>,
    hooks: Arc<MutationHooks>,
    debouncer: ChangeRecordDebouncer,
    pool: Arc<QuerySubscriptionPool>,
}

impl TransactionQueue {
    pub(crate) fn new(
        store: Arc<Store>,
        registry: Arc<SchemaRegistry>,
        hooks: Arc<MutationHooks>,
        debouncer: ChangeRecordDebouncer,
        pool: Arc<QuerySubscriptionPool>,
    ) -> Self {
        TransactionQueue {
            turn: tokio::sync::Mutex::new(()),
            store,
            registry,
            hooks,
            debouncer,
            pool,
        }
    }

    pub(crate) async fn run<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if IN_TRANSACTION.try_with(|_| ()).is_ok() {
            return Err(LiveDbError::InvalidQuery(
                "in_transaction called from inside a transaction body".to_string(),
            ));
        }

        let _turn = self.turn.lock().await;
        self.store.call(|connections| connections.writer.begin()).await?;
        let mut guard = CommitGuard {
            store: self.store.clone(),
            pool: self.pool.clone(),
            armed: true,
        };

        let changes = Arc::new(Mutex::new(Vec::new()));
        let transaction = Transaction {
            store: self.store.clone(),
            registry: self.registry.clone(),
            hooks: Arc::new(self.hooks.snapshot()),
            changes: changes.clone(),
        };
        let outcome = IN_TRANSACTION.scope((), body(transaction)).await;

        guard.armed = false;
        let committed = self
            .store
            .call(|connections| match connections.writer.commit() {
                Ok(()) => Ok(()),
                Err(e) => {
                    let _ = connections.writer.rollback();
                    Err(e)
                }
            })
            .await;

        if let Err(e) = committed {
            if let Err(body_error) = outcome {
                log::error!("Commit failed after transaction body error: {e}");
                return Err(LiveDbError::TransactionBody(Box::new(body_error)));
            }
            return Err(e);
        }

        let records = match changes.lock() {
            Ok(mut changes) => std::mem::take(&mut *changes),
            Err(_) => Vec::new(),
        };
        for record in records {
            // Flush completion is not awaited.
            let _ = self.debouncer.accumulate(record);
        }

        outcome.map_err(|e| LiveDbError::TransactionBody(Box::new(e)))
    }
}
