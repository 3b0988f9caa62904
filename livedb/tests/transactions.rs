use livedb::store::StoreConnection;
use livedb::{
    Attribute, ChangeRecord, Database, DatabaseConfig, LiveDbError, Model, ModelSchema, MutationHook,
    QueryBuilder, SchemaRegistry,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn registry() -> SchemaRegistry {
    SchemaRegistry::builder()
        .schema(
            ModelSchema::builder("Contact")
                .attribute(Attribute::string("email").queryable())
                .attribute(Attribute::number("n").queryable())
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

fn contact(db: &Database, id: &str, n: i64) -> Model {
    Model::with_id(db.schema("Contact").unwrap(), id)
        .with("email", format!("{id}@example.com"))
        .with("n", n)
}

/// Records the order in which writes reach the store.
#[derive(Default)]
struct Journal {
    entries: Mutex<Vec<String>>,
}

impl MutationHook for Journal {
    fn before_database_change(&self, _conn: &mut StoreConnection, record: &ChangeRecord) -> livedb::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for id in record.object_ids() {
            entries.push(id.to_string());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_body_still_commits() {
    let db = Database::open(DatabaseConfig::in_memory(), registry()).await.unwrap();
    let stats = db.stats().clone();
    let begins = stats.begins();

    let failing = {
        let model = contact(&db, "a", 1);
        db.in_transaction(|t| async move {
            t.persist_model(model).await?;
            Err::<(), _>(LiveDbError::Other("fail".to_string()))
        })
    };
    let succeeding = {
        let model = contact(&db, "b", 2);
        db.in_transaction(|t| async move { t.persist_model(model).await })
    };
    let (first, second) = tokio::join!(failing, succeeding);

    match first {
        Err(LiveDbError::TransactionBody(inner)) => assert_eq!(inner.to_string(), "fail"),
        other => panic!("unexpected {other:?}"),
    }
    second.unwrap();
    assert_eq!(stats.begins() - begins, 2);
    assert_eq!(stats.commits(), stats.begins());

    // writes made before the failure were committed
    assert!(db.find("Contact", "a").await.unwrap().is_some());
    assert!(db.find("Contact", "b").await.unwrap().is_some());
}

#[tokio::test]
async fn test_transactions_never_interleave() {
    let db = Database::open(DatabaseConfig::in_memory(), registry()).await.unwrap();
    let journal = Arc::new(Journal::default());
    db.add_mutation_hook(journal.clone());

    let mut tasks = Vec::new();
    for tx in 0..8 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            let models: Vec<Model> = (0..3).map(|step| contact(&db, &format!("{tx}-{step}"), step)).collect();
            db.in_transaction(|t| async move {
                for model in models {
                    t.persist_model(model).await?;
                    tokio::task::yield_now().await;
                }
                Ok(tx)
            })
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let entries = journal.entries.lock().unwrap().clone();
    assert_eq!(entries.len(), 24);
    for chunk in entries.chunks(3) {
        let owner = chunk[0].split('-').next().unwrap();
        let steps: Vec<&str> = chunk.iter().map(|id| id.split('-').nth(1).unwrap()).collect();
        assert!(chunk.iter().all(|id| id.starts_with(&format!("{owner}-"))), "{entries:?}");
        assert_eq!(steps, vec!["0", "1", "2"]);
    }
    assert_eq!(db.stats().begins(), 8);
    assert_eq!(db.stats().commits(), 8);
}

#[tokio::test]
async fn test_nested_transaction_is_rejected() {
    let db = Database::open(DatabaseConfig::in_memory(), registry()).await.unwrap();
    let inner_db = db.clone();
    let result = db
        .in_transaction(|_| async move {
            let nested = inner_db.in_transaction(|_| async { Ok(()) }).await;
            Ok(matches!(nested, Err(LiveDbError::InvalidQuery(_))))
        })
        .await
        .unwrap();
    assert!(result);
    assert_eq!(db.stats().begins(), 1);
}

#[tokio::test]
async fn test_transaction_returns_body_value() {
    let db = Database::open(DatabaseConfig::in_memory(), registry()).await.unwrap();
    let values = tokio::join!(
        db.in_transaction(|_| async { Ok("a") }),
        db.in_transaction(|_| async { Ok("b") }),
        db.in_transaction(|_| async { Ok("c") }),
    );
    assert_eq!(
        (values.0.unwrap(), values.1.unwrap(), values.2.unwrap()),
        ("a", "b", "c")
    );
}

#[tokio::test]
async fn test_mixed_classes_rejected() {
    let db = Database::open(DatabaseConfig::in_memory(), registry()).await.unwrap();
    let blob = Model::with_id(db.schema("JSONBlob").unwrap(), "x");
    let models = vec![contact(&db, "a", 1), blob];
    let result = db
        .in_transaction(|t| async move { t.persist_models(models).await })
        .await;
    match result {
        Err(error) => assert!(matches!(error.body_error(), Some(LiveDbError::InvalidQuery(_)))),
        Ok(()) => panic!("mixed classes accepted"),
    }
}

#[tokio::test]
async fn test_readers_see_only_committed_state() {
    let dir = TempDir::new().unwrap();
    assert_reads_are_isolated(DatabaseConfig::at_path(dir.path().join("cache.db"))).await;
}

#[tokio::test]
async fn test_pathless_readers_see_only_committed_state() {
    assert_reads_are_isolated(DatabaseConfig::in_memory()).await;
}

async fn assert_reads_are_isolated(config: DatabaseConfig) {
    let db = Database::open(config, registry()).await.unwrap();
    let live_query = QueryBuilder::find_all(db.schema("Contact").unwrap()).build().unwrap();

    let (written_tx, written_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let writer = {
        let db = db.clone();
        let model = contact(&db, "a", 1);
        tokio::spawn(async move {
            db.in_transaction(|t| async move {
                t.persist_model(model).await?;
                let _ = written_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
            .await
        })
    };

    written_rx.await.unwrap();
    assert!(db.find("Contact", "a").await.unwrap().is_none());
    assert!(db.find_all(&live_query).await.unwrap().is_empty());
    release_tx.send(()).unwrap();
    writer.await.unwrap().unwrap();
    assert!(db.find("Contact", "a").await.unwrap().is_some());
    assert_eq!(db.find_all(&live_query).await.unwrap().len(), 1);
    db.close();
}

#[tokio::test]
async fn test_hooks_can_write_and_be_removed() {
    struct AuditHook;

    impl MutationHook for AuditHook {
        fn after_database_change(&self, conn: &mut StoreConnection, record: &ChangeRecord) -> livedb::Result<()> {
            conn.execute_batch("CREATE TABLE IF NOT EXISTS audit (class TEXT, n INTEGER)")?;
            conn.execute(
                "INSERT INTO audit (class, n) VALUES (?, ?)",
                &[
                    rusqlite::types::Value::Text(record.class().to_string()),
                    rusqlite::types::Value::Integer(record.objects().len() as i64),
                ],
            )?;
            Ok(())
        }
    }

    let db = Database::open(DatabaseConfig::in_memory(), registry()).await.unwrap();
    let hook = db.add_mutation_hook(Arc::new(AuditHook));
    let models = vec![contact(&db, "a", 1), contact(&db, "b", 2)];
    db.in_transaction(|t| async move { t.persist_models(models).await })
        .await
        .unwrap();

    assert!(db.remove_mutation_hook(hook));
    assert!(!db.remove_mutation_hook(hook));
    let more = contact(&db, "c", 3);
    db.in_transaction(|t| async move { t.persist_model(more).await })
        .await
        .unwrap();

    let rows = db
        .in_transaction(|t| async move { t.execute("DELETE FROM audit WHERE n = 2", Vec::new()).await })
        .await
        .unwrap();
    assert_eq!(rows, 1);
    let count = QueryBuilder::count(db.schema("Contact").unwrap()).build().unwrap();
    assert_eq!(db.count(&count).await.unwrap(), 3);
}

#[tokio::test]
async fn test_dropped_transaction_commits() {
    let db = Database::open(DatabaseConfig::in_memory(), registry()).await.unwrap();
    let model = contact(&db, "a", 1);
    let pending = db.in_transaction(|t| async move {
        t.persist_model(model).await?;
        std::future::pending::<()>().await;
        Ok(())
    });
    let timed_out = tokio::time::timeout(Duration::from_millis(50), pending).await;
    assert!(timed_out.is_err());

    db.in_transaction(|_| async { Ok(()) }).await.unwrap();
    assert_eq!(db.stats().begins(), 2);
    assert_eq!(db.stats().commits(), 2);
    assert!(db.find("Contact", "a").await.unwrap().is_some());
}
