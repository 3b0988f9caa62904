pub mod connection;

pub use connection::{StoreConnection, StoreStats};

use crate::config::DatabaseConfig;
use crate::error::{LiveDbError, Result};
use rusqlite::types::Value as SqlValue;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

/// Connections owned by the worker.
pub struct StoreConnections {
    pub writer: StoreConnection,
    reader: StoreConnection,
}

impl StoreConnections {
    /// The connection reads should use.
    pub fn reader(&mut self) -> &mut StoreConnection {
        &mut self.reader
    }
}

type Job = Box<dyn FnOnce(&mut StoreConnections) + Send>;

/// Handle to the worker thread. Cheap to share behind an `Arc`.
///
/// The worker owns both connections and runs one job at a time. Reads use
/// the read-only connection, which only sees committed state.
pub struct Store {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StoreStats>,
}

impl Store {
    /// Open the connections and start the worker.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let stats = Arc::new(StoreStats::default());
        let (path, scratch) = match &config.path {
            Some(path) => (path.clone(), None),
            None => {
                let dir = tempfile::Builder::new().prefix("livedb-").tempdir()?;
                (dir.path().join("memory.db"), Some(dir))
            }
        };
        let writer = StoreConnection::open_writer(Some(&path), config, stats.clone())?;
        let reader = StoreConnection::open_reader(&path, config, stats.clone())?;
        let mut connections = StoreConnections { writer, reader };

        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = std::thread::Builder::new()
            .name("livedb-store".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job(&mut connections);
                }
                if connections.writer.in_transaction() {
                    if let Err(e) = connections.writer.commit() {
                        log::error!("Final commit failed while closing store: {e}");
                    }
                }
                drop(connections);
                if let Some(dir) = scratch {
                    if let Err(e) = dir.close() {
                        log::warn!("Could not remove scratch database: {e}");
                    }
                }
            })?;

        Ok(Store {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<StoreStats> {
        &self.stats
    }

    fn submit(&self, job: Job) -> Result<()> {
        let guard = self.sender.lock().map_err(|_| LiveDbError::Closed)?;
        match guard.as_ref() {
            Some(sender) => sender.send(job).map_err(|_| LiveDbError::Closed),
            None => Err(LiveDbError::Closed),
        }
    }

    /// Run `f` on the worker and await its result.
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut StoreConnections) -> Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |connections| {
            let _ = tx.send(f(connections));
        }))?;
        rx.await.map_err(|_| LiveDbError::Closed)?
    }

    /// Queue `f` without waiting for it.
    pub fn call_detached<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoreConnections) + Send + 'static,
    {
        self.submit(Box::new(f))
    }

    /// Run a read on the read connection.
    pub async fn query(&self, sql: String, params: Vec<SqlValue>) -> Result<Vec<Vec<SqlValue>>> {
        self.call(move |connections| connections.reader().query(&sql, &params))
            .await
    }

    /// Run a write on the writer connection.
    pub async fn execute(&self, sql: String, params: Vec<SqlValue>) -> Result<usize> {
        self.call(move |connections| connections.writer.execute(&sql, &params))
            .await
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Store worker panicked");
            }
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

/// Remove a database file together with its `-wal` and `-shm` companions.
/// Deletion is retried a few times since another process may still be
/// releasing the file.
pub fn delete_database_files(path: &Path) -> Result<()> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        targets.push(name.into());
    }

    for target in targets {
        let mut attempt = 0;
        loop {
            match std::fs::remove_file(&target) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if attempt < 5 => {
                    attempt += 1;
                    log::warn!("Could not delete {} ({e}), retrying", target.display());
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let store = Store::open(&DatabaseConfig::in_memory()).unwrap();
        store
            .call(|c| c.writer.execute_batch("CREATE TABLE t (n INTEGER)"))
            .await
            .unwrap();
        for n in 0..5 {
            store
                .execute("INSERT INTO t (n) VALUES (?)".into(), vec![SqlValue::Integer(n)])
                .await
                .unwrap();
        }
        let rows = store.query("SELECT n FROM t ORDER BY rowid".into(), vec![]).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4][0], SqlValue::Integer(4));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_jobs() {
        let store = Store::open(&DatabaseConfig::in_memory()).unwrap();
        store.close();
        let result = store.query("SELECT 1".into(), vec![]).await;
        assert!(matches!(result, Err(LiveDbError::Closed)));
    }

    #[tokio::test]
    async fn test_reader_sees_committed_state_only() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&DatabaseConfig::at_path(dir.path().join("db.sqlite"))).unwrap();
        store
            .call(|c| c.writer.execute_batch("CREATE TABLE t (n INTEGER)"))
            .await
            .unwrap();
        store.call(|c| c.writer.begin()).await.unwrap();
        store
            .execute("INSERT INTO t (n) VALUES (1)".into(), vec![])
            .await
            .unwrap();
        let during = store.query("SELECT COUNT(*) FROM t".into(), vec![]).await.unwrap();
        assert_eq!(during[0][0], SqlValue::Integer(0));
        store.call(|c| c.writer.commit()).await.unwrap();
        let after = store.query("SELECT COUNT(*) FROM t".into(), vec![]).await.unwrap();
        assert_eq!(after[0][0], SqlValue::Integer(1));
    }

    #[tokio::test]
    async fn test_pathless_store_reads_committed_state_only() {
        let store = Store::open(&DatabaseConfig::in_memory()).unwrap();
        store
            .call(|c| c.writer.execute_batch("CREATE TABLE t (n INTEGER)"))
            .await
            .unwrap();
        store.call(|c| c.writer.begin()).await.unwrap();
        store
            .execute("INSERT INTO t (n) VALUES (1)".into(), vec![])
            .await
            .unwrap();
        let during = store.query("SELECT COUNT(*) FROM t".into(), vec![]).await.unwrap();
        assert_eq!(during[0][0], SqlValue::Integer(0));
        store.call(|c| c.writer.commit()).await.unwrap();
        let after = store.query("SELECT COUNT(*) FROM t".into(), vec![]).await.unwrap();
        assert_eq!(after[0][0], SqlValue::Integer(1));
        store.close();
    }

    #[test]
    fn test_delete_database_files() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("edgehill.db");
        std::fs::write(&db, b"x").unwrap();
        std::fs::write(dir.path().join("edgehill.db-wal"), b"x").unwrap();
        delete_database_files(&db).unwrap();
        assert!(!db.exists());
        assert!(!dir.path().join("edgehill.db-wal").exists());
        delete_database_files(&db).unwrap();
    }
}
