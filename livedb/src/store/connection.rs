use crate::config::DatabaseConfig;
use crate::error::{LiveDbError, Result};
use crate::query::sql::SqlCommand;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared between the worker and the database handle.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub begins: AtomicU64,
    pub commits: AtomicU64,
    pub statements: AtomicU64,
    pub schema_retries: AtomicU64,
}

impl StoreStats {
    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> u64 {
        self.statements.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct Settings {
    log_queries: bool,
    log_query_plans: bool,
    retry_attempts: u32,
}

/// One SQLite connection confined to the store worker thread.
pub struct StoreConnection {
    conn: Connection,
    settings: Settings,
    stats: Arc<StoreStats>,
    in_transaction: bool,
}

impl StoreConnection {
    pub(crate) fn open_writer(path: Option<&Path>, config: &DatabaseConfig, stats: Arc<StoreStats>) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
        if path.is_some() {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            log::debug!("journal_mode={mode}");
        }
        conn.pragma_update(Some(rusqlite::DatabaseName::Main), "page_size", 8192)?;
        conn.pragma_update(Some(rusqlite::DatabaseName::Main), "cache_size", 20000)?;
        conn.pragma_update(Some(rusqlite::DatabaseName::Main), "synchronous", "NORMAL")?;
        Ok(Self::wrap(conn, config, stats))
    }

    /// Read-only companion connection; it only sees committed data.
    pub(crate) fn open_reader(path: &Path, config: &DatabaseConfig, stats: Arc<StoreStats>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
        Ok(Self::wrap(conn, config, stats))
    }

    fn wrap(conn: Connection, config: &DatabaseConfig, stats: Arc<StoreStats>) -> Self {
        StoreConnection {
            conn,
            settings: Settings {
                log_queries: config.log_queries,
                log_query_plans: config.log_query_plans,
                retry_attempts: config.schema_retry_attempts,
            },
            stats,
            in_transaction: false,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Run `op`, flushing the statement cache and retrying when SQLite
    /// reports that the schema changed under a prepared statement.
    fn run<T>(&mut self, sql: &str, mut op: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        if self.settings.log_queries {
            log::debug!("{sql}");
        }
        self.stats.statements.fetch_add(1, Ordering::SeqCst);
        let mut attempts = 0;
        loop {
            match op(&self.conn) {
                Ok(value) => return Ok(value),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::SchemaChanged && attempts < self.settings.retry_attempts =>
                {
                    attempts += 1;
                    self.stats.schema_retries.fetch_add(1, Ordering::SeqCst);
                    log::warn!("Database schema changed, retrying ({attempts}): {sql}");
                    self.conn.flush_prepared_statement_cache();
                }
                Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::SchemaChanged => {
                    return Err(LiveDbError::QueryExecution {
                        sql: sql.to_string(),
                        message: LiveDbError::SchemaChanged { sql: sql.to_string() }.to_string(),
                    });
                }
                Err(e) => {
                    return Err(LiveDbError::QueryExecution {
                        sql: sql.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Run a statement that returns rows. Every column comes back untyped.
    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        if self.settings.log_query_plans && sql.starts_with("SELECT") {
            self.log_query_plan(sql, params);
        }
        self.run(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let width = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(row.get::<_, SqlValue>(i)?);
                }
                out.push(values);
            }
            Ok(out)
        })
    }

    /// Run a statement for its effect; returns the number of changed rows.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.run(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            stmt.execute(params_from_iter(params.iter()))
        })
    }

    pub fn execute_command(&mut self, command: &SqlCommand) -> Result<usize> {
        self.execute(&command.sql, &command.params)
    }

    /// Uncached execution for DDL and pragmas.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.run(sql, |conn| conn.execute_batch(sql))
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(LiveDbError::InvalidQuery(
                "BEGIN called while a transaction is already in flight".to_string(),
            ));
        }
        self.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        self.in_transaction = true;
        self.stats.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(LiveDbError::InvalidQuery(
                "COMMIT called without an open transaction".to_string(),
            ));
        }
        let result = self.execute_batch("COMMIT");
        if result.is_err() && !self.conn.is_autocommit() {
            return result;
        }
        self.in_transaction = false;
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Abandon the open transaction after a failed COMMIT so the writer can
    /// begin again.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        let result = self.execute_batch("ROLLBACK");
        self.in_transaction = !self.conn.is_autocommit();
        result
    }

    pub fn user_version(&mut self) -> Result<u32> {
        self.run("PRAGMA user_version", |conn| {
            conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        })
    }

    pub fn set_user_version(&mut self, version: u32) -> Result<()> {
        self.run("PRAGMA user_version", |conn| {
            conn.pragma_update(None, "user_version", version)
        })
    }

    fn log_query_plan(&mut self, sql: &str, params: &[SqlValue]) {
        let explain = format!("EXPLAIN QUERY PLAN {sql}");
        let plan = self.conn.prepare(&explain).and_then(|mut stmt| {
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(3))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        });
        match plan {
            Ok(details) => {
                let plan = details.join("\n");
                if plan.contains("SCAN") && !plan.contains("COVERING INDEX") {
                    log::warn!("Consider an index for: {sql}\n{plan}");
                } else {
                    log::debug!("{sql}\n{plan}");
                }
            }
            Err(e) => log::debug!("Could not explain {sql}: {e}"),
        }
    }
}
