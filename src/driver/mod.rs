//! Query driver: pooled, instrumented access to the relational store.
//!
//! `QueryDriver` owns a bounded pool of libsql connections to either a local
//! database file or a remote libSQL server. Every statement goes through
//! [`Executor`], which records duration and row counts and flags slow
//! queries. Transactions lease one connection for their whole lifetime.

mod pool;
mod stats;
mod value;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use libsql::TransactionBehavior;
use rand::Rng;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, DatabaseTarget};
use crate::error::{ConnectionError, DatabaseError};

pub use pool::{PoolStatus, PooledConnection};
pub use stats::{QueryStats, StatsSnapshot};
pub use value::{JsonRow, SqlValue, check_identifier, check_json_path, json_to_sql, sql_to_json};

use pool::ConnectionPool;
use value::{collect_rows, preview};

/// SQLite's default ceiling on bound parameters per statement.
const MAX_BOUND_PARAMS: usize = 999;

/// Statement execution shared by the driver and its transactions.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a statement that returns no rows; yields the affected-row count.
    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, DatabaseError>;

    /// Run a statement and collect its rows.
    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonRow>, DatabaseError>;

    /// Multi-row insert with upsert-on-conflict. Rows are split into as many
    /// statements as the bound-parameter ceiling requires.
    async fn bulk_insert(
        &self,
        upsert: &Upsert<'_>,
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64, DatabaseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let width = upsert.columns.len();
        if let Some(bad) = rows.iter().position(|row| row.len() != width) {
            return Err(DatabaseError::Query(format!(
                "bulk_insert into {}: row {bad} has {} values, expected {width}",
                upsert.table,
                rows[bad].len()
            )));
        }
        let per_statement = (MAX_BOUND_PARAMS / width.max(1)).max(1);
        let mut affected = 0;
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<Vec<SqlValue>> = rows.by_ref().take(per_statement).collect();
            let sql = upsert.sql(chunk.len())?;
            affected += self.execute(&sql, chunk.into_iter().flatten().collect()).await?;
        }
        Ok(affected)
    }

    /// Read one nested field of a JSON column without fetching the whole
    /// value. `None` when the row or the path does not exist.
    async fn json_get(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        json_column: &str,
        path: &str,
    ) -> Result<Option<Value>, DatabaseError> {
        let sql = format!(
            "SELECT {col} -> ? FROM {table} WHERE {key_col} = ?",
            col = check_identifier(json_column)?,
            table = check_identifier(table)?,
            key_col = check_identifier(key_column)?,
        );
        let params = vec![
            SqlValue::Text(check_json_path(path)?.to_string()),
            SqlValue::Text(key.to_string()),
        ];
        let rows = self.query(&sql, params).await?;
        match rows.into_iter().next().and_then(|row| row.into_iter().next()) {
            Some((_, Value::String(text))) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("json_get {path}: {e}"))),
            _ => Ok(None),
        }
    }

    /// Set one nested field of a JSON column in place. Returns whether a row
    /// was updated.
    async fn json_set(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        json_column: &str,
        path: &str,
        value: &Value,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "UPDATE {table} SET {col} = json_set(COALESCE({col}, '{{}}'), ?, json(?)) WHERE {key_col} = ?",
            col = check_identifier(json_column)?,
            table = check_identifier(table)?,
            key_col = check_identifier(key_column)?,
        );
        let encoded = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let params = vec![
            SqlValue::Text(check_json_path(path)?.to_string()),
            SqlValue::Text(encoded),
            SqlValue::Text(key.to_string()),
        ];
        Ok(self.execute(&sql, params).await? > 0)
    }
}

/// Target and conflict handling for [`Executor::bulk_insert`].
#[derive(Debug, Clone, Copy)]
pub struct Upsert<'a> {
    pub table: &'a str,
    pub columns: &'a [&'a str],
    pub conflict_key: &'a str,
    /// Columns overwritten on conflict. Empty means keep the existing row.
    pub update_columns: &'a [&'a str],
}

impl Upsert<'_> {
    fn sql(&self, row_count: usize) -> Result<String, DatabaseError> {
        let table = check_identifier(self.table)?;
        let columns = self
            .columns
            .iter()
            .map(|c| check_identifier(c))
            .collect::<Result<Vec<_>, _>>()?;
        let conflict_key = check_identifier(self.conflict_key)?;

        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let values = vec![placeholders.as_str(); row_count].join(", ");
        let on_conflict = if self.update_columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let sets = self
                .update_columns
                .iter()
                .map(|c| check_identifier(c).map(|c| format!("{c} = excluded.{c}")))
                .collect::<Result<Vec<_>, _>>()?;
            format!("DO UPDATE SET {}", sets.join(", "))
        };
        Ok(format!(
            "INSERT INTO {table} ({}) VALUES {values} ON CONFLICT ({conflict_key}) {on_conflict}",
            columns.join(", ")
        ))
    }
}

/// Result of [`QueryDriver::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct DriverHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub pool: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct DriverInner {
    pool: Arc<ConnectionPool>,
    stats: QueryStats,
    target: String,
    slow_query_threshold: Duration,
}

impl DriverInner {
    fn observe<T>(
        &self,
        sql: &str,
        started: Instant,
        result: &Result<T, DatabaseError>,
        rows: u64,
    ) {
        let elapsed = started.elapsed();
        let slow = self
            .stats
            .record(elapsed, rows, result.is_ok(), self.slow_query_threshold);
        if slow {
            warn!(
                sql = %preview(sql),
                elapsed_ms = elapsed.as_millis() as u64,
                rows,
                "Slow query"
            );
        }
        if let Err(err) = result {
            debug!(sql = %preview(sql), error = %err, "Statement failed");
        }
    }

    fn map_err(&self, context: &str, err: libsql::Error) -> DatabaseError {
        DatabaseError::from_statement(context, &self.target, err)
    }
}

/// Pooled, instrumented handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct QueryDriver {
    inner: Arc<DriverInner>,
}

impl std::fmt::Debug for QueryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDriver")
            .field("target", &self.inner.target)
            .field("pool", &self.inner.pool.status())
            .finish()
    }
}

impl QueryDriver {
    /// Connect with bounded retry and exponential backoff.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        Self::connect_with(config, &CancellationToken::new(), None).await
    }

    /// Connect, stopping early when `cancel` fires. Retries performed are
    /// published to `retries` as they happen.
    pub async fn connect_with(
        config: &DatabaseConfig,
        cancel: &CancellationToken,
        retries: Option<&AtomicU32>,
    ) -> Result<Self, DatabaseError> {
        let max_attempts = config.connect_retries.max(1);
        let mut backoff = config.retry_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(DatabaseError::Cancelled);
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DatabaseError::Cancelled),
                result = Self::try_connect(config) => result,
            };
            let err = match result {
                Ok(driver) => {
                    info!(
                        target_db = %config.target.display(),
                        attempt,
                        pool_size = config.pool_size,
                        "Relational store connected"
                    );
                    return Ok(driver);
                }
                Err(err) => err,
            };

            let retryable = !matches!(
                err,
                DatabaseError::Connection(
                    ConnectionError::BadCredentials { .. } | ConnectionError::UnknownDatabase { .. }
                )
            );
            if !retryable || attempt >= max_attempts {
                warn!(
                    target_db = %config.target.display(),
                    attempt,
                    error = %err,
                    "Giving up on relational store"
                );
                return Err(err);
            }

            if let Some(counter) = retries {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            let delay = jittered(backoff);
            warn!(
                target_db = %config.target.display(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Relational store connection failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(DatabaseError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = backoff.saturating_mul(2);
        }
    }

    async fn try_connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let target = config.target.display();
        let (db, local, pool_size) = match &config.target {
            DatabaseTarget::Local(path) => {
                let memory = path.as_os_str() == ":memory:";
                if !memory {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        tokio::fs::create_dir_all(parent).await.map_err(|e| {
                            ConnectionError::UnknownDatabase {
                                target: target.clone(),
                                reason: format!("create directory {}: {e}", parent.display()),
                            }
                        })?;
                    }
                }
                let db = libsql::Builder::new_local(path)
                    .build()
                    .await
                    .map_err(|e| ConnectionError::classify(&target, &e.to_string()))?;
                // Every connection to :memory: is its own database.
                let pool_size = if memory { 1 } else { config.pool_size };
                (db, true, pool_size)
            }
            DatabaseTarget::Remote(url) => {
                if !config.has_auth_token() {
                    debug!(target_db = %target, "Connecting without an auth token");
                }
                let db = libsql::Builder::new_remote(
                    url.clone(),
                    config.auth_token.expose_secret().to_string(),
                )
                .build()
                .await
                .map_err(|e| ConnectionError::classify(&target, &e.to_string()))?;
                (db, false, config.pool_size)
            }
        };

        let pool = ConnectionPool::new(
            db,
            target.clone(),
            local,
            pool_size,
            config.idle_timeout,
            config.connect_timeout,
        );
        let driver = Self {
            inner: Arc::new(DriverInner {
                pool,
                stats: QueryStats::default(),
                target: target.clone(),
                slow_query_threshold: config.slow_query_threshold,
            }),
        };

        let probe = async {
            let conn = driver.inner.pool.acquire().await?;
            if local {
                conn.execute_batch("PRAGMA journal_mode = WAL;")
                    .await
                    .map_err(|e| ConnectionError::classify(&target, &e.to_string()))?;
            }
            let rows = conn
                .query("SELECT 1", ())
                .await
                .map_err(|e| ConnectionError::classify(&target, &e.to_string()))?;
            collect_rows(rows)
                .await
                .map_err(|e| ConnectionError::classify(&target, &e.to_string()))?;
            Ok::<(), DatabaseError>(())
        };
        match tokio::time::timeout(config.connect_timeout, probe).await {
            Ok(Ok(())) => Ok(driver),
            Ok(Err(err)) => {
                driver.close();
                Err(err)
            }
            Err(_) => {
                driver.close();
                Err(ConnectionError::Unreachable {
                    target,
                    reason: format!("no response within {:?}", config.connect_timeout),
                }
                .into())
            }
        }
    }

    /// Printable connection target.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Open a transaction holding one pooled connection until it finishes.
    pub async fn begin(&self) -> Result<DriverTransaction, DatabaseError> {
        let mut conn = self.inner.pool.acquire().await?;
        let tx = match conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                let err = self.inner.map_err("begin", e);
                if err.is_connection_class() {
                    conn.mark_broken();
                }
                return Err(err);
            }
        };
        Ok(DriverTransaction {
            tx: Some(tx),
            conn,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Run `work` inside a transaction: commit when it returns `Ok`, roll
    /// back on any error. The transaction handle is passed through `work` so
    /// it can borrow caller state freely.
    pub async fn transaction<T, F, Fut>(&self, work: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(DriverTransaction) -> Fut,
        Fut: Future<Output = (DriverTransaction, Result<T, DatabaseError>)>,
    {
        let tx = self.begin().await?;
        let (tx, result) = work(tx).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Cheap round trip plus pool occupancy.
    pub async fn health_check(&self) -> DriverHealth {
        let started = Instant::now();
        let result = self.query("SELECT 1", Vec::new()).await;
        DriverHealth {
            healthy: result.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            pool: self.pool_status(),
            error: result.err().map(|e| e.to_string()),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Stop handing out connections. Idempotent.
    pub fn close(&self) {
        if !self.inner.pool.is_closed() {
            self.inner.pool.close();
            info!(target_db = %self.inner.target, "Query driver closed");
        }
    }
}

#[async_trait]
impl Executor for QueryDriver {
    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, DatabaseError> {
        let mut conn = self.inner.pool.acquire().await?;
        let started = Instant::now();
        let result = conn
            .execute(sql, libsql::params::Params::Positional(params))
            .await
            .map_err(|e| self.inner.map_err("execute", e));
        if matches!(&result, Err(err) if err.is_connection_class()) {
            conn.mark_broken();
        }
        let rows = *result.as_ref().unwrap_or(&0);
        self.inner.observe(sql, started, &result, rows);
        result
    }

    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonRow>, DatabaseError> {
        let mut conn = self.inner.pool.acquire().await?;
        let started = Instant::now();
        let result = match conn
            .query(sql, libsql::params::Params::Positional(params))
            .await
        {
            Ok(rows) => collect_rows(rows).await,
            Err(e) => Err(e),
        }
        .map_err(|e| self.inner.map_err("query", e));
        if matches!(&result, Err(err) if err.is_connection_class()) {
            conn.mark_broken();
        }
        let rows = result.as_ref().map_or(0, |r| r.len() as u64);
        self.inner.observe(sql, started, &result, rows);
        result
    }
}

/// An open transaction. Finish it with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); dropping it unfinished rolls back and
/// discards the connection.
pub struct DriverTransaction {
    tx: Option<libsql::Transaction>,
    conn: PooledConnection,
    inner: Arc<DriverInner>,
}

impl DriverTransaction {
    fn tx(&self) -> Result<&libsql::Transaction, DatabaseError> {
        self.tx
            .as_ref()
            .ok_or_else(|| DatabaseError::Query("transaction already finished".into()))
    }

    /// Open a named savepoint for partial rollback.
    pub async fn savepoint(&self, name: &str) -> Result<(), DatabaseError> {
        let sql = format!("SAVEPOINT {}", check_identifier(name)?);
        self.execute(&sql, Vec::new()).await.map(|_| ())
    }

    pub async fn release(&self, name: &str) -> Result<(), DatabaseError> {
        let sql = format!("RELEASE SAVEPOINT {}", check_identifier(name)?);
        self.execute(&sql, Vec::new()).await.map(|_| ())
    }

    /// Undo everything since `savepoint(name)` and drop the savepoint.
    pub async fn rollback_to(&self, name: &str) -> Result<(), DatabaseError> {
        let name = check_identifier(name)?;
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), Vec::new())
            .await?;
        self.execute(&format!("RELEASE SAVEPOINT {name}"), Vec::new())
            .await
            .map(|_| ())
    }

    pub async fn commit(mut self) -> Result<(), DatabaseError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DatabaseError::Query("transaction already finished".into()))?;
        let started = Instant::now();
        let result = tx.commit().await.map_err(|e| self.inner.map_err("commit", e));
        self.inner.observe("COMMIT", started, &result, 0);
        if result.is_err() {
            self.conn.mark_broken();
        }
        result
    }

    pub async fn rollback(mut self) -> Result<(), DatabaseError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DatabaseError::Query("transaction already finished".into()))?;
        let result = tx
            .rollback()
            .await
            .map_err(|e| self.inner.map_err("rollback", e));
        if result.is_err() {
            self.conn.mark_broken();
        }
        result
    }
}

impl Drop for DriverTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(target_db = %self.inner.target, "Transaction dropped without commit, rolling back");
            self.conn.mark_broken();
        }
    }
}

#[async_trait]
impl Executor for DriverTransaction {
    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, DatabaseError> {
        let tx = self.tx()?;
        let started = Instant::now();
        let result = tx
            .execute(sql, libsql::params::Params::Positional(params))
            .await
            .map_err(|e| self.inner.map_err("execute", e));
        let rows = *result.as_ref().unwrap_or(&0);
        self.inner.observe(sql, started, &result, rows);
        result
    }

    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonRow>, DatabaseError> {
        let tx = self.tx()?;
        let started = Instant::now();
        let result = match tx
            .query(sql, libsql::params::Params::Positional(params))
            .await
        {
            Ok(rows) => collect_rows(rows).await,
            Err(e) => Err(e),
        }
        .map_err(|e| self.inner.map_err("query", e));
        let rows = result.as_ref().map_or(0, |r| r.len() as u64);
        self.inner.observe(sql, started, &result, rows);
        result
    }
}

/// Backoff with ±25% jitter so restarting bots do not reconnect in lockstep.
fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis == 0 {
        return base;
    }
    let spread = millis / 4;
    let low = millis.saturating_sub(spread);
    let high = millis.saturating_add(spread);
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}
