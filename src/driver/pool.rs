//! Bounded connection pool over a libsql `Database`.
//!
//! A semaphore caps live connections at `max_size`; callers beyond capacity
//! wait for a permit (up to the acquire timeout). Released connections go back
//! on an idle stack unless they were marked broken, and idle connections older
//! than `idle_timeout` are discarded instead of reused.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use libsql::Connection;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{ConnectionError, DatabaseError};

/// Pragmas applied to every new local connection.
const LOCAL_PRAGMAS: &str = "PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;";

pub(crate) struct ConnectionPool {
    db: libsql::Database,
    target: String,
    local: bool,
    max_size: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    idle: Mutex<Vec<IdleConnection>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    opened: AtomicU64,
    in_use: AtomicUsize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

/// Occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Connections opened over the pool's lifetime.
    pub opened_total: u64,
}

impl ConnectionPool {
    pub(crate) fn new(
        db: libsql::Database,
        target: String,
        local: bool,
        max_size: usize,
        idle_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        let max_size = max_size.max(1);
        Arc::new(Self {
            db,
            target,
            local,
            max_size,
            idle_timeout,
            acquire_timeout,
            idle: Mutex::new(Vec::with_capacity(max_size)),
            permits: Arc::new(Semaphore::new(max_size)),
            closed: AtomicBool::new(false),
            opened: AtomicU64::new(0),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Wait for a permit, then reuse an idle connection or open a new one.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, DatabaseError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatabaseError::Closed);
        }
        let permit =
            match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
                .await
            {
                Err(_) => return Err(DatabaseError::Timeout(self.acquire_timeout)),
                Ok(Err(_)) => return Err(DatabaseError::Closed),
                Ok(Ok(permit)) => permit,
            };

        let conn = match self.take_idle() {
            Some(conn) => conn,
            None => self.open().await?,
        };
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            conn,
            pool: Arc::clone(self),
            broken: false,
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<Connection> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(entry) = idle.pop() {
            if entry.since.elapsed() <= self.idle_timeout {
                return Some(entry.conn);
            }
            debug!(target_db = %self.target, "Discarding expired idle connection");
        }
        None
    }

    async fn open(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| ConnectionError::classify(&self.target, &e.to_string()))?;
        if self.local {
            conn.execute_batch(LOCAL_PRAGMAS)
                .await
                .map_err(|e| DatabaseError::Pool(format!("configure connection: {e}")))?;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(target_db = %self.target, "Opened pooled connection");
        Ok(conn)
    }

    fn release(&self, conn: Connection, broken: bool) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if broken || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.push(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).len();
        PoolStatus {
            max_size: self.max_size,
            idle,
            in_use: self.in_use.load(Ordering::SeqCst),
            opened_total: self.opened.load(Ordering::SeqCst),
        }
    }

    /// Refuse new acquisitions and drop idle connections. Leased connections
    /// are dropped when their holders release them.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A leased connection. Returned to the pool on drop.
///
/// `Connection` is a shared handle: the pool keeps a clone on release and the
/// lease's own handle goes away with it.
pub struct PooledConnection {
    conn: Connection,
    pool: Arc<ConnectionPool>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Discard instead of returning to the pool.
    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.conn.clone(), self.broken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_pool(max_size: usize, idle_timeout: Duration) -> (tempfile::TempDir, Arc<ConnectionPool>) {
        let dir = tempfile::tempdir().unwrap();
        let db = libsql::Builder::new_local(dir.path().join("pool.db"))
            .build()
            .await
            .unwrap();
        let pool = ConnectionPool::new(
            db,
            "file:pool.db".into(),
            true,
            max_size,
            idle_timeout,
            Duration::from_millis(200),
        );
        (dir, pool)
    }

    #[tokio::test]
    async fn reuses_released_connections() {
        let (_dir, pool) = local_pool(2, Duration::from_secs(60)).await;
        {
            let _a = pool.acquire().await.unwrap();
            assert_eq!(pool.status().in_use, 1);
        }
        assert_eq!(pool.status().idle, 1);
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.status().opened_total, 1);
    }

    #[tokio::test]
    async fn released_connection_still_answers() {
        let (_dir, pool) = local_pool(1, Duration::from_secs(60)).await;
        {
            let conn = pool.acquire().await.unwrap();
            conn.execute("CREATE TABLE t (x INTEGER)", ()).await.unwrap();
        }
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.execute("INSERT INTO t VALUES (1)", ()).await.unwrap(), 1);
        assert_eq!(pool.status().opened_total, 1);
    }

    #[tokio::test]
    async fn waits_then_times_out_beyond_capacity() {
        let (_dir, pool) = local_pool(1, Duration::from_secs(60)).await;
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, DatabaseError::Timeout(_)));
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn broken_connections_are_not_reused() {
        let (_dir, pool) = local_pool(2, Duration::from_secs(60)).await;
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn expired_idle_connections_are_replaced() {
        let (_dir, pool) = local_pool(1, Duration::ZERO).await;
        drop(pool.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().opened_total, 2);
    }

    #[tokio::test]
    async fn closed_pool_refuses() {
        let (_dir, pool) = local_pool(1, Duration::from_secs(60)).await;
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await.err().unwrap(), DatabaseError::Closed));
    }
}
