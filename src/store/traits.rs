//! The `Store` capability: one async interface over both backends.
//!
//! The Controller picks a backend once at startup and talks to it only
//! through this trait. Raw relational access has default implementations that
//! fail with `StoreError::Unavailable`, which is what the flat-file backend
//! keeps.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::driver::{JsonRow, PoolStatus, SqlValue, StatsSnapshot};
use crate::error::StoreError;
use crate::model::DataSnapshot;

/// Which backend answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Relational,
    FlatFile,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::FlatFile => write!(f, "flat_file"),
        }
    }
}

/// One parametrized statement for [`Store::transaction`].
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Health as reported by a backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: BackendKind,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<StatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Load every collection into a fresh snapshot.
    async fn load(&self) -> Result<DataSnapshot, StoreError>;

    /// Persist the whole snapshot, replacing what the backend holds.
    async fn save(&self, snapshot: &DataSnapshot) -> Result<(), StoreError>;

    async fn query(&self, _sql: &str, _params: Vec<SqlValue>) -> Result<Vec<JsonRow>, StoreError> {
        Err(self.unavailable("query"))
    }

    async fn execute(&self, _sql: &str, _params: Vec<SqlValue>) -> Result<u64, StoreError> {
        Err(self.unavailable("execute"))
    }

    /// Run the statements atomically. Yields the affected-row count of each.
    async fn transaction(&self, _statements: Vec<Statement>) -> Result<Vec<u64>, StoreError> {
        Err(self.unavailable("transaction"))
    }

    async fn health(&self) -> BackendHealth;

    /// Release backend resources. Idempotent.
    async fn close(&self);

    fn unavailable(&self, operation: &str) -> StoreError {
        StoreError::Unavailable {
            operation: operation.to_string(),
        }
    }
}
