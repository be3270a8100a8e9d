//! Relational backend: the in-memory snapshot mirrored onto libSQL tables.
//!
//! `load` rebuilds a legacy-shaped snapshot from every table. `save` is a
//! full resynchronization inside one transaction: rows whose keys left the
//! snapshot are deleted, then every record is upserted by key.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::driver::{DriverTransaction, Executor, QueryDriver, SqlValue, Upsert};
use crate::error::{DatabaseError, StoreError};
use crate::model::fields::{CHAT_SCHEMA, PANEL_USER_SCHEMA, USER_SCHEMA};
use crate::model::{DataSnapshot, LegacyRecord, RecordSchema};
use crate::store::mapping::{json_cell, record_to_row, row_to_record, select_all};
use crate::store::schema;
use crate::store::traits::{BackendHealth, BackendKind, Statement, Store};

/// Encoded rows for one table.
#[derive(Debug, Clone)]
pub struct TableRows {
    /// Snapshot collection the rows came from.
    pub collection: &'static str,
    pub table: &'static str,
    pub key_column: &'static str,
    pub columns: Vec<&'static str>,
    /// `(key, values in column order)`.
    pub rows: Vec<(String, Vec<SqlValue>)>,
}

impl TableRows {
    pub fn upsert(&self) -> Upsert<'_> {
        Upsert {
            table: self.table,
            columns: &self.columns,
            conflict_key: self.key_column,
            update_columns: &self.columns[1..],
        }
    }

    fn keyed<T: LegacyRecord>(
        schema: &'static RecordSchema,
        records: &std::collections::BTreeMap<String, T>,
    ) -> Result<Self, DatabaseError> {
        let rows = records
            .iter()
            .map(|(key, record)| Ok((key.clone(), record_to_row(schema, key, record)?)))
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        Ok(Self {
            collection: schema.collection,
            table: schema.table,
            key_column: schema.key_column,
            columns: schema.columns(),
            rows,
        })
    }

    fn opaque(
        collection: &'static str,
        table: &'static str,
        key_column: &'static str,
        values: &std::collections::BTreeMap<String, Value>,
    ) -> Self {
        let rows = values
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    vec![SqlValue::Text(key.clone()), SqlValue::Text(value.to_string())],
                )
            })
            .collect();
        Self {
            collection,
            table,
            key_column,
            columns: vec![key_column, "value"],
            rows,
        }
    }
}

/// Encode every collection of a snapshot, fixed tables first.
pub fn encode_snapshot(snapshot: &DataSnapshot) -> Result<Vec<TableRows>, DatabaseError> {
    Ok(vec![
        TableRows::keyed(&USER_SCHEMA, &snapshot.users)?,
        TableRows::keyed(&CHAT_SCHEMA, &snapshot.chats)?,
        TableRows::keyed(&PANEL_USER_SCHEMA, &snapshot.panel_users)?,
        TableRows::opaque("settings", "settings", "key", &snapshot.settings),
        TableRows::opaque("extensions", "app_extensions", "collection", &snapshot.extensions),
    ])
}

pub struct RelationalStore {
    driver: QueryDriver,
}

impl RelationalStore {
    /// Wrap a connected driver, bootstrapping the schema.
    pub async fn open(driver: QueryDriver) -> Result<Self, DatabaseError> {
        schema::bootstrap(&driver).await?;
        Ok(Self { driver })
    }

    pub fn driver(&self) -> &QueryDriver {
        &self.driver
    }

    pub async fn load_snapshot(&self) -> Result<DataSnapshot, DatabaseError> {
        let started = Instant::now();
        let mut snapshot = DataSnapshot::default();

        for row in self.driver.query(&select_all(&USER_SCHEMA), Vec::new()).await? {
            let (key, user) = row_to_record(&USER_SCHEMA, row)?;
            snapshot.users.insert(key, user);
        }
        for row in self.driver.query(&select_all(&CHAT_SCHEMA), Vec::new()).await? {
            let (key, chat) = row_to_record(&CHAT_SCHEMA, row)?;
            snapshot.chats.insert(key, chat);
        }
        for row in self
            .driver
            .query(&select_all(&PANEL_USER_SCHEMA), Vec::new())
            .await?
        {
            let (key, user) = row_to_record(&PANEL_USER_SCHEMA, row)?;
            snapshot.panel_users.insert(key, user);
        }

        let settings = self
            .driver
            .query("SELECT key, value FROM settings ORDER BY key", Vec::new())
            .await?;
        for mut row in settings {
            let key = text_key(&mut row, "key", "settings")?;
            let value = json_cell("settings", &key, row.remove("value"))?;
            snapshot.settings.insert(key, value);
        }

        let extensions = self
            .driver
            .query(
                "SELECT collection, value FROM app_extensions ORDER BY collection",
                Vec::new(),
            )
            .await?;
        for mut row in extensions {
            let key = text_key(&mut row, "collection", "app_extensions")?;
            let value = json_cell("app_extensions", &key, row.remove("value"))?;
            snapshot.extensions.insert(key, value);
        }

        debug!(
            records = snapshot.record_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded snapshot from relational store"
        );
        Ok(snapshot)
    }

    pub async fn save_snapshot(&self, snapshot: &DataSnapshot) -> Result<(), DatabaseError> {
        let started = Instant::now();
        let tables = encode_snapshot(snapshot)?;
        let records = snapshot.record_count();

        self.driver
            .transaction(|tx| async move {
                let mut outcome = Ok(());
                for table in &tables {
                    if let Err(e) = resync_table(&tx, table).await {
                        outcome = Err(e);
                        break;
                    }
                }
                (tx, outcome)
            })
            .await?;

        info!(
            records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot written to relational store"
        );
        Ok(())
    }
}

/// Delete rows whose keys are gone, then upsert the rest.
async fn resync_table(tx: &DriverTransaction, table: &TableRows) -> Result<(), DatabaseError> {
    let keys: Vec<&str> = table.rows.iter().map(|(key, _)| key.as_str()).collect();
    let keys = serde_json::to_string(&keys)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let removed = tx
        .execute(
            &format!(
                "DELETE FROM {} WHERE {} NOT IN (SELECT value FROM json_each(?))",
                table.table, table.key_column
            ),
            vec![SqlValue::Text(keys)],
        )
        .await?;
    if removed > 0 {
        debug!(table = table.table, removed, "Removed rows absent from snapshot");
    }

    let rows = table.rows.iter().map(|(_, values)| values.clone()).collect();
    tx.bulk_insert(&table.upsert(), rows).await?;
    Ok(())
}

fn text_key(
    row: &mut crate::driver::JsonRow,
    column: &str,
    table: &str,
) -> Result<String, DatabaseError> {
    match row.remove(column) {
        Some(Value::String(key)) => Ok(key),
        other => Err(DatabaseError::Serialization(format!(
            "{table} row has no text {column} (found {other:?})"
        ))),
    }
}

#[async_trait]
impl Store for RelationalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn load(&self) -> Result<DataSnapshot, StoreError> {
        Ok(self.load_snapshot().await?)
    }

    async fn save(&self, snapshot: &DataSnapshot) -> Result<(), StoreError> {
        Ok(self.save_snapshot(snapshot).await?)
    }

    async fn query(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<crate::driver::JsonRow>, StoreError> {
        Ok(self.driver.query(sql, params).await?)
    }

    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, StoreError> {
        Ok(self.driver.execute(sql, params).await?)
    }

    async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<u64>, StoreError> {
        let affected = self
            .driver
            .transaction(|tx| async move {
                let mut affected = Vec::with_capacity(statements.len());
                for statement in statements {
                    match tx.execute(&statement.sql, statement.params).await {
                        Ok(rows) => affected.push(rows),
                        Err(e) => return (tx, Err(e)),
                    }
                }
                (tx, Ok(affected))
            })
            .await?;
        Ok(affected)
    }

    async fn health(&self) -> BackendHealth {
        let report = self.driver.health_check().await;
        BackendHealth {
            backend: BackendKind::Relational,
            healthy: report.healthy,
            latency_ms: report.latency_ms,
            pool: Some(report.pool),
            queries: Some(self.driver.stats()),
            error: report.error,
        }
    }

    async fn close(&self) {
        self.driver.close();
    }
}
