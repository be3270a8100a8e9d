//! Steps 4 and 5: copy the validated snapshot into the relational store and
//! write the completion marker, all inside one transaction.
//!
//! Users go in fixed-size batches; every other collection goes record by
//! record. Each unit runs under a SAVEPOINT, so a failing unit is rolled back
//! on its own and recorded while its siblings continue. Connection-class
//! failures leave the transaction unusable and abort the whole transfer.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::driver::{DriverTransaction, Executor, QueryDriver};
use crate::error::{DatabaseError, MigrationError, TransferError};
use crate::migrate::status::{MigrationStats, MigrationStatus, write_status};
use crate::model::DataSnapshot;
use crate::store::{TableRows, encode_snapshot};

const SAVEPOINT: &str = "transfer_unit";

/// Transfer `snapshot` and write a completed marker. `stats` arrives with the
/// validation results already filled in.
pub async fn transfer(
    driver: &QueryDriver,
    snapshot: &DataSnapshot,
    batch_size: usize,
    mut stats: MigrationStats,
    backup_file: Option<String>,
) -> Result<MigrationStatus, MigrationError> {
    let started = Instant::now();
    let tables = encode_snapshot(snapshot)?;

    let tx = driver.begin().await?;
    for table in &tables {
        stats.collection(table.collection);
        let result = if table.collection == "users" {
            transfer_batched(&tx, table, batch_size.max(1), &mut stats).await
        } else {
            transfer_records(&tx, table, &mut stats).await
        };
        if let Err(fatal) = result {
            return Err(abort(tx, fatal).await);
        }
        let counts = stats.collection(table.collection);
        info!(
            collection = table.collection,
            migrated = counts.migrated,
            failed = counts.failed,
            "Collection transferred"
        );
    }

    stats.duration_ms = started.elapsed().as_millis() as u64;
    let status = MigrationStatus {
        completed: true,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backup_file,
        stats,
    };
    if let Err(fatal) = write_status(&tx, &status).await {
        return Err(abort(tx, fatal).await);
    }
    tx.commit()
        .await
        .map_err(|e| MigrationError::TransactionFatal(format!("commit: {e}")))?;
    Ok(status)
}

async fn abort(tx: DriverTransaction, fatal: DatabaseError) -> MigrationError {
    warn!(error = %fatal, "Transfer aborted, rolling back");
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback after aborted transfer failed");
    }
    MigrationError::TransactionFatal(fatal.to_string())
}

async fn transfer_batched(
    tx: &DriverTransaction,
    table: &TableRows,
    batch_size: usize,
    stats: &mut MigrationStats,
) -> Result<(), DatabaseError> {
    let upsert = table.upsert();
    for (index, batch) in table.rows.chunks(batch_size).enumerate() {
        let rows = batch.iter().map(|(_, values)| values.clone()).collect();
        let size = batch.len() as u64;
        tx.savepoint(SAVEPOINT).await?;
        match tx.bulk_insert(&upsert, rows).await {
            Ok(_) => {
                tx.release(SAVEPOINT).await?;
                stats.collection(table.collection).migrated += size;
            }
            Err(e) if e.is_connection_class() => return Err(e),
            Err(e) => {
                tx.rollback_to(SAVEPOINT).await?;
                warn!(collection = table.collection, batch = index, error = %e, "Batch failed, skipped");
                stats.collection(table.collection).failed += size;
                stats.errors.push(TransferError {
                    collection: table.collection.to_string(),
                    target: format!("batch {index}"),
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(())
}

async fn transfer_records(
    tx: &DriverTransaction,
    table: &TableRows,
    stats: &mut MigrationStats,
) -> Result<(), DatabaseError> {
    let upsert = table.upsert();
    for (key, values) in &table.rows {
        tx.savepoint(SAVEPOINT).await?;
        match tx.bulk_insert(&upsert, vec![values.clone()]).await {
            Ok(_) => {
                tx.release(SAVEPOINT).await?;
                stats.collection(table.collection).migrated += 1;
            }
            Err(e) if e.is_connection_class() => return Err(e),
            Err(e) => {
                tx.rollback_to(SAVEPOINT).await?;
                warn!(collection = table.collection, key = %key, error = %e, "Record failed, skipped");
                stats.collection(table.collection).failed += 1;
                stats.errors.push(TransferError {
                    collection: table.collection.to_string(),
                    target: key.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(())
}
