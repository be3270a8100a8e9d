//! The persisted completion marker and the report it carries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::driver::{Executor, SqlValue};
use crate::error::{DatabaseError, TransferError, ValidationError};
use crate::model::RecordWarning;
use crate::store::mapping::json_cell;

/// Per-collection transfer counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub migrated: u64,
    pub failed: u64,
}

/// Aggregate report of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStats {
    pub run_id: Uuid,
    pub collections: BTreeMap<String, CollectionStats>,
    /// One entry per record that needed coercion.
    #[serde(default)]
    pub warnings: Vec<RecordWarning>,
    /// Records (or collections) whose raw value was replaced by defaults.
    #[serde(default)]
    pub replaced: Vec<ValidationError>,
    /// Records and batches that failed to persist.
    #[serde(default)]
    pub errors: Vec<TransferError>,
    pub duration_ms: u64,
}

impl MigrationStats {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            collections: BTreeMap::new(),
            warnings: Vec::new(),
            replaced: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn collection(&mut self, name: &str) -> &mut CollectionStats {
        self.collections.entry(name.to_string()).or_default()
    }

    pub fn total_migrated(&self) -> u64 {
        self.collections.values().map(|c| c.migrated).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.collections.values().map(|c| c.failed).sum()
    }
}

impl Default for MigrationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Singleton marker row in `migration_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub completed: bool,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub backup_file: Option<String>,
    pub stats: MigrationStats,
}

/// What `Migrator::run` did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// The marker already said completed; nothing was touched.
    AlreadyCompleted { status: MigrationStatus },
    /// A transfer ran and the marker was written.
    Completed { status: MigrationStatus },
}

impl MigrationOutcome {
    pub fn status(&self) -> &MigrationStatus {
        match self {
            MigrationOutcome::AlreadyCompleted { status } | MigrationOutcome::Completed { status } => {
                status
            }
        }
    }
}

/// Read the marker. `None` when no run has been recorded.
pub async fn read_status<E: Executor + ?Sized>(
    exec: &E,
) -> Result<Option<MigrationStatus>, DatabaseError> {
    let rows = exec
        .query(
            "SELECT completed, timestamp, version, backup_file, stats FROM migration_status WHERE id = 1",
            Vec::new(),
        )
        .await?;
    let Some(mut row) = rows.into_iter().next() else {
        return Ok(None);
    };

    let completed = row.get("completed").and_then(|v| v.as_i64()).unwrap_or(0) != 0;
    let timestamp = row
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| DatabaseError::Serialization("migration_status.timestamp".into()))?;
    let version = row
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let backup_file = row
        .get("backup_file")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let stats = match json_cell("migration_status", "1", row.remove("stats"))? {
        serde_json::Value::Null => MigrationStats::new(),
        value => serde_json::from_value(value)
            .map_err(|e| DatabaseError::Serialization(format!("migration_status.stats: {e}")))?,
    };

    Ok(Some(MigrationStatus {
        completed,
        timestamp,
        version,
        backup_file,
        stats,
    }))
}

/// Insert or replace the marker.
pub async fn write_status<E: Executor + ?Sized>(
    exec: &E,
    status: &MigrationStatus,
) -> Result<(), DatabaseError> {
    let stats = serde_json::to_string(&status.stats)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    exec.execute(
        "INSERT INTO migration_status (id, completed, timestamp, version, backup_file, stats)
         VALUES (1, ?, ?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
            completed = excluded.completed,
            timestamp = excluded.timestamp,
            version = excluded.version,
            backup_file = excluded.backup_file,
            stats = excluded.stats",
        vec![
            SqlValue::Integer(i64::from(status.completed)),
            SqlValue::Text(status.timestamp.to_rfc3339()),
            SqlValue::Text(status.version.clone()),
            status
                .backup_file
                .clone()
                .map_or(SqlValue::Null, SqlValue::Text),
            SqlValue::Text(stats),
        ],
    )
    .await?;
    Ok(())
}

/// Remove the marker.
pub async fn clear_status<E: Executor + ?Sized>(exec: &E) -> Result<bool, DatabaseError> {
    Ok(exec
        .execute("DELETE FROM migration_status WHERE id = 1", Vec::new())
        .await?
        > 0)
}
