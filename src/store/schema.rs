//! Version-tracked schema bootstrap for the relational store.
//!
//! Each version is a list of DDL statements applied inside one transaction and
//! recorded in `_migrations`. `bootstrap()` applies only versions newer than
//! the recorded maximum, so calling it on every start is cheap.

use tracing::{debug, info};

use crate::driver::{Executor, QueryDriver, SqlValue};
use crate::error::DatabaseError;

/// A single schema version.
struct SchemaVersion {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

/// All versions in order.
static VERSIONS: &[SchemaVersion] = &[SchemaVersion {
    version: 1,
    name: "initial_schema",
    statements: &[
        r#"CREATE TABLE IF NOT EXISTS whatsapp_users (
            jid TEXT PRIMARY KEY,
            name TEXT,
            exp REAL NOT NULL DEFAULT 0,
            money REAL NOT NULL DEFAULT 0,
            daily_limit REAL NOT NULL DEFAULT 0,
            level INTEGER NOT NULL DEFAULT 0,
            health REAL NOT NULL DEFAULT 0,
            role TEXT,
            premium INTEGER NOT NULL DEFAULT 0,
            premium_time INTEGER NOT NULL DEFAULT 0,
            banned INTEGER NOT NULL DEFAULT 0,
            warn INTEGER NOT NULL DEFAULT 0,
            command_count INTEGER NOT NULL DEFAULT 0,
            afk_since INTEGER NOT NULL DEFAULT -1,
            afk_reason TEXT,
            registered INTEGER NOT NULL DEFAULT 0,
            extra TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_whatsapp_users_level ON whatsapp_users(level)",
        r#"CREATE TABLE IF NOT EXISTS chats (
            jid TEXT PRIMARY KEY,
            is_banned INTEGER NOT NULL DEFAULT 0,
            welcome INTEGER NOT NULL DEFAULT 0,
            detect INTEGER NOT NULL DEFAULT 0,
            anti_link INTEGER NOT NULL DEFAULT 0,
            anti_delete INTEGER NOT NULL DEFAULT 0,
            only_admin INTEGER NOT NULL DEFAULT 0,
            nsfw INTEGER NOT NULL DEFAULT 0,
            welcome_text TEXT,
            bye_text TEXT,
            promote_text TEXT,
            demote_text TEXT,
            expires_at INTEGER NOT NULL DEFAULT 0,
            extra TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        r#"CREATE TABLE IF NOT EXISTS panel_users (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE,
            password_hash TEXT,
            role TEXT,
            email TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            last_login TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        r#"CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        r#"CREATE TABLE IF NOT EXISTS app_extensions (
            collection TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )"#,
        r#"CREATE TABLE IF NOT EXISTS migration_status (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            completed INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL,
            version TEXT NOT NULL,
            backup_file TEXT,
            stats TEXT NOT NULL DEFAULT '{}'
        )"#,
    ],
}];

/// Create the tracking table and apply any pending versions.
pub async fn bootstrap(driver: &QueryDriver) -> Result<(), DatabaseError> {
    driver
        .execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            Vec::new(),
        )
        .await
        .map_err(|e| DatabaseError::Schema(format!("Failed to create _migrations table: {e}")))?;

    let current = current_version(driver).await?;
    for version in VERSIONS.iter().filter(|v| v.version > current) {
        apply(driver, version).await?;
        info!(version = version.version, name = version.name, "Applied schema version");
    }
    if current >= latest_version() {
        debug!(version = current, "Schema up to date");
    }
    Ok(())
}

async fn apply(driver: &QueryDriver, version: &SchemaVersion) -> Result<(), DatabaseError> {
    driver
        .transaction(|tx| async move {
            let outcome = async {
                for sql in version.statements {
                    tx.execute(sql, Vec::new()).await?;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?, ?)",
                    vec![
                        SqlValue::Integer(version.version),
                        SqlValue::Text(version.name.to_string()),
                    ],
                )
                .await?;
                Ok::<(), DatabaseError>(())
            }
            .await;
            (tx, outcome)
        })
        .await
        .map_err(|e| {
            DatabaseError::Schema(format!(
                "Schema version {} ({}) failed: {e}",
                version.version, version.name
            ))
        })
}

/// Highest applied version, 0 when none.
pub async fn current_version(driver: &QueryDriver) -> Result<i64, DatabaseError> {
    let rows = driver
        .query(
            "SELECT COALESCE(MAX(version), 0) AS version FROM _migrations",
            Vec::new(),
        )
        .await
        .map_err(|e| DatabaseError::Schema(format!("Failed to read schema version: {e}")))?;
    Ok(rows
        .first()
        .and_then(|row| row.get("version"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0))
}

pub fn latest_version() -> i64 {
    VERSIONS.last().map_or(0, |v| v.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, DatabaseTarget};

    async fn test_driver() -> (tempfile::TempDir, QueryDriver) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            target: DatabaseTarget::Local(dir.path().join("schema.db")),
            ..Default::default()
        };
        (dir, QueryDriver::connect(&config).await.unwrap())
    }

    #[tokio::test]
    async fn bootstrap_creates_all_tables() {
        let (_dir, driver) = test_driver().await;
        bootstrap(&driver).await.unwrap();

        for table in [
            "_migrations",
            "whatsapp_users",
            "chats",
            "panel_users",
            "settings",
            "app_extensions",
            "migration_status",
        ] {
            let rows = driver
                .query(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                    vec![SqlValue::Text(table.into())],
                )
                .await
                .unwrap();
            assert_eq!(rows.len(), 1, "table {table} should exist");
        }
        assert_eq!(current_version(&driver).await.unwrap(), latest_version());
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let (_dir, driver) = test_driver().await;
        bootstrap(&driver).await.unwrap();
        bootstrap(&driver).await.unwrap();

        let rows = driver
            .query("SELECT COUNT(*) AS n FROM _migrations", Vec::new())
            .await
            .unwrap();
        assert_eq!(rows[0]["n"], serde_json::json!(VERSIONS.len()));
    }

    #[tokio::test]
    async fn migration_status_is_a_singleton() {
        let (_dir, driver) = test_driver().await;
        bootstrap(&driver).await.unwrap();
        let err = driver
            .execute(
                "INSERT INTO migration_status (id, timestamp, version) VALUES (2, 'now', '0')",
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Integrity(_)), "got {err:?}");
    }
}
