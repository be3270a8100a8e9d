//! Migration engine: one-shot transfer of the legacy snapshot into the
//! relational store.
//!
//! A run goes extract → validate → backup → transfer → finalize. Nothing is
//! written to the relational store until the first three steps have passed,
//! and the completion marker is written in the same transaction as the data.
//! Transfers upsert by key and never delete, so re-running is safe.

pub mod backup;
pub mod extract;
pub mod status;
pub mod transfer;
pub mod validate;

use std::path::PathBuf;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::driver::QueryDriver;
use crate::error::MigrationError;
use crate::store::schema;

pub use status::{CollectionStats, MigrationOutcome, MigrationStats, MigrationStatus};

/// Runs migrations against its own driver instance.
pub struct Migrator {
    driver: QueryDriver,
    legacy_path: PathBuf,
    backup_dir: PathBuf,
    batch_size: usize,
    strict: bool,
}

impl Migrator {
    /// Open a dedicated connection to the relational store and bootstrap the
    /// schema.
    pub async fn connect(config: &StoreConfig) -> Result<Self, MigrationError> {
        let driver = QueryDriver::connect(&config.database).await?;
        Self::with_driver(driver, config).await
    }

    pub async fn with_driver(driver: QueryDriver, config: &StoreConfig) -> Result<Self, MigrationError> {
        schema::bootstrap(&driver).await?;
        Ok(Self {
            driver,
            legacy_path: config.fallback.legacy_path.clone(),
            backup_dir: config.migration.backup_dir.clone(),
            batch_size: config.migration.batch_size,
            strict: config.migration.strict,
        })
    }

    pub async fn status(&self) -> Result<Option<MigrationStatus>, MigrationError> {
        Ok(status::read_status(&self.driver).await?)
    }

    pub async fn is_completed(&self) -> Result<bool, MigrationError> {
        Ok(self.status().await?.is_some_and(|s| s.completed))
    }

    /// Migrate unless the marker already says completed.
    pub async fn run(&self) -> Result<MigrationOutcome, MigrationError> {
        if let Some(status) = self.status().await? {
            if status.completed {
                info!(
                    completed_at = %status.timestamp,
                    "Migration already completed, skipping"
                );
                return Ok(MigrationOutcome::AlreadyCompleted { status });
            }
        }
        self.execute().await
    }

    /// Migrate regardless of the marker, upserting over existing rows and
    /// rewriting the marker.
    pub async fn run_forced(&self) -> Result<MigrationOutcome, MigrationError> {
        warn!(legacy = %self.legacy_path.display(), "Forced migration requested");
        self.execute().await
    }

    /// Remove the completion marker so the next start migrates again.
    pub async fn reset(&self) -> Result<bool, MigrationError> {
        let removed = status::clear_status(&self.driver).await?;
        warn!(removed, "Migration marker reset");
        Ok(removed)
    }

    pub fn close(&self) {
        self.driver.close();
    }

    async fn execute(&self) -> Result<MigrationOutcome, MigrationError> {
        let started = Instant::now();
        info!(
            legacy = %self.legacy_path.display(),
            batch_size = self.batch_size,
            strict = self.strict,
            "Migration started"
        );

        let extracted = extract::extract(&self.legacy_path).await?;
        let load = validate::validate(extracted.document, self.strict)?;
        let backup_file = backup::backup(&self.legacy_path, &extracted.raw, &self.backup_dir).await?;

        let mut stats = MigrationStats::new();
        stats.warnings = load.warnings;
        stats.replaced = load.replaced;

        let status = transfer::transfer(
            &self.driver,
            &load.snapshot,
            self.batch_size,
            stats,
            Some(backup_file.display().to_string()),
        )
        .await?;

        info!(
            run_id = %status.stats.run_id,
            migrated = status.stats.total_migrated(),
            failed = status.stats.total_failed(),
            warnings = status.stats.warnings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Migration completed"
        );
        Ok(MigrationOutcome::Completed { status })
    }
}
