//! Controller: startup orchestration and the single accessor surface.
//!
//! `initialize()` walks the state machine:
//!
//! ```text
//! INITIALIZING → MIGRATION_CHECK → MIGRATING? → CONNECTING → CONNECTED → READY
//!                                                   └─ ERROR → FALLBACK → READY
//! ```
//!
//! A store that never answers costs at most the migration-check budget
//! (`min(connect_timeout, fallback timeout)`) plus the fallback timeout: a
//! timed-out check skips MIGRATING rather than reconnecting.
//!
//! The backend is chosen once and never re-evaluated. Consumers hold an
//! `Arc<Controller>` and use `data`/`read`/`write` without caring which
//! backend answers.

pub mod state;
pub mod status;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::driver::{JsonRow, QueryDriver, SqlValue};
use crate::error::{MigrationError, StoreError};
use crate::migrate::{MigrationOutcome, Migrator};
use crate::model::DataSnapshot;
use crate::store::{BackendKind, FlatFileStore, RelationalStore, Statement, Store};

pub use state::ControllerState;
pub use status::{HealthReport, MigrationSummary, StoreStatus};

pub struct Controller {
    config: StoreConfig,
    state: Mutex<ControllerState>,
    backend: OnceLock<Box<dyn Store>>,
    data: RwLock<DataSnapshot>,
    /// Serializes `initialize`, `read` and `write` against each other.
    sync: tokio::sync::Mutex<()>,
    last_error: Mutex<Option<String>>,
    migration: Mutex<MigrationSummary>,
    retries: AtomicU32,
    closed: AtomicBool,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Controller {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ControllerState::Initializing),
            backend: OnceLock::new(),
            data: RwLock::new(DataSnapshot::default()),
            sync: tokio::sync::Mutex::new(()),
            last_error: Mutex::new(None),
            migration: Mutex::new(MigrationSummary::Pending),
            retries: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active backend, once selected.
    pub fn backend(&self) -> Option<BackendKind> {
        self.backend.get().map(|store| store.kind())
    }

    /// Bring the store up. Succeeds on either backend; fails only when the
    /// relational store is unusable and fallback is disabled (or the legacy
    /// file itself cannot be read). Calling it again once ready is a no-op.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let _guard = self.sync.lock().await;
        self.ensure_open()?;
        if self.backend.get().is_some() {
            return Ok(());
        }

        info!(
            target_db = %self.config.database.target.display(),
            fallback_enabled = self.config.fallback.enabled,
            migration_enabled = self.config.migration.enabled,
            "Initializing store"
        );

        if self.config.migration.enabled {
            self.migrate_if_needed().await;
        } else {
            self.set_migration(MigrationSummary::Disabled);
        }

        self.transition(ControllerState::Connecting);
        let (store, snapshot): (Box<dyn Store>, DataSnapshot) = match self.connect_relational().await {
            Ok((store, snapshot)) => {
                self.transition(ControllerState::Connected);
                (Box::new(store), snapshot)
            }
            Err(err) => {
                self.record_error(&err);
                self.transition(ControllerState::Error);
                if !self.config.fallback.enabled {
                    error!(error = %err, "Relational store unavailable and fallback is disabled");
                    return Err(StoreError::Startup(err.to_string()));
                }
                warn!(error = %err, "Relational store unavailable, falling back to legacy file");
                self.transition(ControllerState::Fallback);
                let legacy = FlatFileStore::new(&self.config.fallback.legacy_path)
                    .with_backup_dir(&self.config.migration.backup_dir);
                let snapshot = legacy.load().await.map_err(|e| {
                    error!(error = %e, "Legacy store unusable, no backend available");
                    self.record_error(&e);
                    StoreError::Startup(format!("relational: {err}; legacy: {e}"))
                })?;
                (Box::new(legacy), snapshot)
            }
        };

        let kind = store.kind();
        let records = snapshot.record_count();
        *self.data.write().await = snapshot;
        if self.backend.set(store).is_err() {
            debug!("Backend already selected");
        }
        self.transition(ControllerState::Ready);
        info!(
            backend = %kind,
            records,
            retries = self.retries.load(Ordering::SeqCst),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Store ready"
        );
        Ok(())
    }

    /// MIGRATION_CHECK and, when needed, MIGRATING. Never fails startup.
    async fn migrate_if_needed(&self) {
        self.transition(ControllerState::MigrationCheck);
        let budget = self.check_budget();

        let migrator = match tokio::time::timeout(budget, self.check_marker()).await {
            Ok(Ok((migrator, None))) => Some(migrator),
            Ok(Ok((migrator, Some(status)))) if status.completed => {
                info!(completed_at = %status.timestamp, "Migration already completed");
                self.set_migration(MigrationSummary::AlreadyCompleted {
                    completed_at: status.timestamp,
                });
                migrator.close();
                return;
            }
            Ok(Ok((migrator, Some(_)))) => Some(migrator),
            Ok(Err(err)) => {
                warn!(error = %err, "Migration check failed, assuming migration is required");
                None
            }
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "Migration check timed out, skipping migration");
                return self.migration_failed(format!(
                    "relational store did not answer the migration check within {budget:?}"
                ));
            }
        };

        self.transition(ControllerState::Migrating);
        let migrator = match migrator {
            Some(migrator) => migrator,
            None => match tokio::time::timeout(budget, Migrator::connect(&self.config)).await {
                Ok(Ok(migrator)) => migrator,
                Ok(Err(err)) => return self.migration_failed(err.to_string()),
                Err(_) => {
                    return self.migration_failed(format!(
                        "relational store did not answer within {budget:?}"
                    ));
                }
            },
        };

        match migrator.run().await {
            Ok(MigrationOutcome::Completed { status }) => {
                self.set_migration(MigrationSummary::completed(&status));
            }
            Ok(MigrationOutcome::AlreadyCompleted { status }) => {
                self.set_migration(MigrationSummary::AlreadyCompleted {
                    completed_at: status.timestamp,
                });
            }
            Err(MigrationError::NotFound(path)) => {
                info!(path = %path.display(), "No legacy file to migrate");
                self.set_migration(MigrationSummary::Failed {
                    error: format!("legacy file not found at {}", path.display()),
                });
            }
            Err(err) => self.migration_failed(err.to_string()),
        }
        migrator.close();
    }

    async fn check_marker(
        &self,
    ) -> Result<(Migrator, Option<crate::migrate::MigrationStatus>), MigrationError> {
        let migrator = Migrator::connect(&self.config).await?;
        let status = migrator.status().await;
        match status {
            Ok(status) => Ok((migrator, status)),
            Err(err) => {
                migrator.close();
                Err(err)
            }
        }
    }

    fn migration_failed(&self, message: String) {
        error!(error = %message, "Migration failed, continuing startup");
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(format!("migration: {message}"));
        self.set_migration(MigrationSummary::Failed { error: message });
    }

    /// CONNECTING: race adapter bring-up against the fallback timeout. On
    /// timeout the token is cancelled and the attempt dropped.
    async fn connect_relational(&self) -> Result<(RelationalStore, DataSnapshot), StoreError> {
        let budget = self.config.fallback.timeout;
        let cancel = CancellationToken::new();
        let attempt = async {
            let driver =
                QueryDriver::connect_with(&self.config.database, &cancel, Some(&self.retries))
                    .await?;
            let store = RelationalStore::open(driver).await?;
            let snapshot = store.load_snapshot().await?;
            Ok::<_, StoreError>((store, snapshot))
        };

        tokio::select! {
            result = attempt => result,
            _ = tokio::time::sleep(budget) => {
                cancel.cancel();
                warn!(budget_ms = budget.as_millis() as u64, "Relational store bring-up timed out");
                Err(StoreError::Timeout(budget))
            }
        }
    }

    fn check_budget(&self) -> Duration {
        self.config
            .database
            .connect_timeout
            .min(self.config.fallback.timeout)
    }

    // ── Accessor surface ─────────────────────────────────────────────

    /// Read-only view of the in-memory snapshot.
    pub async fn data(&self) -> RwLockReadGuard<'_, DataSnapshot> {
        self.data.read().await
    }

    /// Mutable view of the in-memory snapshot. Changes reach the backend on
    /// the next `write()`.
    pub async fn data_mut(&self) -> RwLockWriteGuard<'_, DataSnapshot> {
        self.data.write().await
    }

    /// Reload the snapshot from the active backend.
    pub async fn read(&self) -> Result<DataSnapshot, StoreError> {
        let _guard = self.sync.lock().await;
        let store = self.active()?;
        let snapshot = store.load().await?;
        *self.data.write().await = snapshot.clone();
        debug!(backend = %store.kind(), records = snapshot.record_count(), "Snapshot reloaded");
        Ok(snapshot)
    }

    /// Flush the whole snapshot to the active backend. Legacy alias keys are
    /// first rewritten from their canonical fields.
    pub async fn write(&self) -> Result<DataSnapshot, StoreError> {
        let _guard = self.sync.lock().await;
        let store = self.active()?;
        let snapshot = {
            let mut data = self.data.write().await;
            data.sync_aliases()
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            data.clone()
        };
        store.save(&snapshot).await?;
        debug!(backend = %store.kind(), records = snapshot.record_count(), "Snapshot flushed");
        Ok(snapshot)
    }

    pub async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonRow>, StoreError> {
        self.active()?.query(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, StoreError> {
        self.active()?.execute(sql, params).await
    }

    pub async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<u64>, StoreError> {
        self.active()?.transaction(statements).await
    }

    pub fn status(&self) -> StoreStatus {
        let backend = self.backend();
        StoreStatus {
            state: self.state(),
            backend,
            fallback: backend == Some(BackendKind::FlatFile),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            retry_count: self.retries.load(Ordering::SeqCst),
            uptime_secs: self.started.elapsed().as_secs(),
            started_at: self.started_at,
            migration: self
                .migration
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let backend = match self.active() {
            Ok(store) => Some(store.health().await),
            Err(_) => None,
        };
        HealthReport {
            healthy: backend.as_ref().is_some_and(|b| b.healthy),
            status: self.status(),
            backend,
        }
    }

    /// Release the backend. Every later call fails with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.sync.lock().await;
        if let Some(store) = self.backend.get() {
            store.close().await;
        }
        self.transition(ControllerState::Closed);
        info!(uptime_secs = self.started.elapsed().as_secs(), "Store closed");
    }

    // ── Internals ────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn active(&self) -> Result<&dyn Store, StoreError> {
        self.ensure_open()?;
        self.backend
            .get()
            .map(|store| &**store)
            .ok_or(StoreError::NotInitialized)
    }

    fn transition(&self, next: ControllerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "Unexpected state transition");
        }
        *state = next;
        info!(from = %previous, to = %next, "Store state changed");
    }

    fn record_error(&self, err: &StoreError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    fn set_migration(&self, summary: MigrationSummary) {
        *self.migration.lock().unwrap_or_else(PoisonError::into_inner) = summary;
    }
}
