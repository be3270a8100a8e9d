//! Status and health reports exposed by the controller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::controller::state::ControllerState;
use crate::migrate::MigrationStatus;
use crate::store::{BackendHealth, BackendKind};

/// What happened to migration during startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationSummary {
    /// Startup has not reached the check yet.
    Pending,
    /// Turned off by configuration.
    Disabled,
    /// The marker said completed.
    AlreadyCompleted { completed_at: DateTime<Utc> },
    Completed {
        run_id: Uuid,
        migrated: u64,
        failed: u64,
        warnings: usize,
    },
    Failed { error: String },
}

impl MigrationSummary {
    pub fn completed(status: &MigrationStatus) -> Self {
        MigrationSummary::Completed {
            run_id: status.stats.run_id,
            migrated: status.stats.total_migrated(),
            failed: status.stats.total_failed(),
            warnings: status.stats.warnings.len(),
        }
    }
}

/// Snapshot of the controller for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub state: ControllerState,
    /// Active backend, once one is selected.
    pub backend: Option<BackendKind>,
    pub fallback: bool,
    pub last_error: Option<String>,
    /// Connection retries performed during startup.
    pub retry_count: u32,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub migration: MigrationSummary,
}

/// `StoreStatus` plus a live probe of the active backend.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status: StoreStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendHealth>,
}
