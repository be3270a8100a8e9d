//! Configuration types.
//!
//! Every setting is a key/value pair. `StoreConfig::from_env()` reads them from
//! the process environment; `StoreConfig::from_pairs()` takes them from any
//! iterator, which is what tests and embedding applications use. Missing or
//! unparsable values fall back to the defaults below.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Every key the store reads.
pub mod keys {
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const DB_HOST: &str = "DB_HOST";
    pub const DB_PORT: &str = "DB_PORT";
    pub const DB_NAME: &str = "DB_NAME";
    pub const DB_AUTH_TOKEN: &str = "DB_AUTH_TOKEN";
    pub const DB_TLS: &str = "DB_TLS";
    pub const DB_POOL_SIZE: &str = "DB_POOL_SIZE";
    pub const DB_CONNECT_TIMEOUT_MS: &str = "DB_CONNECT_TIMEOUT_MS";
    pub const DB_IDLE_TIMEOUT_SECS: &str = "DB_IDLE_TIMEOUT_SECS";
    pub const DB_CONNECT_RETRIES: &str = "DB_CONNECT_RETRIES";
    pub const DB_RETRY_BACKOFF_MS: &str = "DB_RETRY_BACKOFF_MS";
    pub const DB_SLOW_QUERY_MS: &str = "DB_SLOW_QUERY_MS";
    pub const FALLBACK_ENABLED: &str = "FALLBACK_ENABLED";
    pub const FALLBACK_TIMEOUT_MS: &str = "FALLBACK_TIMEOUT_MS";
    pub const LEGACY_DB_PATH: &str = "LEGACY_DB_PATH";
    pub const BACKUP_DIR: &str = "BACKUP_DIR";
    pub const MIGRATION_ENABLED: &str = "MIGRATION_ENABLED";
    pub const MIGRATION_BATCH_SIZE: &str = "MIGRATION_BATCH_SIZE";
    pub const MIGRATION_STRICT: &str = "MIGRATION_STRICT";

    pub(crate) const ALL: &[&str] = &[
        DATABASE_URL,
        DB_HOST,
        DB_PORT,
        DB_NAME,
        DB_AUTH_TOKEN,
        DB_TLS,
        DB_POOL_SIZE,
        DB_CONNECT_TIMEOUT_MS,
        DB_IDLE_TIMEOUT_SECS,
        DB_CONNECT_RETRIES,
        DB_RETRY_BACKOFF_MS,
        DB_SLOW_QUERY_MS,
        FALLBACK_ENABLED,
        FALLBACK_TIMEOUT_MS,
        LEGACY_DB_PATH,
        BACKUP_DIR,
        MIGRATION_ENABLED,
        MIGRATION_BATCH_SIZE,
        MIGRATION_STRICT,
    ];
}

const DEFAULT_LOCAL_DB: &str = "file:./data/bot-store.db";

/// Where the relational store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    /// A local libSQL database file.
    Local(PathBuf),
    /// A remote libSQL/sqld server reached over HTTP(S).
    Remote(String),
}

impl DatabaseTarget {
    /// Parse a connection string. `libsql://`, `http://`, `https://`, `ws://`
    /// and `wss://` are remote; `file:` URLs and bare paths are local.
    pub fn parse(url: &str) -> Self {
        let url = url.trim();
        let lower = url.to_ascii_lowercase();
        if ["libsql://", "http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            return DatabaseTarget::Remote(url.to_string());
        }
        let path = url
            .strip_prefix("file://")
            .or_else(|| url.strip_prefix("file:"))
            .unwrap_or(url);
        DatabaseTarget::Local(PathBuf::from(path))
    }

    /// Printable form, safe to log.
    pub fn display(&self) -> String {
        match self {
            DatabaseTarget::Local(path) => format!("file:{}", path.display()),
            DatabaseTarget::Remote(url) => url.clone(),
        }
    }
}

/// Relational-store connection and pool settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub target: DatabaseTarget,
    /// Auth token for remote targets. Empty for local files.
    pub auth_token: SecretString,
    /// Whether a composed host/port target uses `https`.
    pub tls: bool,
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Connection attempts before `connect()` gives up (at least 1).
    pub connect_retries: u32,
    /// First backoff delay; doubles on each further attempt.
    pub retry_backoff: Duration,
    /// Queries slower than this are logged and counted as slow.
    pub slow_query_threshold: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            target: DatabaseTarget::parse(DEFAULT_LOCAL_DB),
            auth_token: SecretString::from(String::new()),
            tls: true,
            pool_size: 10,
            connect_timeout: Duration::from_millis(5_000),
            idle_timeout: Duration::from_secs(300),
            connect_retries: 3,
            retry_backoff: Duration::from_millis(200),
            slow_query_threshold: Duration::from_millis(1_000),
        }
    }
}

impl DatabaseConfig {
    /// Whether an auth token was configured.
    pub fn has_auth_token(&self) -> bool {
        !self.auth_token.expose_secret().is_empty()
    }
}

/// Legacy-store fallback settings.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Budget for the CONNECTING race.
    pub timeout: Duration,
    /// Path of the legacy flat-file JSON snapshot.
    pub legacy_path: PathBuf,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_millis(10_000),
            legacy_path: PathBuf::from("./database.json"),
        }
    }
}

/// Migration-engine settings.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub enabled: bool,
    pub batch_size: usize,
    /// Abort on the first validation error instead of coercing.
    pub strict: bool,
    pub backup_dir: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            strict: false,
            backup_dir: PathBuf::from("./backups"),
        }
    }
}

/// Complete store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub database: DatabaseConfig,
    pub fallback: FallbackConfig,
    pub migration: MigrationConfig,
}

impl StoreConfig {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        let pairs = keys::ALL
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)));
        Self::from_pairs(pairs)
    }

    /// Build from key/value pairs. Unknown keys are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |key: &str| map.get(key).map(|v| v.trim().to_string());

        let db_defaults = DatabaseConfig::default();
        let tls = get(keys::DB_TLS)
            .and_then(|s| parse_bool(&s))
            .unwrap_or(db_defaults.tls);

        let target = match get(keys::DATABASE_URL) {
            Some(url) => DatabaseTarget::parse(&url),
            None => match get(keys::DB_HOST) {
                Some(host) => {
                    let port: u16 = get(keys::DB_PORT)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(8080);
                    compose_remote(&host, port, get(keys::DB_NAME).as_deref(), tls)
                }
                None => db_defaults.target.clone(),
            },
        };

        let database = DatabaseConfig {
            target,
            auth_token: SecretString::from(get(keys::DB_AUTH_TOKEN).unwrap_or_default()),
            tls,
            pool_size: parse_or(get(keys::DB_POOL_SIZE), db_defaults.pool_size),
            connect_timeout: Duration::from_millis(parse_or(
                get(keys::DB_CONNECT_TIMEOUT_MS),
                db_defaults.connect_timeout.as_millis() as u64,
            )),
            idle_timeout: Duration::from_secs(parse_or(
                get(keys::DB_IDLE_TIMEOUT_SECS),
                db_defaults.idle_timeout.as_secs(),
            )),
            connect_retries: parse_or(get(keys::DB_CONNECT_RETRIES), db_defaults.connect_retries),
            retry_backoff: Duration::from_millis(parse_or(
                get(keys::DB_RETRY_BACKOFF_MS),
                db_defaults.retry_backoff.as_millis() as u64,
            )),
            slow_query_threshold: Duration::from_millis(parse_or(
                get(keys::DB_SLOW_QUERY_MS),
                db_defaults.slow_query_threshold.as_millis() as u64,
            )),
        };

        let fb_defaults = FallbackConfig::default();
        let fallback = FallbackConfig {
            enabled: get(keys::FALLBACK_ENABLED)
                .and_then(|s| parse_bool(&s))
                .unwrap_or(fb_defaults.enabled),
            timeout: Duration::from_millis(parse_or(
                get(keys::FALLBACK_TIMEOUT_MS),
                fb_defaults.timeout.as_millis() as u64,
            )),
            legacy_path: get(keys::LEGACY_DB_PATH)
                .map(PathBuf::from)
                .unwrap_or(fb_defaults.legacy_path),
        };

        let mig_defaults = MigrationConfig::default();
        let migration = MigrationConfig {
            enabled: get(keys::MIGRATION_ENABLED)
                .and_then(|s| parse_bool(&s))
                .unwrap_or(mig_defaults.enabled),
            batch_size: parse_or(get(keys::MIGRATION_BATCH_SIZE), mig_defaults.batch_size),
            strict: get(keys::MIGRATION_STRICT)
                .and_then(|s| parse_bool(&s))
                .unwrap_or(mig_defaults.strict),
            backup_dir: get(keys::BACKUP_DIR)
                .map(PathBuf::from)
                .unwrap_or(mig_defaults.backup_dir),
        };

        Self {
            database,
            fallback,
            migration,
        }
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: keys::DB_POOL_SIZE.into(),
                message: "pool size must be at least 1".into(),
            });
        }
        if self.migration.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: keys::MIGRATION_BATCH_SIZE.into(),
                message: "batch size must be at least 1".into(),
            });
        }
        if self.fallback.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: keys::FALLBACK_TIMEOUT_MS.into(),
                message: "timeout must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Compose a remote target from its parts. A database name selects the sqld
/// namespace through the subdomain.
fn compose_remote(host: &str, port: u16, database: Option<&str>, tls: bool) -> DatabaseTarget {
    let scheme = if tls { "https" } else { "http" };
    let host = match database {
        Some(db) if !db.is_empty() => format!("{db}.{host}"),
        _ => host.to_string(),
    };
    DatabaseTarget::Remote(format!("{scheme}://{host}:{port}"))
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
