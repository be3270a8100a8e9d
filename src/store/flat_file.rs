//! Flat-file backend over the legacy JSON document.
//!
//! Loading repairs what it must. When a repair discards a raw value (a
//! record that is not an object, a collection of the wrong shape), the
//! untouched file is copied aside once before anything can overwrite it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::migrate::backup::backup;
use crate::model::{DataSnapshot, load_legacy};
use crate::store::traits::{BackendHealth, BackendKind, Store};

pub struct FlatFileStore {
    path: PathBuf,
    backup_dir: PathBuf,
    preserved: AtomicBool,
}

impl FlatFileStore {
    /// Copies taken before a lossy repair go next to the file unless
    /// [`with_backup_dir`](Self::with_backup_dir) says otherwise.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            path,
            backup_dir,
            preserved: AtomicBool::new(false),
        }
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn preserve(&self, raw: &[u8]) -> Result<(), StoreError> {
        if self.preserved.load(Ordering::SeqCst) {
            return Ok(());
        }
        let copy = backup(&self.path, raw, &self.backup_dir)
            .await
            .map_err(|e| StoreError::Preserve {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        self.preserved.store(true, Ordering::SeqCst);
        warn!(
            path = %self.path.display(),
            copy = %copy.display(),
            "Legacy file lost values during repair, original preserved"
        );
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl Store for FlatFileStore {
    fn kind(&self) -> BackendKind {
        BackendKind::FlatFile
    }

    async fn load(&self) -> Result<DataSnapshot, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Legacy file not found, starting empty");
                return Ok(DataSnapshot::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(DataSnapshot::default());
        }

        let document = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Serialization(format!("{}: {e}", self.path.display()))
        })?;
        let load = load_legacy(document, false)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", self.path.display())))?;
        if !load.warnings.is_empty() {
            warn!(
                path = %self.path.display(),
                coerced_records = load.warnings.len(),
                replaced = load.replaced.len(),
                "Legacy file needed repairs on load"
            );
        }
        if load.is_lossy() {
            self.preserve(&bytes).await?;
        }
        Ok(load.snapshot)
    }

    /// Replace the file atomically: write a sibling temp file, sync, rename.
    async fn save(&self, snapshot: &DataSnapshot) -> Result<(), StoreError> {
        let started = Instant::now();
        let body = snapshot
            .to_value()
            .and_then(|document| serde_json::to_vec_pretty(&document))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let temp = self.path.with_file_name(temp_name);

        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, &self.path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.io_error(e));
        }

        debug!(
            path = %self.path.display(),
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot written to legacy file"
        );
        Ok(())
    }

    async fn health(&self) -> BackendHealth {
        let started = Instant::now();
        let error = match tokio::fs::metadata(&self.path).await {
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => Some(e.to_string()),
        };
        BackendHealth {
            backend: BackendKind::FlatFile,
            healthy: error.is_none(),
            latency_ms: started.elapsed().as_millis() as u64,
            pool: None,
            queries: None,
            error,
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqlValue;
    use serde_json::json;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::new(dir.path().join("database.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::new(dir.path().join("nested/database.json"));

        let mut snapshot = DataSnapshot::default();
        snapshot.users.insert(
            "1@s.whatsapp.net".into(),
            serde_json::from_value(json!({"exp": 3.5, "afk": -1, "badge": "gold"})).unwrap(),
        );
        snapshot.settings.insert("prefix".into(), json!("!"));
        snapshot.extensions.insert("msgs".into(), json!({"hi": "hello"}));

        store.save(&snapshot).await.unwrap();
        assert_eq!(store.load().await.unwrap(), snapshot);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn load_coerces_bad_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        std::fs::write(&path, r#"{"users":{"123@x":{"exp":"NaN","premium":"yes"}}}"#).unwrap();

        let snapshot = FlatFileStore::new(&path).load().await.unwrap();
        assert_eq!(snapshot.users["123@x"].exp, 0.0);
        assert!(!snapshot.users["123@x"].premium);
    }

    #[tokio::test]
    async fn legacy_aliases_survive_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        std::fs::write(&path, r#"{"chats":{"g@g.us":{"antilink":true,"modoadmin":true}}}"#)
            .unwrap();
        let store = FlatFileStore::new(&path);

        let mut snapshot = store.load().await.unwrap();
        let chat = &snapshot.chats["g@g.us"];
        assert!(chat.anti_link && chat.only_admin);
        assert_eq!(chat.extra["antilink"], json!(true));
        assert_eq!(chat.extra["modoadmin"], json!(true));

        snapshot.chats.get_mut("g@g.us").unwrap().anti_link = false;
        store.save(&snapshot).await.unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["chats"]["g@g.us"]["antilink"], json!(false));
        assert_eq!(on_disk["chats"]["g@g.us"]["antiLink"], json!(false));
        assert_eq!(on_disk["chats"]["g@g.us"]["modoadmin"], json!(true));
    }

    #[tokio::test]
    async fn non_object_records_keep_their_key_and_the_original_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        let raw = r#"{"users":{"a@s":{"exp":1},"b@s":null},"settings":"broken"}"#;
        std::fs::write(&path, raw).unwrap();
        let store = FlatFileStore::new(&path).with_backup_dir(dir.path().join("backups"));

        let snapshot = store.load().await.unwrap();
        assert!(snapshot.users.contains_key("b@s"));
        store.save(&snapshot).await.unwrap();

        let reread = store.load().await.unwrap();
        assert_eq!(reread.users.keys().collect::<Vec<_>>(), vec!["a@s", "b@s"]);
        assert_eq!(reread, snapshot);

        let copies: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(std::fs::read_to_string(copies[0].path()).unwrap(), raw);
    }

    #[tokio::test]
    async fn clean_file_is_not_copied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        std::fs::write(&path, r#"{"users":{"a@s":{"exp":"7"}}}"#).unwrap();
        let store = FlatFileStore::new(&path).with_backup_dir(dir.path().join("backups"));
        store.load().await.unwrap();
        assert!(!dir.path().join("backups").exists());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FlatFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn raw_sql_is_unavailable() {
        let store = FlatFileStore::new("unused.json");
        let err = store.query("SELECT 1", Vec::<SqlValue>::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert!(err.to_string().contains("fallback"));
    }
}
