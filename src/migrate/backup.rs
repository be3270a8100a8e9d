//! Step 3: durable, timestamped copy of the legacy file.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::MigrationError;

/// Write `raw` to `<dir>/<stem>-<timestamp>.<ext>` and sync it to disk.
pub async fn backup(source: &Path, raw: &[u8], dir: &Path) -> Result<PathBuf, MigrationError> {
    let fail = |reason: String| MigrationError::Backup {
        path: source.to_path_buf(),
        reason,
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| fail(format!("create {}: {e}", dir.display())))?;

    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("database");
    let extension = source
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("json");
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");

    // Never overwrite an earlier backup taken within the same millisecond.
    let mut attempt = 0u32;
    let (target, mut file) = loop {
        let name = match attempt {
            0 => format!("{stem}-{stamp}.{extension}"),
            n => format!("{stem}-{stamp}-{n}.{extension}"),
        };
        let target = dir.join(name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(file) => break (target, file),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 => {
                attempt += 1;
            }
            Err(e) => return Err(fail(format!("create {}: {e}", target.display()))),
        }
    };
    file.write_all(raw)
        .await
        .map_err(|e| fail(format!("write {}: {e}", target.display())))?;
    file.sync_all()
        .await
        .map_err(|e| fail(format!("sync {}: {e}", target.display())))?;

    info!(
        source = %source.display(),
        backup = %target.display(),
        bytes = raw.len(),
        "Backed up legacy snapshot"
    );
    Ok(target)
}
