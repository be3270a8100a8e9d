//! Step 1: read and parse the legacy snapshot.

use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::error::MigrationError;

/// The raw legacy document plus the bytes it was parsed from, so the backup
/// step can copy the file verbatim.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub document: Value,
    pub raw: Vec<u8>,
}

pub async fn extract(path: &Path) -> Result<Extracted, MigrationError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MigrationError::NotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(MigrationError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    let document: Value = serde_json::from_slice(&raw).map_err(|e| MigrationError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !document.is_object() {
        return Err(MigrationError::Malformed {
            path: path.to_path_buf(),
            reason: "top level is not an object".into(),
        });
    }

    info!(path = %path.display(), bytes = raw.len(), "Extracted legacy snapshot");
    Ok(Extracted { document, raw })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract(&dir.path().join("database.json")).await.unwrap_err();
        assert!(matches!(err, MigrationError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_json_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        std::fs::write(&path, b"{\"users\": ").unwrap();
        assert!(matches!(
            extract(&path).await.unwrap_err(),
            MigrationError::Malformed { .. }
        ));

        std::fs::write(&path, b"[1,2]").unwrap();
        assert!(matches!(
            extract(&path).await.unwrap_err(),
            MigrationError::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn keeps_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.json");
        std::fs::write(&path, b"{ \"users\": {} }").unwrap();
        let extracted = extract(&path).await.unwrap();
        assert_eq!(extracted.raw, b"{ \"users\": {} }");
        assert!(extracted.document["users"].is_object());
    }
}
