use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("only .ics calendar files are accepted, got {0:?}")]
    UnsupportedExtension(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl UploadError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub path: PathBuf,
    pub original_name: String,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Staging directory for calendar payloads waiting to be imported.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<unix-millis>-<random>.ics`; rejects anything not named `*.ics`.
    pub fn upload_file_name(received_at: DateTime<Utc>, original_name: &str) -> Result<String, UploadError> {
        let is_calendar = Path::new(original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("ics"));
        if !is_calendar {
            return Err(UploadError::UnsupportedExtension(original_name.to_string()));
        }
        Ok(format!(
            "{}-{}.ics",
            received_at.timestamp_millis(),
            Uuid::new_v4().simple()
        ))
    }

    /// Writes the payload through a temp file and an atomic rename.
    pub async fn stage_bytes(&self, original_name: &str, bytes: &[u8]) -> Result<StagedUpload, UploadError> {
        let file_name = Self::upload_file_name(Utc::now(), original_name)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| UploadError::io(format!("creating upload directory {}", self.root.display()), e))?;

        let final_path = self.root.join(&file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| UploadError::io(format!("opening temp upload {}", temp_path.display()), e))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(UploadError::io(
                format!("writing temp upload {}", temp_path.display()),
                err,
            ));
        }

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(UploadError::io(
                format!(
                    "renaming temp upload {} -> {}",
                    temp_path.display(),
                    final_path.display()
                ),
                err,
            ));
        }

        debug!(path = %final_path.display(), bytes = bytes.len(), "staged upload");
        Ok(StagedUpload {
            path: final_path,
            original_name: original_name.to_string(),
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    /// Stages a copy of a file on disk; the source is left untouched.
    pub async fn stage_file(&self, source: &Path) -> Result<StagedUpload, UploadError> {
        let original_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if Self::upload_file_name(Utc::now(), &original_name).is_err() {
            return Err(UploadError::UnsupportedExtension(original_name));
        }
        let bytes = fs::read(source)
            .await
            .map_err(|e| UploadError::io(format!("reading {}", source.display()), e))?;
        self.stage_bytes(&original_name, &bytes).await
    }
}

/// Best-effort removal of a staged upload; failures are only logged.
pub async fn discard_upload(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %err, "failed to remove staged upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn upload_hashing_is_stable() {
        let hash = UploadStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn only_calendar_names_are_accepted() {
        let at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let name = UploadStore::upload_file_name(at, "agenda.ICS").expect("ics accepted");
        assert!(name.starts_with("1771934400000-"));
        assert!(name.ends_with(".ics"));

        assert!(matches!(
            UploadStore::upload_file_name(at, "agenda.csv"),
            Err(UploadError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            UploadStore::upload_file_name(at, "ics"),
            Err(UploadError::UnsupportedExtension(_))
        ));
    }

    #[tokio::test]
    async fn staging_writes_unique_files_and_discard_removes_them() {
        let dir = tempdir().expect("tempdir");
        let store = UploadStore::new(dir.path().join("uploads"));

        let first = store
            .stage_bytes("agenda.ics", b"BEGIN:VCALENDAR")
            .await
            .expect("first stage");
        let second = store
            .stage_bytes("agenda.ics", b"BEGIN:VCALENDAR")
            .await
            .expect("second stage");

        assert_ne!(first.path, second.path);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.byte_size, 15);
        assert_eq!(fs::read(&first.path).await.expect("read"), b"BEGIN:VCALENDAR");

        discard_upload(&first.path).await;
        assert!(!first.path.exists());
        // A second discard only logs.
        discard_upload(&first.path).await;
    }

    #[tokio::test]
    async fn stage_file_copies_and_keeps_source() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("exportado.ics");
        std::fs::write(&source, "BEGIN:VCALENDAR\nEND:VCALENDAR\n").expect("write source");

        let store = UploadStore::new(dir.path().join("uploads"));
        let staged = store.stage_file(&source).await.expect("stage");

        assert!(source.exists());
        assert!(staged.path.starts_with(store.root()));
        assert_eq!(staged.original_name, "exportado.ics");
    }
}
