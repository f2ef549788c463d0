//! File store collaborator.
//!
//! Persists raw upload bytes under the configured upload directory and
//! records the metadata row. A failed metadata write is deferred — logged
//! and queued for a later retry — rather than failing the save, which is
//! why the upload workflow re-verifies the document id afterwards and
//! treats an unresolvable id as a data-integrity failure.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::models::file_type_for;
use crate::storage::Storage;

/// Outcome of a successful save.
#[derive(Debug, Clone)]
pub struct SavedFile {
    pub filename: String,
    pub path: PathBuf,
    pub status: String,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist `bytes` as `filename` and record its metadata.
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<SavedFile>;
}

/// Metadata that could not be written when its file was saved.
#[derive(Debug, Clone)]
struct PendingMetadata {
    filename: String,
    storage_path: String,
    file_type: String,
    file_size: i64,
}

pub struct LocalFileStore {
    upload_dir: PathBuf,
    storage: Arc<dyn Storage>,
    unsynced: Mutex<Vec<PendingMetadata>>,
}

impl LocalFileStore {
    pub fn new(upload_dir: impl Into<PathBuf>, storage: Arc<dyn Storage>) -> Result<Self> {
        let upload_dir = upload_dir.into();
        std::fs::create_dir_all(&upload_dir)
            .with_context(|| format!("failed to create upload directory: {}", upload_dir.display()))?;
        Ok(Self {
            upload_dir,
            storage,
            unsynced: Mutex::new(Vec::new()),
        })
    }

    /// Retry metadata rows whose original write failed. Called
    /// opportunistically from the next successful save.
    async fn sync_unsynced(&self) {
        let pending: Vec<PendingMetadata> = {
            let mut unsynced = self.unsynced.lock().expect("unsynced lock poisoned");
            std::mem::take(&mut *unsynced)
        };
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "retrying unsynced document metadata");

        for meta in pending {
            let result = self
                .storage
                .store_document(
                    &meta.filename,
                    &meta.storage_path,
                    &meta.file_type,
                    meta.file_size,
                )
                .await;
            if let Err(e) = result {
                error!(filename = %meta.filename, error = %e, "metadata retry failed");
                self.unsynced
                    .lock()
                    .expect("unsynced lock poisoned")
                    .push(meta);
            }
        }
    }
}

/// Reject path-traversal names; saved files always land directly in the
/// upload directory.
fn sanitize_filename(filename: &str) -> Result<&str> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..");
    match name {
        Some(n) if n == filename => Ok(n),
        _ => anyhow::bail!("invalid filename: {:?}", filename),
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<SavedFile> {
        let filename = sanitize_filename(filename)?;
        let path = self.upload_dir.join(filename);

        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write upload: {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        let file_type = file_type_for(filename);
        let file_size = bytes.len() as i64;

        let stored = self
            .storage
            .store_document(filename, &path.display().to_string(), file_type, file_size)
            .await;
        match stored {
            Ok(id) => {
                info!(filename = %filename, document_id = %id, "uploaded file");
                self.sync_unsynced().await;
            }
            Err(e) => {
                // The file write already took effect; defer the metadata
                // row instead of losing it.
                warn!(filename = %filename, error = %e, "metadata write failed, queuing for retry");
                self.unsynced
                    .lock()
                    .expect("unsynced lock poisoned")
                    .push(PendingMetadata {
                        filename: filename.to_string(),
                        storage_path: path.display().to_string(),
                        file_type: file_type.to_string(),
                        file_size,
                    });
            }
        }

        Ok(SavedFile {
            filename: filename.to_string(),
            path,
            status: "success".to_string(),
        })
    }
}
