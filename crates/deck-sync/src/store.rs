//! JSON-file backed record store.
//!
//! Wraps a [`MemoryTransport`] and writes the whole store out after every
//! change, so a later process can reopen it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use deck::{AssetRef, DocumentId, Record, SlideId};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{AssetUpload, MemoryTransport, PostResult, RecordTransport, Result, StoreState, SyncError};

pub struct FileTransport {
    path: PathBuf,
    memory: MemoryTransport,
    /// Serialises writes to `path`.
    write_lock: Mutex<()>,
}

impl FileTransport {
    /// Opens the store at `path`, starting empty when the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let json = fs::read_to_string(&path)
                .await
                .map_err(|e| SyncError::Storage(format!("failed to read store: {}", e)))?;
            serde_json::from_str::<StoreState>(&json)
                .map_err(|e| SyncError::Storage(format!("failed to parse store: {}", e)))?
        } else {
            StoreState::default()
        };
        info!(path = %path.display(), records = state.records.len(), "opened record store");

        Ok(Self {
            path,
            memory: MemoryTransport::from_state(state),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &MemoryTransport {
        &self.memory
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Storage(format!("failed to create store directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(&self.memory.snapshot())
            .map_err(|e| SyncError::Storage(format!("failed to serialize store: {}", e)))?;

        fs::write(&self.path, json)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to write store: {}", e)))?;

        debug!(path = %self.path.display(), "saved record store");
        Ok(())
    }
}

#[async_trait]
impl RecordTransport for FileTransport {
    async fn post(
        &self,
        records: Vec<Record>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PostResult>> {
        let results = self.memory.post(records, cancel).await?;
        self.save().await?;
        Ok(results)
    }

    async fn delete(&self, records: Vec<Record>) -> Result<()> {
        self.memory.delete(records).await?;
        self.save().await
    }

    async fn fetch(&self, document: DocumentId) -> Result<Vec<Record>> {
        self.memory.fetch(document).await
    }

    async fn fetch_one(&self, document: DocumentId, slide: SlideId) -> Result<Vec<Record>> {
        self.memory.fetch_one(document, slide).await
    }

    async fn upload_asset(
        &self,
        upload: &AssetUpload,
        cancel: &CancellationToken,
    ) -> Result<AssetRef> {
        let asset = self.memory.upload_asset(upload, cancel).await?;
        self.save().await?;
        Ok(asset)
    }

    async fn list_documents(&self) -> Result<Vec<Record>> {
        self.memory.list_documents().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck::PresentationFields;

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let document = DocumentId::new();

        let store = FileTransport::open(&path).await.unwrap();
        let record = Record::presentation(
            document,
            PresentationFields {
                name: "Quarterly review".to_string(),
                ..Default::default()
            },
        );
        store
            .post(vec![record], &CancellationToken::new())
            .await
            .unwrap();
        let upload = AssetUpload::from_bytes(b"chart".to_vec());
        store
            .upload_asset(&upload, &CancellationToken::new())
            .await
            .unwrap();
        assert!(path.exists());

        let reopened = FileTransport::open(&path).await.unwrap();
        let records = reopened.fetch(document).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].presentation_fields().unwrap().name,
            "Quarterly review"
        );
        assert_eq!(
            reopened.memory().asset(&upload.fingerprint).unwrap(),
            b"chart".to_vec()
        );
    }

    #[tokio::test]
    async fn test_corrupt_store_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            FileTransport::open(&path).await,
            Err(SyncError::Storage(_))
        ));
    }
}
