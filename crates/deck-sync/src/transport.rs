use std::sync::Arc;

use async_trait::async_trait;
use deck::{fingerprint, AssetRef, DocumentId, Record, SlideId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{Result, SyncError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Saved,
    Rejected,
}

/// Outcome of posting one record, carrying the store's copy of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostResult {
    pub status: RecordStatus,
    pub record: Record,
    #[serde(default)]
    pub message: Option<String>,
}

impl PostResult {
    pub fn saved(record: Record) -> Self {
        Self {
            status: RecordStatus::Saved,
            record,
            message: None,
        }
    }
}

/// Keeps the store's records when every post was accepted.
pub fn accepted(results: Vec<PostResult>) -> Result<Vec<Record>> {
    if let Some(rejected) = results
        .iter()
        .find(|result| result.status == RecordStatus::Rejected)
    {
        return Err(SyncError::UploadFailed(format!(
            "record {} rejected: {}",
            rejected.record.id,
            rejected.message.as_deref().unwrap_or("no reason given")
        )));
    }
    Ok(results.into_iter().map(|result| result.record).collect())
}

/// Binary content waiting to be uploaded.
#[derive(Debug, Clone)]
pub struct AssetUpload {
    pub fingerprint: String,
    pub data: Arc<[u8]>,
}

impl AssetUpload {
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self {
            fingerprint: fingerprint(&data),
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn asset_ref(&self) -> AssetRef {
        AssetRef {
            fingerprint: self.fingerprint.clone(),
            uploaded: false,
            size: self.size(),
        }
    }
}

/// Remote record store.
///
/// `post` and `upload_asset` honour the cancellation token; `delete` is only
/// used on rollback paths and is never cancelled.
#[async_trait]
pub trait RecordTransport: Send + Sync {
    async fn post(&self, records: Vec<Record>, cancel: &CancellationToken)
        -> Result<Vec<PostResult>>;

    async fn delete(&self, records: Vec<Record>) -> Result<()>;

    /// Every record of a document: the presentation, its slides and media.
    async fn fetch(&self, document: DocumentId) -> Result<Vec<Record>>;

    /// One slide record followed by its media children.
    async fn fetch_one(&self, document: DocumentId, slide: SlideId) -> Result<Vec<Record>>;

    async fn upload_asset(&self, upload: &AssetUpload, cancel: &CancellationToken)
        -> Result<AssetRef>;

    /// Presentation records of every document in the store.
    async fn list_documents(&self) -> Result<Vec<Record>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck::PresentationFields;

    #[test]
    fn test_rejection_fails_the_batch() {
        let document = DocumentId::new();
        let record = Record::presentation(document, PresentationFields::default());
        let mut rejected = PostResult::saved(record.clone());
        rejected.status = RecordStatus::Rejected;
        rejected.message = Some("quota".to_string());

        let err = accepted(vec![PostResult::saved(record), rejected]).unwrap_err();
        assert!(matches!(err, SyncError::UploadFailed(message) if message.contains("quota")));
    }

    #[test]
    fn test_asset_upload_fingerprint() {
        let upload = AssetUpload::from_bytes(b"pixels".to_vec());
        assert_eq!(upload.size(), 6);
        assert_eq!(upload.asset_ref().fingerprint, fingerprint(b"pixels"));
        assert!(!upload.asset_ref().uploaded);
    }
}
