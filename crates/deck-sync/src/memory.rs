//! In-process record store.
//!
//! Behaves like the remote store for local (accountless) documents: records
//! are upserted by id and stamped, binary content is kept by fingerprint.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deck::{fingerprint, AssetRef, Collection, DocumentId, Record, SlideId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{AssetUpload, PostResult, RecordTransport, Result, SyncError};

/// Everything a store holds. Asset bytes are hex encoded so the state can
/// be written out as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreState {
    #[serde(default)]
    pub records: BTreeMap<Uuid, Record>,
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
}

impl StoreState {
    fn upsert(&mut self, mut record: Record) -> Record {
        let now = Utc::now();
        record.created_at = self
            .records
            .get(&record.id)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        record.updated_at = Some(now);
        if let Some(asset) = record
            .media_fields_mut()
            .and_then(|fields| fields.asset.as_mut())
        {
            asset.uploaded = self.assets.contains_key(&asset.fingerprint);
        }
        self.records.insert(record.id, record.clone());
        record
    }

    /// Removes records and everything parented to them.
    fn remove(&mut self, ids: &[Uuid]) -> usize {
        let mut pending: Vec<Uuid> = ids.to_vec();
        let mut removed = 0;
        while let Some(id) = pending.pop() {
            if self.records.remove(&id).is_some() {
                removed += 1;
            }
            pending.extend(
                self.records
                    .values()
                    .filter(|record| record.parent_id == id && record.id != id)
                    .map(|record| record.id),
            );
        }
        removed
    }

    fn document_records(&self, document: DocumentId) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .records
            .values()
            .filter(|record| record.document_id == document)
            .cloned()
            .collect();
        records.sort_by_key(|record| match record.collection() {
            Collection::Presentation => 0,
            Collection::Slide => 1,
            Collection::Media => 2,
        });
        records
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.lock().clone()
    }

    pub fn record(&self, id: Uuid) -> Option<Record> {
        self.state.lock().records.get(&id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn asset(&self, fingerprint: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .assets
            .get(fingerprint)
            .and_then(|encoded| hex::decode(encoded).ok())
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl RecordTransport for MemoryTransport {
    async fn post(
        &self,
        records: Vec<Record>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PostResult>> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let results = records
            .into_iter()
            .map(|record| {
                if record.deleted {
                    state.remove(&[record.id]);
                    PostResult::saved(record)
                } else {
                    PostResult::saved(state.upsert(record))
                }
            })
            .collect();
        Ok(results)
    }

    async fn delete(&self, records: Vec<Record>) -> Result<()> {
        let ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
        let removed = self.state.lock().remove(&ids);
        debug!(requested = ids.len(), removed, "deleted records");
        Ok(())
    }

    async fn fetch(&self, document: DocumentId) -> Result<Vec<Record>> {
        Ok(self.state.lock().document_records(document))
    }

    async fn fetch_one(&self, document: DocumentId, slide: SlideId) -> Result<Vec<Record>> {
        let state = self.state.lock();
        let parent = state
            .records
            .get(&slide.0)
            .filter(|record| record.document_id == document)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("slide {slide}")))?;
        let mut records = vec![parent];
        records.extend(
            state
                .records
                .values()
                .filter(|record| record.parent_id == slide.0)
                .cloned(),
        );
        Ok(records)
    }

    async fn upload_asset(
        &self,
        upload: &AssetUpload,
        cancel: &CancellationToken,
    ) -> Result<AssetRef> {
        check_cancelled(cancel)?;
        if fingerprint(&upload.data) != upload.fingerprint {
            return Err(SyncError::UploadFailed(format!(
                "content does not match fingerprint {}",
                upload.fingerprint
            )));
        }
        self.state
            .lock()
            .assets
            .insert(upload.fingerprint.clone(), hex::encode(&upload.data));
        Ok(AssetRef {
            fingerprint: upload.fingerprint.clone(),
            uploaded: true,
            size: upload.size(),
        })
    }

    async fn list_documents(&self) -> Result<Vec<Record>> {
        Ok(self
            .state
            .lock()
            .records
            .values()
            .filter(|record| record.collection() == Collection::Presentation)
            .cloned()
            .collect())
    }
}
