//! Shared fixtures for the sync integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deck::{AssetRef, DocumentId, Record, SlideFields, SlideId, SortKey, UndoHistory};
use deck_sync::*;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A [`MemoryTransport`] that counts calls and fails or stalls on request.
#[derive(Default)]
pub struct ScriptedTransport {
    pub inner: MemoryTransport,
    pub posts: AtomicUsize,
    pub fetches: AtomicUsize,
    pub fetch_ones: AtomicUsize,
    pub uploads: AtomicUsize,
    pub deleted: Mutex<Vec<Uuid>>,
    /// Fires when a held upload has started.
    pub upload_started: Notify,
    fail_post_in: Mutex<Option<usize>>,
    fail_uploads: AtomicBool,
    fail_fetches: AtomicBool,
    upload_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the `n`th post from now (1 is the next one).
    pub fn fail_post_at(&self, n: usize) {
        *self.fail_post_in.lock() = Some(n);
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }

    /// Makes every full-document fetch fail until switched off again.
    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Parks every upload until the returned gate is notified.
    pub fn hold_uploads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.upload_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn was_deleted(&self, id: Uuid) -> bool {
        self.deleted.lock().contains(&id)
    }

    fn post_should_fail(&self) -> bool {
        let mut countdown = self.fail_post_in.lock();
        match *countdown {
            Some(1) => {
                *countdown = None;
                true
            }
            Some(n) => {
                *countdown = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl RecordTransport for ScriptedTransport {
    async fn post(
        &self,
        records: Vec<Record>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PostResult>> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if self.post_should_fail() {
            return Err(SyncError::Transport("scripted post failure".to_string()));
        }
        self.inner.post(records, cancel).await
    }

    async fn delete(&self, records: Vec<Record>) -> Result<()> {
        self.deleted
            .lock()
            .extend(records.iter().map(|record| record.id));
        self.inner.delete(records).await
    }

    async fn fetch(&self, document: DocumentId) -> Result<Vec<Record>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        // Keeps the fetch pending long enough for concurrent callers to overlap.
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("scripted fetch failure".to_string()));
        }
        self.inner.fetch(document).await
    }

    async fn fetch_one(&self, document: DocumentId, slide: SlideId) -> Result<Vec<Record>> {
        self.fetch_ones.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_one(document, slide).await
    }

    async fn upload_asset(
        &self,
        upload: &AssetUpload,
        cancel: &CancellationToken,
    ) -> Result<AssetRef> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let gate = self.upload_gate.lock().clone();
        if let Some(gate) = gate {
            self.upload_started.notify_one();
            gate.notified().await;
        }
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("scripted upload failure".to_string()));
        }
        self.inner.upload_asset(upload, cancel).await
    }

    async fn list_documents(&self) -> Result<Vec<Record>> {
        self.inner.list_documents().await
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        persistence_debounce_ms: 60_000,
        ..SyncConfig::default()
    }
}

pub struct Fixture {
    pub transport: Arc<ScriptedTransport>,
    pub handle: DocumentHandle,
    pub slides: Vec<SlideId>,
    pub history: Arc<UndoHistory>,
    pub coordinator: MutationCoordinator,
}

/// Stores slide records with the given sort values straight into the store.
pub async fn seed_slides(
    transport: &ScriptedTransport,
    document: DocumentId,
    keys: &[u64],
) -> Vec<SlideId> {
    let mut ids = Vec::new();
    let mut records = Vec::new();
    for key in keys {
        let slide = SlideId::new();
        ids.push(slide);
        records.push(Record::slide(
            document,
            slide,
            SlideFields {
                name: Some(format!("Slide {key}")),
                sort_index: Some(SortKey::from_value(*key)),
                ..Default::default()
            },
        ));
    }
    transport
        .inner
        .post(records, &CancellationToken::new())
        .await
        .unwrap();
    ids
}

/// A loaded, active document holding slides with the given sort values.
pub async fn fixture(keys: &[u64]) -> Fixture {
    let transport = ScriptedTransport::new();
    let dyn_transport: Arc<dyn RecordTransport> = transport.clone();
    let handle = DocumentHandle::create("Quarterly review", dyn_transport.clone(), &test_config())
        .await
        .unwrap();
    let slides = seed_slides(&transport, handle.id(), keys).await;
    handle.reload().await.unwrap();
    // Loading picks a thumbnail; write it now so later posts are all ours.
    handle.flush().await.unwrap();
    handle.set_active(true);

    let history = Arc::new(UndoHistory::new());
    let coordinator = MutationCoordinator::new(dyn_transport, history.clone(), test_config());
    Fixture {
        transport,
        handle,
        slides,
        history,
        coordinator,
    }
}

/// Visible slide ids in display order.
pub fn order(handle: &DocumentHandle) -> Vec<SlideId> {
    handle
        .lock()
        .visible_slides()
        .iter()
        .map(|slide| slide.id)
        .collect()
}

pub fn key_of(handle: &DocumentHandle, slide: SlideId) -> SortKey {
    handle.lock().slide(slide).unwrap().sort_index.clone()
}
