use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use deck::{Document, DocumentEvent, DocumentId, Record, RecordBody, Slide, SlideId};
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    accepted, MetadataPersister, RecordTransport, ReloadCoordinator, Result, SyncConfig, SyncError,
};

/// Shared access to one document and the machinery that keeps it in sync.
///
/// Clones refer to the same document. The lock returned by
/// [`DocumentHandle::lock`] must not be held across an `.await`.
#[derive(Clone)]
pub struct DocumentHandle {
    document: Arc<Mutex<Document>>,
    transport: Arc<dyn RecordTransport>,
    reload: Arc<ReloadCoordinator>,
    persister: Arc<MetadataPersister>,
    active: Arc<AtomicBool>,
}

impl DocumentHandle {
    pub fn new(document: Document, transport: Arc<dyn RecordTransport>, config: &SyncConfig) -> Self {
        let document = Arc::new(Mutex::new(document));
        let reload = Arc::new(ReloadCoordinator::new(
            Arc::clone(&document),
            Arc::clone(&transport),
        ));
        let persister = MetadataPersister::new(
            Arc::clone(&document),
            Arc::clone(&transport),
            config.persistence_debounce(),
        );
        Self {
            document,
            transport,
            reload,
            persister,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a new document in the store.
    pub async fn create(
        title: &str,
        transport: Arc<dyn RecordTransport>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let mut document = Document::with_title(DocumentId::new(), title);
        let saved = transport
            .post(vec![document.encode_to_record()], &CancellationToken::new())
            .await
            .and_then(accepted)?;
        for record in &saved {
            document.decode_from_record(record)?;
        }
        document.set_loaded(true);
        document.take_needs_persistence();
        Ok(Self::new(document, transport, config))
    }

    /// Opens a stored document and loads its slides.
    pub async fn open(
        id: DocumentId,
        transport: Arc<dyn RecordTransport>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let handle = Self::new(Document::new(id), transport, config);
        handle.reload().await?;
        Ok(handle)
    }

    pub fn id(&self) -> DocumentId {
        self.document.lock().id()
    }

    pub fn lock(&self) -> MutexGuard<'_, Document> {
        self.document.lock()
    }

    pub fn subscribe(&self) -> Receiver<DocumentEvent> {
        self.document.lock().subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn RecordTransport> {
        &self.transport
    }

    /// Whether both handles refer to the same document.
    pub fn same_document(&self, other: &DocumentHandle) -> bool {
        Arc::ptr_eq(&self.document, &other.document)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_reloading(&self) -> bool {
        self.reload.is_reloading()
    }

    pub async fn reload(&self) -> Result<Vec<SlideId>> {
        self.reload.reload().await
    }

    pub async fn ensure_loaded(&self) -> Result<()> {
        self.reload.ensure_loaded().await
    }

    /// Reloads only while this is the document being shown.
    pub async fn reload_if_active(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.reload().await.map(|_| ())
    }

    pub fn set_title(&self, title: &str) {
        let changed = self.document.lock().set_title(title);
        if changed {
            self.persister.schedule();
        }
    }

    pub fn set_hidden(&self, hidden: bool) {
        let changed = self.document.lock().set_hidden(hidden);
        if changed {
            self.persister.schedule();
        }
    }

    /// Schedules a metadata write when the document asks for one.
    pub fn persist_if_needed(&self) {
        let needed = self.document.lock().needs_persistence();
        if needed {
            self.persister.schedule();
        }
    }

    pub fn has_pending_persistence(&self) -> bool {
        self.persister.has_pending()
    }

    /// Writes pending metadata now.
    pub async fn flush(&self) -> Result<()> {
        self.persister.flush().await
    }

    /// The slide to draw as this document's thumbnail.
    ///
    /// A loaded document answers from memory. Otherwise the persisted
    /// thumbnail id is tried, first locally and then from the store; when
    /// that fails the document is reloaded and its first slide becomes the
    /// new persisted thumbnail.
    pub async fn slide_for_thumbnail(&self) -> Result<Option<Slide>> {
        let (id, loaded, persisted) = {
            let document = self.document.lock();
            (
                document.id(),
                document.is_loaded(),
                document.meta().thumbnail_slide_id,
            )
        };

        if loaded {
            let document = self.document.lock();
            return Ok(document.visible_slides().first().map(|slide| (*slide).clone()));
        }

        if let Some(slide_id) = persisted {
            let cached = self.document.lock().slide(slide_id).cloned();
            if cached.is_some() {
                return Ok(cached);
            }
            match self.transport.fetch_one(id, slide_id).await {
                Ok(records) => {
                    if let Some(slide) = self.decode_fetched(slide_id, &records)? {
                        return Ok(Some(slide));
                    }
                }
                Err(err) => {
                    debug!(document = %id, slide = %slide_id, error = %err, "thumbnail slide unavailable; reloading");
                }
            }
        }

        self.reload().await?;
        let first = {
            let mut document = self.document.lock();
            let first = document
                .visible_slides()
                .first()
                .map(|slide| (*slide).clone());
            document.set_thumbnail_slide_id(first.as_ref().map(|slide| slide.id));
            first
        };
        self.persist_if_needed();
        Ok(first)
    }

    fn decode_fetched(&self, slide_id: SlideId, records: &[Record]) -> Result<Option<Slide>> {
        let Some(parent) = records
            .iter()
            .find(|record| record.id == slide_id.0 && matches!(record.body, RecordBody::Slide(_)))
        else {
            return Ok(None);
        };
        if parent.deleted || parent.is_trashed() {
            return Ok(None);
        }
        let children: Vec<Record> = records
            .iter()
            .filter(|record| record.parent_id == slide_id.0)
            .cloned()
            .collect();

        let mut document = self.document.lock();
        document
            .decode_slide_record(parent, &children, true)
            .map_err(SyncError::from)?;
        Ok(document.slide(slide_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;
    use deck::{SlideFields, SortKey};

    async fn store_with_slides(keys: &[u64]) -> (Arc<MemoryTransport>, DocumentId, Vec<SlideId>) {
        let store = Arc::new(MemoryTransport::new());
        let handle = DocumentHandle::create("Roadmap", store.clone(), &SyncConfig::default())
            .await
            .unwrap();
        let id = handle.id();
        let mut ids = Vec::new();
        let mut records = Vec::new();
        for key in keys {
            let slide = SlideId::new();
            ids.push(slide);
            records.push(Record::slide(
                id,
                slide,
                SlideFields {
                    sort_index: Some(SortKey::from_value(*key)),
                    ..Default::default()
                },
            ));
        }
        store.post(records, &CancellationToken::new()).await.unwrap();
        (store, id, ids)
    }

    #[tokio::test]
    async fn test_create_then_open() {
        let (store, id, ids) = store_with_slides(&[2000, 1000]).await;
        let handle = DocumentHandle::open(id, store, &SyncConfig::default())
            .await
            .unwrap();
        let document = handle.lock();
        assert_eq!(document.title(), "Roadmap");
        let order: Vec<SlideId> = document.visible_slides().iter().map(|s| s.id).collect();
        assert_eq!(order, vec![ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn test_thumbnail_from_persisted_id_without_reload() {
        let (store, id, ids) = store_with_slides(&[1000, 2000]).await;
        let mut document = Document::new(id);
        document.set_thumbnail_slide_id(Some(ids[1]));
        document.take_needs_persistence();
        let handle = DocumentHandle::new(document, store, &SyncConfig::default());

        let slide = handle.slide_for_thumbnail().await.unwrap().unwrap();
        assert_eq!(slide.id, ids[1]);
        assert!(!handle.lock().is_loaded());
    }

    #[tokio::test]
    async fn test_thumbnail_falls_back_to_reload() {
        let (store, id, ids) = store_with_slides(&[1000, 2000]).await;
        let mut document = Document::new(id);
        document.set_thumbnail_slide_id(Some(SlideId::new()));
        let handle = DocumentHandle::new(document, store, &SyncConfig::default());

        let slide = handle.slide_for_thumbnail().await.unwrap().unwrap();
        assert_eq!(slide.id, ids[0]);
        assert!(handle.lock().is_loaded());
        assert_eq!(handle.lock().meta().thumbnail_slide_id, Some(ids[0]));
    }

    #[tokio::test]
    async fn test_reload_if_active_respects_flag() {
        let (store, id, _) = store_with_slides(&[1000]).await;
        let handle = DocumentHandle::new(Document::new(id), store, &SyncConfig::default());
        handle.reload_if_active().await.unwrap();
        assert!(!handle.lock().is_loaded());

        handle.set_active(true);
        handle.reload_if_active().await.unwrap();
        assert!(handle.lock().is_loaded());
    }
}
