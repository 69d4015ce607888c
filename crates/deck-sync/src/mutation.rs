//! Optimistic slide mutations.
//!
//! Each operation changes the local document first, registers its inverse
//! with the undo registrar and then talks to the record store. Creation and
//! deletion are rolled back locally when the store refuses them; reordering
//! is not, the local order wins until the next reload.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use deck::{
    Document, DocumentId, Media, MediaId, Record, RecordBody, Slide, SlideId, SortKey,
    UndoAction, UndoEntryId, UndoHistory, UndoRegistrar,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    accepted, AssetUpload, DocumentHandle, ProgressFn, RecordTransport, Result, SyncConfig,
    SyncError,
};

/// A content object to place on a new slide.
#[derive(Debug, Clone, Default)]
pub struct NewObject {
    pub kind: String,
    /// `None` stacks the object above everything added before it.
    pub z_index: Option<i32>,
    pub properties: Value,
    /// Binary content that has to be uploaded with the slide.
    pub content: Option<AssetUpload>,
}

impl NewObject {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: AssetUpload) -> Self {
        self.content = Some(content);
        self
    }
}

/// Everything needed to create a slide.
#[derive(Debug, Clone, Default)]
pub struct NewSlide {
    pub title: Option<String>,
    pub room: Value,
    pub presenter: Value,
    pub speaker_notes: Option<String>,
    pub objects: Vec<NewObject>,
    /// Insert right after this slide instead of at the end.
    pub after: Option<SlideId>,
}

pub struct MutationCoordinator {
    transport: Arc<dyn RecordTransport>,
    undo: Arc<dyn UndoRegistrar>,
    config: SyncConfig,
}

/// Races `operation` against cancellation. Cancellation wins ties.
async fn guarded<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = operation => result,
    }
}

fn report(progress: &Option<ProgressFn>, fraction: f64) {
    if let Some(progress) = progress {
        progress(fraction.clamp(0.0, 1.0));
    }
}

impl MutationCoordinator {
    pub fn new(
        transport: Arc<dyn RecordTransport>,
        undo: Arc<dyn UndoRegistrar>,
        config: SyncConfig,
    ) -> Self {
        Self {
            transport,
            undo,
            config,
        }
    }

    /// Adds a slide with its content.
    ///
    /// The slide shows up locally before anything is sent. Its record is
    /// uploaded first, then any binary content and the media records. A
    /// failure or cancellation in either phase removes the slide, drops its
    /// undo entry and deletes whatever already reached the store.
    /// `on_progress` is only used when there is content to upload.
    pub async fn create_slide(
        &self,
        handle: &DocumentHandle,
        new: NewSlide,
        on_progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<Slide> {
        let mut uploads: HashMap<MediaId, AssetUpload> = HashMap::new();
        let (document_id, slide_record, media_records) = {
            let mut document = handle.lock();
            let key = match new.after {
                Some(anchor) => document
                    .keys_after(Some(anchor), 1)?
                    .pop()
                    .ok_or_else(|| SyncError::Model("no key after anchor".to_string()))?,
                None => SortKey::append_at_end(document.sort_keys(None).iter()),
            };

            let mut slide = Slide::new(document.id(), key);
            slide.title = new.title;
            slide.room = new.room;
            slide.presenter = new.presenter;
            slide.speaker_notes = new.speaker_notes;
            for object in new.objects {
                let mut media = Media::new(object.kind);
                media.properties = object.properties;
                if let Some(content) = object.content {
                    media.asset = Some(content.asset_ref());
                    uploads.insert(media.id, content);
                }
                slide.add_object(media, object.z_index);
            }

            let slide_record = slide.encode_to_record();
            let media_records = slide.media_records();
            document.add_slide(slide)?;
            (document.id(), slide_record, media_records)
        };
        let slide_id = SlideId(slide_record.id);
        let entry = self.undo.register(UndoAction::DeleteSlides {
            document: document_id,
            slides: vec![slide_id],
        });
        handle.persist_if_needed();

        let progress = if uploads.is_empty() { None } else { on_progress };
        report(&progress, 0.0);

        // Phase one: the slide's own record.
        let mut stored: Vec<Record> = Vec::new();
        let saved = guarded(&cancel, self.transport.post(vec![slide_record.clone()], &cancel))
            .await
            .and_then(accepted);
        match saved {
            Ok(records) => {
                stored.extend(records.iter().cloned());
                let decoded = handle.lock().decode_records(&records, false);
                debug!(slide = %slide_id, decoded = decoded.len(), "slide record stored");
            }
            Err(err) => {
                // The store may have taken the record before the call was abandoned.
                stored.push(slide_record);
                return Err(self
                    .rollback_create(handle, slide_id, entry, stored, err.into_upload())
                    .await);
            }
        }

        if media_records.is_empty() {
            return self.created(handle, slide_id);
        }

        // Phase two: binary content, then the media records pointing at it.
        let total: u64 = uploads.values().map(AssetUpload::size).sum();
        let mut sent: u64 = 0;
        let mut media_records = media_records;
        for record in media_records.iter_mut() {
            let Some(upload) = uploads.get(&MediaId(record.id)) else {
                continue;
            };
            match guarded(&cancel, self.transport.upload_asset(upload, &cancel)).await {
                Ok(asset) => {
                    if let Some(fields) = record.media_fields_mut() {
                        fields.asset = Some(asset);
                    }
                    sent += upload.size();
                    if total > 0 {
                        report(&progress, sent as f64 / total as f64);
                    }
                }
                Err(err) => {
                    return Err(self
                        .rollback_create(handle, slide_id, entry, stored, err.into_upload())
                        .await);
                }
            }
        }

        let saved = guarded(&cancel, self.transport.post(media_records.clone(), &cancel))
            .await
            .and_then(accepted);
        match saved {
            Ok(records) => {
                let mut document = handle.lock();
                for record in &records {
                    document.decode_child_record(record);
                }
            }
            Err(err) => {
                stored.extend(media_records);
                return Err(self
                    .rollback_create(handle, slide_id, entry, stored, err.into_upload())
                    .await);
            }
        }
        report(&progress, 1.0);

        self.created(handle, slide_id)
    }

    fn created(&self, handle: &DocumentHandle, slide_id: SlideId) -> Result<Slide> {
        info!(slide = %slide_id, "slide created");
        handle
            .lock()
            .slide(slide_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("slide {slide_id}")))
    }

    async fn rollback_create(
        &self,
        handle: &DocumentHandle,
        slide_id: SlideId,
        entry: UndoEntryId,
        mut stored: Vec<Record>,
        err: SyncError,
    ) -> SyncError {
        {
            let mut document = handle.lock();
            if document.contains(slide_id) {
                if let Err(remove_err) = document.remove_slide(slide_id) {
                    warn!(slide = %slide_id, error = %remove_err, "could not remove rolled back slide");
                }
            }
        }
        self.undo.remove(entry);
        handle.persist_if_needed();

        if !stored.is_empty() {
            for record in stored.iter_mut() {
                record.mark_deleted();
            }
            if let Err(delete_err) = self.transport.delete(stored).await {
                warn!(slide = %slide_id, error = %delete_err, "could not delete records of rolled back slide");
            }
        }

        match &err {
            SyncError::Cancelled => debug!(slide = %slide_id, "slide creation cancelled"),
            _ => error!(slide = %slide_id, error = %err, "slide creation failed; rolled back"),
        }
        err
    }

    /// Copies slides into `destination`, right after `anchor`.
    ///
    /// Without an anchor, a copy within the same document lands after the
    /// last copied slide (not the first), so a multi-slide copy never splits
    /// the run of originals. Into another document it lands after the
    /// destination's selection, or at the end. Copies show up immediately
    /// when the destination is the source or already loaded. Returns the new
    /// slide ids in the order of `slides`.
    pub async fn copy_slides(
        &self,
        source: &DocumentHandle,
        slides: &[SlideId],
        destination: &DocumentHandle,
        anchor: Option<SlideId>,
    ) -> Result<Vec<SlideId>> {
        if slides.is_empty() {
            return Ok(Vec::new());
        }
        self.prepare_for_duplication(source, slides).await?;

        let source_id = source.id();
        let fetched = self.fetch_for_copy(source_id, slides).await?;
        if fetched.is_empty() {
            return Err(SyncError::NotFound(format!(
                "none of {} slides in document {source_id}",
                slides.len()
            )));
        }

        let same = source.same_document(destination);
        let (destination_id, optimistic, records, new_ids) = {
            let mut document = destination.lock();
            let destination_id = document.id();
            let anchor = anchor.filter(|id| document.contains(*id)).or_else(|| {
                if same {
                    last_in_order(&document, slides)
                } else {
                    document.selection()
                }
            });
            let keys = document.keys_after(anchor, fetched.len())?;

            let mut records = Vec::new();
            let mut copies = Vec::new();
            let mut new_ids = Vec::new();
            for ((parent, children), key) in fetched.into_iter().zip(keys) {
                let (parent, children) = rename_for_copy(parent, children, destination_id, key);
                let id = SlideId(parent.id);
                new_ids.push(id);
                let mut copy =
                    Slide::from_record(&parent, &children, SortKey::from_value(0))?;
                copy.has_been_persisted = false;
                copy.optimistic = true;
                copy.source_id = Some(SlideId(parent_source(&parent)));
                copies.push(copy);
                records.push(parent);
                records.extend(children);
            }

            let optimistic = same || document.is_loaded();
            if optimistic {
                document.add_slides(copies)?;
            }
            (destination_id, optimistic, records, new_ids)
        };
        let entry = optimistic.then(|| {
            self.undo.register(UndoAction::DeleteSlides {
                document: destination_id,
                slides: new_ids.clone(),
            })
        });
        destination.persist_if_needed();

        let saved = self
            .transport
            .post(records.clone(), &CancellationToken::new())
            .await
            .and_then(accepted);
        match saved {
            Ok(saved) => {
                if optimistic {
                    destination.lock().decode_records(&saved, false);
                }
                info!(
                    source = %source_id,
                    destination = %destination_id,
                    count = new_ids.len(),
                    "slides copied"
                );
                Ok(new_ids)
            }
            Err(err) => {
                let err = err.into_upload();
                error!(
                    source = %source_id,
                    destination = %destination_id,
                    error = %err,
                    "copying slides failed"
                );
                if optimistic {
                    let mut erased = records;
                    for record in erased.iter_mut() {
                        record.mark_deleted();
                    }
                    destination.lock().decode_records(&erased, false);
                    if let Some(entry) = entry {
                        self.undo.remove(entry);
                    }
                    destination.persist_if_needed();
                } else if self.config.reload_after_failed_copy {
                    if let Err(reload_err) = destination.reload_if_active().await {
                        warn!(destination = %destination_id, error = %reload_err, "reload after failed copy failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Makes sure every slide about to be copied exists in the store.
    async fn prepare_for_duplication(
        &self,
        source: &DocumentHandle,
        slides: &[SlideId],
    ) -> Result<()> {
        let pending: Vec<Record> = {
            let document = source.lock();
            slides
                .iter()
                .filter_map(|id| document.slide(*id))
                .filter(|slide| !slide.has_been_persisted)
                .flat_map(|slide| {
                    std::iter::once(slide.encode_to_record()).chain(slide.media_records())
                })
                .collect()
        };

        if !pending.is_empty() {
            let saved = self
                .transport
                .post(pending, &CancellationToken::new())
                .await
                .and_then(accepted)
                .map_err(SyncError::into_upload)?;
            source.lock().decode_records(&saved, false);
        }

        source.flush().await
    }

    /// Store records for each slide, in the order of `slides`. One slide is
    /// fetched on its own; several come from a single fetch of the document.
    async fn fetch_for_copy(
        &self,
        document: DocumentId,
        slides: &[SlideId],
    ) -> Result<Vec<(Record, Vec<Record>)>> {
        let records = if let [slide] = slides {
            self.transport.fetch_one(document, *slide).await?
        } else {
            self.transport.fetch(document).await?
        };

        let mut grouped = Vec::with_capacity(slides.len());
        for slide in slides {
            let parent = records.iter().find(|record| {
                record.id == slide.0 && matches!(record.body, RecordBody::Slide(_)) && !record.deleted
            });
            let Some(parent) = parent else {
                warn!(document = %document, slide = %slide, "slide missing from store; not copied");
                continue;
            };
            let children: Vec<Record> = records
                .iter()
                .filter(|record| {
                    record.parent_id == slide.0
                        && matches!(record.body, RecordBody::Media(_))
                        && !record.deleted
                        && !record.is_trashed()
                })
                .cloned()
                .collect();
            grouped.push((parent.clone(), children));
        }
        Ok(grouped)
    }

    /// Moves a slide between `previous` and `next`. Returns `false` when the
    /// slide already sits there.
    ///
    /// The new position is kept locally even if the store rejects it.
    pub async fn move_slide(
        &self,
        handle: &DocumentHandle,
        slide: SlideId,
        previous: Option<SlideId>,
        next: Option<SlideId>,
    ) -> Result<bool> {
        let (document_id, record, old_previous, old_next) = {
            let mut document = handle.lock();
            let current = document
                .slide(slide)
                .map(|s| s.sort_index.clone())
                .ok_or_else(|| SyncError::NotFound(format!("slide {slide}")))?;
            let (old_previous, old_next) = document.neighbors(slide)?;
            if (previous, next) == (old_previous, old_next) {
                return Ok(false);
            }

            let key_of = |id: Option<SlideId>| -> Result<Option<SortKey>> {
                match id {
                    None => Ok(None),
                    Some(id) if id == slide => Err(SyncError::Model(format!(
                        "slide {slide} cannot be its own neighbour"
                    ))),
                    Some(id) => document
                        .slide(id)
                        .map(|s| Some(s.sort_index.clone()))
                        .ok_or_else(|| SyncError::NotFound(format!("slide {id}"))),
                }
            };
            let previous_key = key_of(previous)?;
            let next_key = key_of(next)?;
            let pool = document.sort_keys(Some(slide));
            let key = SortKey::between(previous_key.as_ref(), next_key.as_ref(), &pool)?;
            if key == current {
                return Ok(false);
            }

            document.set_sort_index(slide, key)?;
            let record = document
                .slide(slide)
                .map(Slide::encode_to_record)
                .ok_or_else(|| SyncError::NotFound(format!("slide {slide}")))?;
            (document.id(), record, old_previous, old_next)
        };

        self.undo.register(UndoAction::MoveSlide {
            document: document_id,
            slide,
            previous: old_previous,
            next: old_next,
        });
        handle.persist_if_needed();

        let saved = self
            .transport
            .post(vec![record], &CancellationToken::new())
            .await
            .and_then(accepted);
        match saved {
            Ok(records) => {
                handle.lock().decode_records(&records, false);
            }
            Err(err) => {
                warn!(slide = %slide, error = %err, "storing new slide position failed; keeping local order");
            }
        }
        Ok(true)
    }

    /// Moves slides to the trash.
    pub async fn delete_slides(&self, handle: &DocumentHandle, slides: &[SlideId]) -> Result<()> {
        self.set_trashed(handle, slides, true).await
    }

    /// Brings trashed slides back.
    pub async fn undelete_slides(&self, handle: &DocumentHandle, slides: &[SlideId]) -> Result<()> {
        self.set_trashed(handle, slides, false).await
    }

    async fn set_trashed(
        &self,
        handle: &DocumentHandle,
        slides: &[SlideId],
        trashed: bool,
    ) -> Result<()> {
        let (document_id, change, records) = {
            let mut document = handle.lock();
            let change = document.set_trashed(slides, trashed)?;
            let records: Vec<Record> = change
                .slides()
                .iter()
                .filter_map(|id| document.slide(*id))
                .map(Slide::encode_to_record)
                .collect();
            (document.id(), change, records)
        };
        if change.is_empty() {
            return Ok(());
        }

        let changed = change.slides();
        let inverse = if trashed {
            UndoAction::UndeleteSlides {
                document: document_id,
                slides: changed.clone(),
            }
        } else {
            UndoAction::DeleteSlides {
                document: document_id,
                slides: changed.clone(),
            }
        };
        let entry = self.undo.register(inverse);
        handle.persist_if_needed();

        let saved = self
            .transport
            .post(records, &CancellationToken::new())
            .await
            .and_then(accepted);
        match saved {
            Ok(records) => {
                handle.lock().decode_records(&records, false);
                Ok(())
            }
            Err(err) => {
                handle.lock().revert_trash(&change);
                self.undo.remove(entry);
                handle.persist_if_needed();
                error!(
                    document = %document_id,
                    slides = changed.len(),
                    trashed,
                    error = %err,
                    "updating trash state failed; reverted"
                );
                Err(err.into_upload())
            }
        }
    }

    /// Replays an undo action through the regular operations, which
    /// register their own inverse.
    pub async fn apply_undo_action(&self, handle: &DocumentHandle, action: UndoAction) -> Result<()> {
        if action.document() != handle.id() {
            return Err(SyncError::NotFound(format!(
                "document {} is not open",
                action.document()
            )));
        }
        match action {
            UndoAction::DeleteSlides { slides, .. } => self.delete_slides(handle, &slides).await,
            UndoAction::UndeleteSlides { slides, .. } => {
                self.undelete_slides(handle, &slides).await
            }
            UndoAction::MoveSlide {
                slide,
                previous,
                next,
                ..
            } => self
                .move_slide(handle, slide, previous, next)
                .await
                .map(|_| ()),
        }
    }

    /// Undoes the latest action in `history`, which must be the registrar
    /// this coordinator reports to.
    pub async fn undo(&self, history: &UndoHistory, handle: &DocumentHandle) -> Result<()> {
        let action = history.pop_undo()?;
        let result = self.apply_undo_action(handle, action).await;
        history.end_replay();
        result
    }

    pub async fn redo(&self, history: &UndoHistory, handle: &DocumentHandle) -> Result<()> {
        let action = history.pop_redo()?;
        let result = self.apply_undo_action(handle, action).await;
        history.end_replay();
        result
    }
}

/// Of `slides`, the one that sorts last in `document`.
fn last_in_order(document: &Document, slides: &[SlideId]) -> Option<SlideId> {
    document
        .slides()
        .filter(|slide| slides.contains(&slide.id))
        .last()
        .map(|slide| slide.id)
}

/// Gives a slide record and its children fresh identities inside
/// `destination`. The original slide id is kept in the copy's metadata
/// under `copied_from`.
fn rename_for_copy(
    mut parent: Record,
    children: Vec<Record>,
    destination: DocumentId,
    key: SortKey,
) -> (Record, Vec<Record>) {
    let source = parent.id;
    let slide_id = Uuid::new_v4();
    parent.id = slide_id;
    parent.parent_id = destination.0;
    parent.document_id = destination;
    parent.created_at = None;
    parent.updated_at = None;
    if let Some(fields) = parent.slide_fields_mut() {
        fields.sort_index = Some(key);
        fields.trashed = false;
        if let Value::Object(metadata) = &mut fields.metadata {
            metadata.insert("copied_from".to_string(), Value::String(source.to_string()));
        } else {
            fields.metadata = serde_json::json!({ "copied_from": source.to_string() });
        }
    }

    let children = children
        .into_iter()
        .map(|mut child| {
            child.id = Uuid::new_v4();
            child.parent_id = slide_id;
            child.document_id = destination;
            child.created_at = None;
            child.updated_at = None;
            child
        })
        .collect();
    (parent, children)
}

fn parent_source(parent: &Record) -> Uuid {
    parent
        .slide_fields()
        .and_then(|fields| fields.metadata.get("copied_from"))
        .and_then(Value::as_str)
        .and_then(|source| Uuid::parse_str(source).ok())
        .unwrap_or(parent.id)
}
