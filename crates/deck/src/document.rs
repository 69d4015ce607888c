//! The presentation aggregate.
//!
//! A [`Document`] owns its slides by identifier and keeps a derived order
//! sorted by sort key. Selection and thumbnail are identifiers resolved
//! through the slide map. Every structural change emits exactly one
//! [`DocumentEvent::SlidesChanged`] once it is complete.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{
    DeckError, DocumentId, PresentationFields, Record, RecordBody, Slide, SlideId, SortKey,
};

pub const UNTITLED_PRESENTATION: &str = "Untitled presentation";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DocumentEvent {
    SlidesChanged,
    ContentChanged { slide: SlideId },
    SelectionChanged { slide: Option<SlideId> },
    ThumbnailChanged { slide: Option<SlideId> },
    LoadingChanged { loading: bool },
    LoadedChanged { loaded: bool },
    MetadataChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMeta {
    pub title: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub last_viewed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub welcome: bool,
    #[serde(default)]
    pub thumbnail_slide_id: Option<SlideId>,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self {
            title: UNTITLED_PRESENTATION.to_string(),
            hidden: false,
            last_viewed: None,
            welcome: false,
            thumbnail_slide_id: None,
        }
    }
}

fn normalize_title(title: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        UNTITLED_PRESENTATION.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Trash flags as they were before [`Document::set_trashed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrashChange {
    previous: Vec<(SlideId, bool)>,
    /// Selection before and after the change.
    selection: (Option<SlideId>, Option<SlideId>),
}

impl TrashChange {
    /// Slides whose flag actually flipped.
    pub fn slides(&self) -> Vec<SlideId> {
        self.previous.iter().map(|(id, _)| *id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

#[derive(Debug, Default)]
struct Applied {
    slide: Option<SlideId>,
    structural: bool,
    content: bool,
}

#[derive(Debug)]
pub struct Document {
    id: DocumentId,
    meta: DocumentMeta,
    slides: HashMap<SlideId, Slide>,
    order: Vec<SlideId>,
    selection: Option<SlideId>,
    thumbnail: Option<SlideId>,
    loaded: bool,
    loading: bool,
    needs_persistence: bool,
    subscribers: Vec<Sender<DocumentEvent>>,
}

impl Document {
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            meta: DocumentMeta::default(),
            slides: HashMap::new(),
            order: Vec::new(),
            selection: None,
            thumbnail: None,
            loaded: false,
            loading: false,
            needs_persistence: false,
            subscribers: Vec::new(),
        }
    }

    pub fn with_title(id: DocumentId, title: &str) -> Self {
        let mut document = Self::new(id);
        document.meta.title = normalize_title(title);
        document
    }

    pub fn from_record(record: &Record) -> Result<Self, DeckError> {
        let mut document = Self::new(record.document_id);
        document.decode_from_record(record)?;
        Ok(document)
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    pub fn title(&self) -> &str {
        &self.meta.title
    }

    /// Applies a presentation record. Does not schedule persistence.
    pub fn decode_from_record(&mut self, record: &Record) -> Result<(), DeckError> {
        let RecordBody::Presentation(fields) = &record.body else {
            return Err(DeckError::NotAPresentation(record.id));
        };
        if record.document_id != self.id {
            return Err(DeckError::NotAPresentation(record.id));
        }

        let meta = DocumentMeta {
            title: normalize_title(&fields.name),
            hidden: fields.hidden,
            last_viewed: fields.last_viewed,
            welcome: fields.welcome,
            thumbnail_slide_id: fields.thumbnail_slide_id,
        };
        if meta != self.meta {
            self.meta = meta;
            self.emit(DocumentEvent::MetadataChanged);
        }
        Ok(())
    }

    pub fn encode_to_record(&self) -> Record {
        Record::presentation(
            self.id,
            PresentationFields {
                name: self.meta.title.clone(),
                hidden: self.meta.hidden,
                last_viewed: self.meta.last_viewed,
                welcome: self.meta.welcome,
                thumbnail_slide_id: self.meta.thumbnail_slide_id,
            },
        )
    }

    pub fn subscribe(&mut self) -> Receiver<DocumentEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: DocumentEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn slide(&self, id: SlideId) -> Option<&Slide> {
        self.slides.get(&id)
    }

    pub fn contains(&self, id: SlideId) -> bool {
        self.slides.contains_key(&id)
    }

    /// Every slide, trashed ones included, in sort order.
    pub fn slides(&self) -> impl Iterator<Item = &Slide> + '_ {
        self.order.iter().filter_map(|id| self.slides.get(id))
    }

    pub fn visible_slides(&self) -> Vec<&Slide> {
        self.slides().filter(|slide| !slide.trashed).collect()
    }

    pub fn slide_count(&self, include_trashed: bool) -> usize {
        if include_trashed {
            self.slides.len()
        } else {
            self.slides.values().filter(|slide| !slide.trashed).count()
        }
    }

    pub fn sort_keys(&self, excluding: Option<SlideId>) -> Vec<SortKey> {
        self.slides
            .values()
            .filter(|slide| Some(slide.id) != excluding)
            .map(|slide| slide.sort_index.clone())
            .collect()
    }

    pub fn add_slide(&mut self, slide: Slide) -> Result<(), DeckError> {
        self.add_slides(vec![slide])
    }

    /// Inserts a batch of slides, all or nothing.
    pub fn add_slides(&mut self, slides: Vec<Slide>) -> Result<(), DeckError> {
        if slides.is_empty() {
            return Ok(());
        }

        let mut batch_keys: HashMap<&SortKey, SlideId> = HashMap::new();
        let mut batch_ids = HashSet::new();
        for slide in &slides {
            if self.slides.contains_key(&slide.id) || !batch_ids.insert(slide.id) {
                return Err(DeckError::SlideExists(slide.id));
            }
            self.check_key_free(&slide.sort_index, None)?;
            if let Some(holder) = batch_keys.insert(&slide.sort_index, slide.id) {
                return Err(DeckError::SortKeyInUse {
                    key: slide.sort_index.clone(),
                    holder,
                });
            }
        }

        for mut slide in slides {
            slide.document_id = self.id;
            self.slides.insert(slide.id, slide);
        }
        self.after_structural_change();
        Ok(())
    }

    /// Hard removal, used when an optimistic creation is rolled back.
    pub fn remove_slide(&mut self, id: SlideId) -> Result<Slide, DeckError> {
        let replacement = self.replacement_for(id);
        let slide = self
            .slides
            .remove(&id)
            .ok_or(DeckError::SlideNotFound(id))?;
        let selection_moved = self.selection == Some(id);
        if selection_moved {
            self.selection = replacement;
        }
        self.after_structural_change();
        if selection_moved {
            self.emit(DocumentEvent::SelectionChanged {
                slide: self.selection,
            });
        }
        Ok(slide)
    }

    /// Removes every listed slide that is present with a single event.
    pub fn remove_slides(&mut self, ids: &[SlideId]) -> Vec<Slide> {
        let removed: Vec<Slide> = ids.iter().filter_map(|id| self.slides.remove(id)).collect();
        if removed.is_empty() {
            return removed;
        }
        let selection_moved = self.settle_selection();
        self.after_structural_change();
        if selection_moved {
            self.emit(DocumentEvent::SelectionChanged {
                slide: self.selection,
            });
        }
        removed
    }

    /// Soft delete or restore. Unknown identifiers fail before anything
    /// changes; slides already at `value` are left out of the returned
    /// change.
    pub fn set_trashed(&mut self, ids: &[SlideId], value: bool) -> Result<TrashChange, DeckError> {
        if let Some(missing) = ids.iter().find(|id| !self.slides.contains_key(id)) {
            return Err(DeckError::SlideNotFound(*missing));
        }

        let mut change = TrashChange {
            selection: (self.selection, self.selection),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(slide) = self.slides.get_mut(id) {
                if slide.trashed != value {
                    change.previous.push((*id, slide.trashed));
                    slide.trashed = value;
                }
            }
        }
        if change.is_empty() {
            return Ok(change);
        }

        let selection_moved = self.settle_selection();
        change.selection.1 = self.selection;
        self.after_structural_change();
        if selection_moved {
            self.emit(DocumentEvent::SelectionChanged {
                slide: self.selection,
            });
        }
        Ok(change)
    }

    /// Puts trash flags back the way `change` found them. A selection that
    /// the change moved is moved back, unless it has been changed since.
    pub fn revert_trash(&mut self, change: &TrashChange) {
        let mut reverted = false;
        for (id, previous) in &change.previous {
            if let Some(slide) = self.slides.get_mut(id) {
                reverted |= slide.trashed != *previous;
                slide.trashed = *previous;
            }
        }
        if reverted {
            self.after_structural_change();
        }

        let (before, after) = change.selection;
        let restorable = before.map_or(true, |id| {
            self.slides.get(&id).is_some_and(|slide| !slide.trashed)
        });
        if before != after && self.selection == after && restorable {
            self.selection = before;
            self.emit(DocumentEvent::SelectionChanged { slide: before });
        }
    }

    /// Assigns a new key. Returns `false` when the slide already holds it.
    pub fn set_sort_index(&mut self, id: SlideId, key: SortKey) -> Result<bool, DeckError> {
        let current = self
            .slides
            .get(&id)
            .ok_or(DeckError::SlideNotFound(id))?;
        if current.sort_index == key {
            return Ok(false);
        }
        self.check_key_free(&key, Some(id))?;
        if let Some(slide) = self.slides.get_mut(&id) {
            slide.sort_index = key;
        }
        self.after_structural_change();
        Ok(true)
    }

    /// Replaces the slide list with fetched records.
    ///
    /// Slides present locally and in `records` keep their identity and are
    /// decoded in place. Local slides that were never persisted survive, so
    /// an optimistic insert racing the fetch is not lost.
    pub fn replace_from_records(&mut self, records: &[Record]) {
        let mut slide_records = Vec::new();
        let mut children: HashMap<Uuid, Vec<Record>> = HashMap::new();
        let mut deleted = HashSet::new();
        for record in records {
            match &record.body {
                RecordBody::Presentation(_) => {
                    if let Err(err) = self.decode_from_record(record) {
                        warn!(document = %self.id, error = %err, "skipping foreign presentation record");
                    }
                }
                RecordBody::Slide(_) if record.deleted => {
                    deleted.insert(SlideId(record.id));
                }
                RecordBody::Slide(_) => slide_records.push(record),
                RecordBody::Media(_) => children
                    .entry(record.parent_id)
                    .or_default()
                    .push(record.clone()),
            }
        }

        let mut previous = std::mem::take(&mut self.slides);
        for record in slide_records {
            let id = SlideId(record.id);
            let kids = children.get(&record.id).map(Vec::as_slice).unwrap_or(&[]);
            let decoded = match previous.remove(&id) {
                Some(existing) => {
                    let mut updated = existing.clone();
                    updated.objects.clear();
                    match updated.decode_from_record(record) {
                        Ok(()) => {
                            for kid in kids {
                                updated.decode_child(kid);
                            }
                            Ok(updated)
                        }
                        Err(err) => {
                            warn!(slide = %id, error = %err, "keeping local slide over undecodable record");
                            Ok(existing)
                        }
                    }
                }
                None => {
                    let fallback =
                        SortKey::append_at_end(self.slides.values().map(|s| &s.sort_index));
                    Slide::from_record(record, kids, fallback)
                }
            };
            match decoded {
                Ok(slide) => {
                    self.slides.insert(id, slide);
                }
                Err(err) => warn!(slide = %id, error = %err, "skipping undecodable slide record"),
            }
        }

        for (id, slide) in previous {
            if !slide.has_been_persisted && !deleted.contains(&id) && !self.slides.contains_key(&id)
            {
                self.slides.insert(id, slide);
            }
        }

        let selection_moved = self.settle_selection();
        self.after_structural_change();
        if selection_moved {
            self.emit(DocumentEvent::SelectionChanged {
                slide: self.selection,
            });
        }
    }

    /// Decodes one slide record and its media children, the same way a
    /// reload would. A deleted record removes the local slide; an unknown
    /// one is created only when `add` is set. Returns the affected slide.
    pub fn decode_slide_record(
        &mut self,
        record: &Record,
        children: &[Record],
        add: bool,
    ) -> Result<Option<SlideId>, DeckError> {
        let applied = self.apply_slide_record(record, children, add)?;
        let slide = applied.slide;
        self.finish_decode(&[applied]);
        Ok(slide)
    }

    /// Batch form of [`Document::decode_slide_record`]: media records are
    /// matched to their parent slide and one event is emitted for the
    /// whole batch.
    pub fn decode_records(&mut self, records: &[Record], add: bool) -> Vec<SlideId> {
        let mut children: HashMap<Uuid, Vec<Record>> = HashMap::new();
        for record in records {
            if let RecordBody::Media(_) = record.body {
                children
                    .entry(record.parent_id)
                    .or_default()
                    .push(record.clone());
            }
        }

        let mut applied = Vec::new();
        for record in records {
            match record.body {
                RecordBody::Slide(_) => {
                    let kids = children.remove(&record.id).unwrap_or_default();
                    match self.apply_slide_record(record, &kids, add) {
                        Ok(result) => applied.push(result),
                        Err(err) => {
                            warn!(record = %record.id, error = %err, "skipping slide record")
                        }
                    }
                }
                RecordBody::Presentation(_) => {
                    if let Err(err) = self.decode_from_record(record) {
                        warn!(record = %record.id, error = %err, "skipping presentation record");
                    }
                }
                RecordBody::Media(_) => {}
            }
        }
        // Media whose slide record was not part of the batch.
        for kids in children.into_values() {
            for kid in kids {
                if self.decode_child_record(&kid) {
                    applied.push(Applied {
                        slide: Some(SlideId(kid.parent_id)),
                        structural: false,
                        content: false,
                    });
                }
            }
        }

        self.finish_decode(&applied);
        applied.iter().filter_map(|a| a.slide).collect()
    }

    /// Applies a media record to its parent slide.
    pub fn decode_child_record(&mut self, record: &Record) -> bool {
        let id = SlideId(record.parent_id);
        let Some(slide) = self.slides.get_mut(&id) else {
            return false;
        };
        let changed = slide.decode_child(record);
        if changed {
            self.emit(DocumentEvent::ContentChanged { slide: id });
        }
        changed
    }

    fn apply_slide_record(
        &mut self,
        record: &Record,
        children: &[Record],
        add: bool,
    ) -> Result<Applied, DeckError> {
        if !matches!(record.body, RecordBody::Slide(_)) {
            return Err(DeckError::NotASlide(record.id));
        }
        let id = SlideId(record.id);

        if record.deleted {
            let removed = self.slides.remove(&id).is_some();
            return Ok(Applied {
                slide: None,
                structural: removed,
                content: false,
            });
        }

        if let Some(existing) = self.slides.get_mut(&id) {
            let key = existing.sort_index.clone();
            let trashed = existing.trashed;
            let hash = existing.hash();
            existing.decode_from_record(record)?;
            for child in children {
                existing.decode_child(child);
            }
            return Ok(Applied {
                slide: Some(id),
                structural: existing.sort_index != key || existing.trashed != trashed,
                content: existing.hash() != hash,
            });
        }

        if !add {
            return Ok(Applied::default());
        }
        let fallback = SortKey::append_at_end(self.slides.values().map(|s| &s.sort_index));
        let mut slide = Slide::from_record(record, children, fallback)?;
        slide.document_id = self.id;
        self.slides.insert(id, slide);
        Ok(Applied {
            slide: Some(id),
            structural: true,
            content: false,
        })
    }

    fn finish_decode(&mut self, applied: &[Applied]) {
        if applied.iter().any(|a| a.structural) {
            let selection_moved = self.settle_selection();
            self.after_structural_change();
            if selection_moved {
                self.emit(DocumentEvent::SelectionChanged {
                    slide: self.selection,
                });
            }
        }
        for slide in applied.iter().filter(|a| a.content).filter_map(|a| a.slide) {
            self.emit(DocumentEvent::ContentChanged { slide });
        }
    }

    pub fn selection(&self) -> Option<SlideId> {
        self.selection
    }

    pub fn select(&mut self, id: Option<SlideId>) -> Result<(), DeckError> {
        if let Some(id) = id {
            if !self.slides.contains_key(&id) {
                return Err(DeckError::SlideNotFound(id));
            }
        }
        if self.selection != id {
            self.selection = id;
            self.emit(DocumentEvent::SelectionChanged { slide: id });
        }
        Ok(())
    }

    /// First visible slide in sort order.
    pub fn thumbnail_slide(&self) -> Option<SlideId> {
        self.thumbnail
    }

    /// Previous and next slides in full sort order, trashed ones included.
    pub fn neighbors(&self, id: SlideId) -> Result<(Option<SlideId>, Option<SlideId>), DeckError> {
        let index = self
            .order
            .iter()
            .position(|candidate| *candidate == id)
            .ok_or(DeckError::SlideNotFound(id))?;
        let previous = index.checked_sub(1).map(|i| self.order[i]);
        let next = self.order.get(index + 1).copied();
        Ok((previous, next))
    }

    /// `count` fresh keys that sort after `anchor` and before its next
    /// neighbour, or at the end when there is no anchor. The first comes
    /// from [`SortKey::between`]; later ones step off the first with
    /// [`SortKey::offset`] and fall back to `between` whenever a stepped
    /// key would collide or overshoot.
    pub fn keys_after(
        &self,
        anchor: Option<SlideId>,
        count: usize,
    ) -> Result<Vec<SortKey>, DeckError> {
        let mut pool = self.sort_keys(None);
        let (left, right) = match anchor {
            Some(anchor) => {
                let slide = self
                    .slides
                    .get(&anchor)
                    .ok_or(DeckError::SlideNotFound(anchor))?;
                let (_, next) = self.neighbors(anchor)?;
                let right = next
                    .and_then(|next| self.slides.get(&next))
                    .map(|next| next.sort_index.clone());
                (Some(slide.sort_index.clone()), right)
            }
            None => (pool.iter().max().cloned(), None),
        };

        let mut keys: Vec<SortKey> = Vec::with_capacity(count);
        for step in 0..count {
            let stepped = keys.first().map(|first| first.offset(step as u64)).filter(|key| {
                right.as_ref().map_or(true, |right| key < right)
                    && keys.last().map_or(true, |last| key > last)
                    && !pool.contains(key)
            });
            let key = match stepped {
                Some(key) => key,
                None => SortKey::between(keys.last().or(left.as_ref()), right.as_ref(), &pool)?,
            };
            pool.push(key.clone());
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_loading(&mut self, loading: bool) {
        if self.loading != loading {
            self.loading = loading;
            self.emit(DocumentEvent::LoadingChanged { loading });
        }
    }

    pub fn set_loaded(&mut self, loaded: bool) {
        if self.loaded != loaded {
            self.loaded = loaded;
            self.emit(DocumentEvent::LoadedChanged { loaded });
            self.refresh_thumbnail();
        }
    }

    pub fn set_title(&mut self, title: &str) -> bool {
        let title = normalize_title(title);
        if self.meta.title == title {
            return false;
        }
        self.meta.title = title;
        self.metadata_changed();
        true
    }

    pub fn set_hidden(&mut self, hidden: bool) -> bool {
        if self.meta.hidden == hidden {
            return false;
        }
        self.meta.hidden = hidden;
        self.metadata_changed();
        true
    }

    pub fn mark_viewed(&mut self, at: DateTime<Utc>) {
        self.meta.last_viewed = Some(at);
        self.metadata_changed();
    }

    /// Records that `id` is the persisted thumbnail without waiting for the
    /// document to load.
    pub fn set_thumbnail_slide_id(&mut self, id: Option<SlideId>) -> bool {
        if self.meta.thumbnail_slide_id == id {
            return false;
        }
        self.meta.thumbnail_slide_id = id;
        self.metadata_changed();
        true
    }

    fn metadata_changed(&mut self) {
        self.needs_persistence = true;
        self.emit(DocumentEvent::MetadataChanged);
    }

    pub fn needs_persistence(&self) -> bool {
        self.needs_persistence
    }

    /// Flags metadata for persistence again, e.g. after a failed write.
    pub fn request_persistence(&mut self) {
        self.needs_persistence = true;
    }

    /// Clears and returns the persistence flag.
    pub fn take_needs_persistence(&mut self) -> bool {
        std::mem::take(&mut self.needs_persistence)
    }

    fn check_key_free(&self, key: &SortKey, except: Option<SlideId>) -> Result<(), DeckError> {
        match self
            .slides
            .values()
            .find(|slide| Some(slide.id) != except && slide.sort_index == *key)
        {
            Some(holder) => Err(DeckError::SortKeyInUse {
                key: key.clone(),
                holder: holder.id,
            }),
            None => Ok(()),
        }
    }

    /// The visible slide closest after `id` in sort order, else the closest
    /// before it.
    fn replacement_for(&self, id: SlideId) -> Option<SlideId> {
        let index = self.order.iter().position(|candidate| *candidate == id)?;
        let visible = |candidate: &&SlideId| {
            **candidate != id
                && self
                    .slides
                    .get(candidate)
                    .is_some_and(|slide| !slide.trashed)
        };
        self.order[index + 1..]
            .iter()
            .find(visible)
            .or_else(|| self.order[..index].iter().rev().find(visible))
            .copied()
    }

    /// Moves the selection off a slide that is gone or trashed. Returns
    /// whether it moved.
    fn settle_selection(&mut self) -> bool {
        let Some(selected) = self.selection else {
            return false;
        };
        let replacement = match self.slides.get(&selected) {
            Some(slide) if !slide.trashed => return false,
            Some(_) => self.replacement_for(selected),
            None => None,
        };
        self.selection = replacement;
        true
    }

    fn resort(&mut self) {
        let mut order: Vec<SlideId> = self.slides.keys().copied().collect();
        order.sort_by(|a, b| {
            let (left, right) = (&self.slides[a], &self.slides[b]);
            left.sort_index
                .cmp(&right.sort_index)
                .then_with(|| left.id.cmp(&right.id))
        });
        for pair in order.windows(2) {
            let (left, right) = (&self.slides[&pair[0]], &self.slides[&pair[1]]);
            if left.sort_index == right.sort_index {
                warn!(
                    document = %self.id,
                    key = %left.sort_index,
                    first = %left.id,
                    second = %right.id,
                    "slides share a sort key; ordering by id"
                );
            }
        }
        self.order = order;
    }

    fn after_structural_change(&mut self) {
        self.resort();
        self.emit(DocumentEvent::SlidesChanged);
        self.refresh_thumbnail();
    }

    fn refresh_thumbnail(&mut self) {
        let first = self.slides().find(|slide| !slide.trashed).map(|slide| slide.id);
        if first != self.thumbnail {
            self.thumbnail = first;
            self.emit(DocumentEvent::ThumbnailChanged { slide: first });
        }
        if self.loaded && first != self.meta.thumbnail_slide_id {
            self.meta.thumbnail_slide_id = first;
            self.needs_persistence = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SlideFields;

    fn document_with_keys(values: &[u64]) -> (Document, Vec<SlideId>) {
        let mut document = Document::new(DocumentId::new());
        let mut ids = Vec::new();
        for value in values {
            let slide = Slide::new(document.id(), SortKey::from_value(*value));
            ids.push(slide.id);
            document.add_slide(slide).unwrap();
        }
        (document, ids)
    }

    fn drain(rx: &Receiver<DocumentEvent>) -> Vec<DocumentEvent> {
        rx.try_iter().collect()
    }

    fn persisted_record(document: &Document, key: u64) -> Record {
        Record::slide(
            document.id(),
            SlideId::new(),
            SlideFields {
                sort_index: Some(SortKey::from_value(key)),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_visible_slides_follow_sort_key() {
        let (document, ids) = document_with_keys(&[3000, 1000, 2000]);
        let order: Vec<SlideId> = document.visible_slides().iter().map(|s| s.id).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
        assert_eq!(document.thumbnail_slide(), Some(ids[1]));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let (mut document, ids) = document_with_keys(&[1000]);
        let clash = Slide::new(document.id(), SortKey::from_value(1000));
        let err = document.add_slide(clash).unwrap_err();
        assert!(matches!(err, DeckError::SortKeyInUse { holder, .. } if holder == ids[0]));
        assert_eq!(document.slide_count(true), 1);
    }

    #[test]
    fn test_batch_add_emits_once() {
        let mut document = Document::new(DocumentId::new());
        let rx = document.subscribe();
        let slides = vec![
            Slide::new(document.id(), SortKey::from_value(1000)),
            Slide::new(document.id(), SortKey::from_value(2000)),
        ];
        document.add_slides(slides).unwrap();

        let events = drain(&rx);
        let changed = events
            .iter()
            .filter(|e| **e == DocumentEvent::SlidesChanged)
            .count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_set_trashed_moves_selection_and_emits_once() {
        let (mut document, ids) = document_with_keys(&[1000, 2000, 3000]);
        document.select(Some(ids[1])).unwrap();
        let rx = document.subscribe();

        let change = document.set_trashed(&[ids[1], ids[0]], true).unwrap();
        assert_eq!(change.slides().len(), 2);
        assert_eq!(document.selection(), Some(ids[2]));
        assert_eq!(document.slide_count(false), 1);
        assert_eq!(document.slide_count(true), 3);

        let events = drain(&rx);
        assert_eq!(events[0], DocumentEvent::SlidesChanged);
        assert!(events.contains(&DocumentEvent::SelectionChanged {
            slide: Some(ids[2])
        }));
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == DocumentEvent::SlidesChanged)
                .count(),
            1
        );
    }

    #[test]
    fn test_set_trashed_unknown_id_changes_nothing() {
        let (mut document, ids) = document_with_keys(&[1000]);
        let err = document
            .set_trashed(&[ids[0], SlideId::new()], true)
            .unwrap_err();
        assert!(matches!(err, DeckError::SlideNotFound(_)));
        assert!(!document.slide(ids[0]).unwrap().trashed);
    }

    #[test]
    fn test_revert_trash_restores_flags() {
        let (mut document, ids) = document_with_keys(&[1000, 2000]);
        document.set_trashed(&[ids[0]], true).unwrap();
        let change = document.set_trashed(&[ids[0], ids[1]], true).unwrap();
        assert_eq!(change.slides(), vec![ids[1]]);

        document.revert_trash(&change);
        assert!(document.slide(ids[0]).unwrap().trashed);
        assert!(!document.slide(ids[1]).unwrap().trashed);
    }

    #[test]
    fn test_revert_trash_restores_moved_selection() {
        let (mut document, ids) = document_with_keys(&[1000, 2000, 3000]);
        document.select(Some(ids[1])).unwrap();
        let change = document.set_trashed(&[ids[1]], true).unwrap();
        assert_eq!(document.selection(), Some(ids[2]));

        let rx = document.subscribe();
        document.revert_trash(&change);
        assert_eq!(document.selection(), Some(ids[1]));
        assert!(drain(&rx).contains(&DocumentEvent::SelectionChanged {
            slide: Some(ids[1])
        }));
    }

    #[test]
    fn test_revert_trash_keeps_selection_changed_since() {
        let (mut document, ids) = document_with_keys(&[1000, 2000, 3000]);
        document.select(Some(ids[1])).unwrap();
        let change = document.set_trashed(&[ids[1]], true).unwrap();
        document.select(Some(ids[0])).unwrap();

        document.revert_trash(&change);
        assert!(!document.slide(ids[1]).unwrap().trashed);
        assert_eq!(document.selection(), Some(ids[0]));
    }

    #[test]
    fn test_same_sort_index_is_silent() {
        let (mut document, ids) = document_with_keys(&[1000, 2000]);
        let rx = document.subscribe();
        let changed = document
            .set_sort_index(ids[0], SortKey::from_value(1000))
            .unwrap();
        assert!(!changed);
        assert!(drain(&rx).is_empty());

        assert!(document
            .set_sort_index(ids[0], SortKey::from_value(2500))
            .unwrap());
        assert_eq!(document.visible_slides()[1].id, ids[0]);
    }

    #[test]
    fn test_neighbors_include_trashed() {
        let (mut document, ids) = document_with_keys(&[1000, 2000, 3000]);
        document.set_trashed(&[ids[1]], true).unwrap();
        assert_eq!(document.neighbors(ids[2]).unwrap(), (Some(ids[1]), None));
        assert_eq!(document.neighbors(ids[0]).unwrap(), (None, Some(ids[1])));
    }

    #[test]
    fn test_keys_after_anchor_stay_before_next() {
        let (document, ids) = document_with_keys(&[1000, 2000]);
        let keys = document.keys_after(Some(ids[0]), 3).unwrap();
        assert_eq!(keys.len(), 3);
        let low = SortKey::from_value(1000);
        let high = SortKey::from_value(2000);
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(keys.iter().all(|key| low < *key && *key < high));
    }

    #[test]
    fn test_keys_after_without_anchor_append() {
        let (document, _) = document_with_keys(&[1000, 2000]);
        let keys = document.keys_after(None, 2).unwrap();
        assert_eq!(keys[0], SortKey::from_value(3000));
        assert!(keys[1] > keys[0]);
    }

    #[test]
    fn test_replace_keeps_identity_and_unpersisted_slides() {
        let (mut document, ids) = document_with_keys(&[1000]);
        let local = document.slide(ids[0]).unwrap().clone();

        let mut known = local.encode_to_record();
        known.slide_fields_mut().unwrap().name = Some("Fetched".to_string());
        let mut persisted = Slide::new(document.id(), SortKey::from_value(5000));
        persisted.has_been_persisted = true;
        let persisted_id = persisted.id;
        document.add_slide(persisted).unwrap();

        let fresh = persisted_record(&document, 2000);
        document.replace_from_records(&[known, fresh.clone()]);

        assert_eq!(
            document.slide(ids[0]).unwrap().title.as_deref(),
            Some("Fetched")
        );
        assert!(document.contains(SlideId(fresh.id)));
        assert!(!document.contains(persisted_id));
        assert_eq!(document.slide_count(true), 2);
    }

    #[test]
    fn test_replace_keeps_optimistic_insert_absent_from_fetch() {
        let (mut document, ids) = document_with_keys(&[1000]);
        let fetched = persisted_record(&document, 2000);
        document.replace_from_records(&[fetched]);
        assert!(document.contains(ids[0]));
        assert_eq!(document.slide_count(true), 2);
    }

    #[test]
    fn test_decode_deleted_record_removes_slide() {
        let (mut document, ids) = document_with_keys(&[1000, 2000]);
        let mut record = document.slide(ids[1]).unwrap().encode_to_record();
        record.mark_deleted();
        let result = document.decode_slide_record(&record, &[], false).unwrap();
        assert_eq!(result, None);
        assert!(!document.contains(ids[1]));
    }

    #[test]
    fn test_decode_unknown_record_only_when_adding() {
        let (mut document, _) = document_with_keys(&[1000]);
        let record = persisted_record(&document, 4000);
        assert_eq!(
            document.decode_slide_record(&record, &[], false).unwrap(),
            None
        );
        assert_eq!(
            document.decode_slide_record(&record, &[], true).unwrap(),
            Some(SlideId(record.id))
        );
        assert!(document.slide(SlideId(record.id)).unwrap().has_been_persisted);
    }

    #[test]
    fn test_thumbnail_change_flags_persistence_once_loaded() {
        let (mut document, ids) = document_with_keys(&[1000, 2000]);
        assert!(!document.needs_persistence());

        document.set_loaded(true);
        assert!(document.take_needs_persistence());
        assert_eq!(document.meta().thumbnail_slide_id, Some(ids[0]));

        document.set_trashed(&[ids[0]], true).unwrap();
        assert!(document.needs_persistence());
        assert_eq!(document.meta().thumbnail_slide_id, Some(ids[1]));
    }

    #[test]
    fn test_blank_title_decodes_as_untitled() {
        let id = DocumentId::new();
        let record = Record::presentation(
            id,
            PresentationFields {
                name: "   ".to_string(),
                ..Default::default()
            },
        );
        let document = Document::from_record(&record).unwrap();
        assert_eq!(document.title(), UNTITLED_PRESENTATION);
        assert!(!document.needs_persistence());
    }
}
