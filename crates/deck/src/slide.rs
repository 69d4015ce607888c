use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    AssetRef, DeckError, DocumentId, MediaFields, MediaId, Record, RecordBody, SlideFields,
    SlideId, SortKey,
};

/// A content object placed on a slide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Media {
    pub id: MediaId,
    pub kind: String,
    #[serde(default)]
    pub z_index: i32,
    #[serde(default)]
    pub asset: Option<AssetRef>,
    #[serde(default)]
    pub properties: Value,
}

impl Media {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: MediaId::new(),
            kind: kind.into(),
            z_index: 0,
            asset: None,
            properties: Value::Null,
        }
    }

    fn from_fields(id: MediaId, fields: &MediaFields) -> Self {
        Self {
            id,
            kind: fields.kind.clone(),
            z_index: fields.z_index,
            asset: fields.asset.clone(),
            properties: fields.properties.clone(),
        }
    }

    /// Content that still has to reach the record store.
    pub fn has_pending_asset(&self) -> bool {
        self.asset.as_ref().is_some_and(|asset| !asset.uploaded)
    }

    pub fn encode_to_record(&self, document_id: DocumentId, slide_id: SlideId) -> Record {
        Record::media(
            document_id,
            slide_id,
            self.id,
            MediaFields {
                kind: self.kind.clone(),
                z_index: self.z_index,
                trashed: false,
                asset: self.asset.clone(),
                properties: self.properties.clone(),
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slide {
    pub id: SlideId,
    pub document_id: DocumentId,
    pub sort_index: SortKey,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub has_been_persisted: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub room: Value,
    #[serde(default)]
    pub presenter: Value,
    #[serde(default)]
    pub speaker_notes: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    /// Ordered by `z_index`, bottom first.
    #[serde(default)]
    pub objects: Vec<Media>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// The slide this one was duplicated from.
    #[serde(default)]
    pub source_id: Option<SlideId>,
    /// Shown locally before the record store confirmed it.
    #[serde(default)]
    pub optimistic: bool,
}

impl Slide {
    pub fn new(document_id: DocumentId, sort_index: SortKey) -> Self {
        Self {
            id: SlideId::new(),
            document_id,
            sort_index,
            trashed: false,
            has_been_persisted: false,
            title: None,
            room: Value::Null,
            presenter: Value::Null,
            speaker_notes: None,
            metadata: Value::Null,
            objects: Vec::new(),
            created_at: None,
            updated_at: None,
            source_id: None,
            optimistic: false,
        }
    }

    /// Hydrates a slide from its record and media children. `fallback_key`
    /// is used when the record carries no sort index.
    pub fn from_record(
        record: &Record,
        children: &[Record],
        fallback_key: SortKey,
    ) -> Result<Self, DeckError> {
        let mut slide = Self::new(record.document_id, fallback_key);
        slide.id = SlideId(record.id);
        slide.decode_from_record(record)?;
        for child in children {
            slide.decode_child(child);
        }
        Ok(slide)
    }

    /// Applies authoritative fields from `record`. Identity is kept; a
    /// missing sort index leaves the current key in place.
    pub fn decode_from_record(&mut self, record: &Record) -> Result<(), DeckError> {
        let RecordBody::Slide(fields) = &record.body else {
            return Err(DeckError::NotASlide(record.id));
        };
        if record.id != self.id.0 {
            return Err(DeckError::NotASlide(record.id));
        }

        self.document_id = record.document_id;
        if let Some(key) = &fields.sort_index {
            self.sort_index = key.clone();
        }
        self.trashed = fields.trashed;
        self.title = fields.name.clone().filter(|name| !name.trim().is_empty());
        self.room = fields.room.clone();
        self.presenter = fields.presenter.clone();
        self.speaker_notes = fields.speaker_notes.clone();
        self.metadata = fields.metadata.clone();
        if record.created_at.is_some() {
            self.created_at = record.created_at;
        }
        if record.updated_at.is_some() {
            self.updated_at = record.updated_at;
        }
        self.has_been_persisted = true;
        self.optimistic = false;
        Ok(())
    }

    /// Applies one media child record. Returns whether the object list
    /// changed. Records that are not media children of this slide are
    /// ignored.
    pub fn decode_child(&mut self, record: &Record) -> bool {
        let RecordBody::Media(fields) = &record.body else {
            return false;
        };
        if record.parent_id != self.id.0 {
            return false;
        }

        let id = MediaId(record.id);
        let position = self.objects.iter().position(|media| media.id == id);
        if record.deleted || fields.trashed {
            return match position {
                Some(index) => {
                    self.objects.remove(index);
                    true
                }
                None => false,
            };
        }

        let decoded = Media::from_fields(id, fields);
        match position {
            Some(index) if self.objects[index] == decoded => return false,
            Some(index) => self.objects[index] = decoded,
            None => self.objects.push(decoded),
        }
        self.objects.sort_by_key(|media| media.z_index);
        true
    }

    /// Adds an object; with no z-index it lands above the current top.
    pub fn add_object(&mut self, mut media: Media, z_index: Option<i32>) -> MediaId {
        media.z_index = match z_index {
            Some(z) => z,
            None => self
                .objects
                .iter()
                .map(|existing| existing.z_index)
                .max()
                .map_or(0, |top| top.saturating_add(1)),
        };
        let id = media.id;
        self.objects.push(media);
        self.objects.sort_by_key(|media| media.z_index);
        id
    }

    pub fn object(&self, id: MediaId) -> Option<&Media> {
        self.objects.iter().find(|media| media.id == id)
    }

    pub fn object_mut(&mut self, id: MediaId) -> Option<&mut Media> {
        self.objects.iter_mut().find(|media| media.id == id)
    }

    pub fn encode_to_record(&self) -> Record {
        let mut record = Record::slide(
            self.document_id,
            self.id,
            SlideFields {
                name: self.title.clone(),
                sort_index: Some(self.sort_index.clone()),
                trashed: self.trashed,
                room: self.room.clone(),
                presenter: self.presenter.clone(),
                speaker_notes: self.speaker_notes.clone(),
                metadata: self.metadata.clone(),
            },
        );
        record.created_at = self.created_at;
        record.updated_at = self.updated_at;
        record
    }

    pub fn media_records(&self) -> Vec<Record> {
        self.objects
            .iter()
            .map(|media| media.encode_to_record(self.document_id, self.id))
            .collect()
    }

    pub fn requires_upload(&self) -> bool {
        self.objects.iter().any(Media::has_pending_asset)
    }

    /// Content hash used to notice that a slide's rendering went stale.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.0.as_bytes());
        for media in &self.objects {
            hasher.update(media.id.0.as_bytes());
            hasher.update(media.kind.as_bytes());
            hasher.update(media.z_index.to_le_bytes());
            if let Some(asset) = &media.asset {
                hasher.update(asset.fingerprint.as_bytes());
            }
            hasher.update(media.properties.to_string().as_bytes());
        }
        hasher.update(self.room.to_string().as_bytes());
        hasher.update(self.presenter.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}
