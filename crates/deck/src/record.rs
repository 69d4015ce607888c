//! Typed records exchanged with the record store.
//!
//! Every record names its collection through the `collection` tag; decoders
//! match on [`RecordBody`] instead of probing for properties.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{DocumentId, MediaId, SlideId, SortKey};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Presentation,
    Slide,
    Media,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: Uuid,
    /// Owning record: the document for slides, the slide for media, the
    /// document itself for the presentation record.
    pub parent_id: Uuid,
    pub document_id: DocumentId,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub body: RecordBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum RecordBody {
    Presentation(PresentationFields),
    Slide(SlideFields),
    Media(MediaFields),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PresentationFields {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub last_viewed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub welcome: bool,
    #[serde(default)]
    pub thumbnail_slide_id: Option<SlideId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlideFields {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sort_index: Option<SortKey>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub room: Value,
    #[serde(default)]
    pub presenter: Value,
    #[serde(default)]
    pub speaker_notes: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaFields {
    pub kind: String,
    #[serde(default)]
    pub z_index: i32,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub asset: Option<AssetRef>,
    #[serde(default)]
    pub properties: Value,
}

/// Reference to binary content held by the record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AssetRef {
    pub fingerprint: String,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default)]
    pub size: u64,
}

impl AssetRef {
    pub fn for_bytes(data: &[u8]) -> Self {
        Self {
            fingerprint: fingerprint(data),
            uploaded: false,
            size: data.len() as u64,
        }
    }
}

/// Hex SHA-256 of `data`.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl Record {
    pub fn presentation(document_id: DocumentId, fields: PresentationFields) -> Self {
        Self {
            id: document_id.0,
            parent_id: document_id.0,
            document_id,
            deleted: false,
            created_at: None,
            updated_at: None,
            body: RecordBody::Presentation(fields),
        }
    }

    pub fn slide(document_id: DocumentId, slide_id: SlideId, fields: SlideFields) -> Self {
        Self {
            id: slide_id.0,
            parent_id: document_id.0,
            document_id,
            deleted: false,
            created_at: None,
            updated_at: None,
            body: RecordBody::Slide(fields),
        }
    }

    pub fn media(
        document_id: DocumentId,
        slide_id: SlideId,
        media_id: MediaId,
        fields: MediaFields,
    ) -> Self {
        Self {
            id: media_id.0,
            parent_id: slide_id.0,
            document_id,
            deleted: false,
            created_at: None,
            updated_at: None,
            body: RecordBody::Media(fields),
        }
    }

    pub fn collection(&self) -> Collection {
        match self.body {
            RecordBody::Presentation(_) => Collection::Presentation,
            RecordBody::Slide(_) => Collection::Slide,
            RecordBody::Media(_) => Collection::Media,
        }
    }

    /// Hard-deleted. Trashed slides and media are still present.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_trashed(&self) -> bool {
        match &self.body {
            RecordBody::Slide(fields) => fields.trashed,
            RecordBody::Media(fields) => fields.trashed,
            RecordBody::Presentation(_) => false,
        }
    }

    pub fn slide_fields(&self) -> Option<&SlideFields> {
        match &self.body {
            RecordBody::Slide(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn slide_fields_mut(&mut self) -> Option<&mut SlideFields> {
        match &mut self.body {
            RecordBody::Slide(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn media_fields(&self) -> Option<&MediaFields> {
        match &self.body {
            RecordBody::Media(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn media_fields_mut(&mut self) -> Option<&mut MediaFields> {
        match &mut self.body {
            RecordBody::Media(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn presentation_fields(&self) -> Option<&PresentationFields> {
        match &self.body {
            RecordBody::Presentation(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}
