use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

mod sort_key;
pub use sort_key::*;
mod record;
pub use record::*;
mod slide;
pub use slide::*;
mod document;
pub use document::*;
mod undo;
pub use undo::*;

#[derive(Debug, Error)]
pub enum DeckError {
    #[error("slide not found: {0}")]
    SlideNotFound(SlideId),
    #[error("slide already exists: {0}")]
    SlideExists(SlideId),
    #[error("sort key {key} already used by slide {holder}")]
    SortKeyInUse { key: SortKey, holder: SlideId },
    #[error("no sort key fits between {left} and {right}")]
    OrderingExhausted { left: SortKey, right: SortKey },
    #[error("invalid sort key: {0}")]
    InvalidSortKey(String),
    #[error("record {0} is not a slide")]
    NotASlide(Uuid),
    #[error("record {0} is not a presentation")]
    NotAPresentation(Uuid),
    #[error("history empty: {0}")]
    HistoryEmpty(&'static str),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SlideId(pub Uuid);

impl SlideId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlideId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SlideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MediaId(pub Uuid);

impl MediaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
