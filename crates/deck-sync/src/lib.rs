//! Optimistic synchronisation of decks with a record store.
//!
//! Mutations are applied to the local [`deck::Document`] first, uploaded in
//! the background and rolled back when the upload fails or is cancelled.
use std::sync::Arc;

use deck::DeckError;
use thiserror::Error;

mod config;
pub use config::*;

mod transport;
pub use transport::*;

mod memory;
pub use memory::*;

mod store;
pub use store::*;

mod persistence;
pub use persistence::*;

mod reload;
pub use reload::*;

mod handle;
pub use handle::*;

mod mutation;
pub use mutation::*;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("reload failed: {0}")]
    ReloadFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Recasts a transport failure inside an upload path.
    pub(crate) fn into_upload(self) -> Self {
        match self {
            SyncError::Cancelled | SyncError::UploadFailed(_) => self,
            other => SyncError::UploadFailed(other.to_string()),
        }
    }
}

impl From<DeckError> for SyncError {
    fn from(err: DeckError) -> Self {
        match err {
            DeckError::SlideNotFound(id) => SyncError::NotFound(format!("slide {id}")),
            other => SyncError::Model(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Upload progress sink, called with a fraction in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;
