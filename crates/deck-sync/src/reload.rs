//! At most one full refresh per document.
//!
//! Concurrent callers share the pending fetch. The in-flight marker is
//! cleared when the fetch settles, whether it succeeded or not, so a
//! failed reload can simply be retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deck::{Document, SlideId};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::{RecordTransport, Result, SyncError};

type ReloadFuture = Shared<BoxFuture<'static, Result<Vec<SlideId>>>>;

pub struct ReloadCoordinator {
    document: Arc<Mutex<Document>>,
    transport: Arc<dyn RecordTransport>,
    in_flight: Arc<Mutex<Option<(u64, ReloadFuture)>>>,
    generation: AtomicU64,
}

impl ReloadCoordinator {
    pub fn new(document: Arc<Mutex<Document>>, transport: Arc<dyn RecordTransport>) -> Self {
        Self {
            document,
            transport,
            in_flight: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_reloading(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Replaces the document's slides with the store's records and returns
    /// the visible order. Joins a reload that is already running.
    pub async fn reload(&self) -> Result<Vec<SlideId>> {
        let future = {
            let mut slot = self.in_flight.lock();
            let joined = slot.as_ref().map(|(_, pending)| pending.clone());
            match joined {
                Some(pending) => pending,
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let pending = run_reload(
                        Arc::clone(&self.document),
                        Arc::clone(&self.transport),
                        Arc::clone(&self.in_flight),
                        generation,
                    )
                    .boxed()
                    .shared();
                    *slot = Some((generation, pending.clone()));
                    pending
                }
            }
        };
        future.await
    }

    /// Reloads unless the document has already been loaded.
    pub async fn ensure_loaded(&self) -> Result<()> {
        if self.document.lock().is_loaded() {
            return Ok(());
        }
        self.reload().await.map(|_| ())
    }
}

async fn run_reload(
    document: Arc<Mutex<Document>>,
    transport: Arc<dyn RecordTransport>,
    in_flight: Arc<Mutex<Option<(u64, ReloadFuture)>>>,
    generation: u64,
) -> Result<Vec<SlideId>> {
    let id = {
        let mut document = document.lock();
        document.set_loading(true);
        document.id()
    };

    let fetched = transport.fetch(id).await;

    let result = {
        let mut document = document.lock();
        document.set_loading(false);
        match fetched {
            Ok(records) => {
                document.replace_from_records(&records);
                document.set_loaded(true);
                let order: Vec<SlideId> = document
                    .visible_slides()
                    .iter()
                    .map(|slide| slide.id)
                    .collect();
                info!(document = %id, slides = order.len(), "reloaded document");
                Ok(order)
            }
            Err(err) => {
                error!(document = %id, error = %err, "document reload failed");
                Err(SyncError::ReloadFailed(err.to_string()))
            }
        }
    };

    let mut slot = in_flight.lock();
    if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
        *slot = None;
    }
    result
}
