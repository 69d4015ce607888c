//! Debounced persistence of document metadata.
//!
//! Every change restarts a quiescence timer; once it runs out the metadata
//! is posted and the store's answer decoded back into the document. A write
//! already in flight is never aborted. Changes made meanwhile schedule their
//! own write.

use std::sync::Arc;
use std::time::Duration;

use deck::{Collection, Document};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{accepted, RecordTransport, Result};

#[derive(Default)]
struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub struct MetadataPersister {
    document: Arc<Mutex<Document>>,
    transport: Arc<dyn RecordTransport>,
    window: Duration,
    timer: Mutex<Timer>,
}

impl MetadataPersister {
    pub fn new(
        document: Arc<Mutex<Document>>,
        transport: Arc<dyn RecordTransport>,
        window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            document,
            transport,
            window,
            timer: Mutex::new(Timer::default()),
        })
    }

    /// (Re)arms the timer. Must be called from within a tokio runtime.
    pub fn schedule(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        timer.generation += 1;
        let generation = timer.generation;

        let this = Arc::clone(self);
        let window = self.window;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut timer = this.timer.lock();
                if timer.generation != generation || timer.task.is_none() {
                    return;
                }
                // From here on the write runs to completion.
                timer.task = None;
            }
            if let Err(err) = this.persist().await {
                error!(error = %err, "document metadata persistence failed");
            }
        });

        if let Some(previous) = timer.task.replace(task) {
            previous.abort();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.timer.lock().task.is_some()
    }

    /// Cancels the timer and writes any pending metadata now.
    pub async fn flush(&self) -> Result<()> {
        let task = self.timer.lock().task.take();
        if let Some(task) = task {
            task.abort();
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let record = {
            let mut document = self.document.lock();
            if !document.take_needs_persistence() {
                return Ok(());
            }
            document.encode_to_record()
        };
        let id = record.document_id;

        let saved = self
            .transport
            .post(vec![record], &CancellationToken::new())
            .await
            .and_then(accepted);

        let mut document = self.document.lock();
        match saved {
            Ok(records) => {
                for record in records
                    .iter()
                    .filter(|record| record.collection() == Collection::Presentation)
                {
                    if let Err(err) = document.decode_from_record(record) {
                        error!(document = %id, error = %err, "could not decode saved metadata");
                    }
                }
                debug!(document = %id, "persisted document metadata");
                Ok(())
            }
            Err(err) => {
                document.request_persistence();
                Err(err)
            }
        }
    }
}
