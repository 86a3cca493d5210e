//! Write buffering for the `Buffered` flavor.
//!
//! Entities added to a buffered collection are held in memory, keyed by id so
//! later writes to the same entity replace earlier ones, and written to the
//! store when the batch fills up, when the oldest entry exceeds `max_wait_ms`,
//! or when flushed explicitly.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use docrepo_core::metrics::BUFFER_FLUSHED;
use docrepo_core::{
    BufferConfig, CoreError, CoreResult, DocumentId, DocumentStore, Filter, Update,
    DISCRIMINATOR_FIELD,
};

use crate::collection::{Collection, CollectionFlavor};
use crate::entity::Entity;

/// What caused a flush; used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Age,
    Interval,
    Explicit,
    Shutdown,
}

impl FlushTrigger {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Age => "age",
            Self::Interval => "interval",
            Self::Explicit => "explicit",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Default)]
struct BufferState {
    pending: BTreeMap<DocumentId, Value>,
    /// When the oldest pending entry was added.
    first_added: Option<Instant>,
}

pub(crate) struct WriteBuffer {
    config: BufferConfig,
    state: Mutex<BufferState>,
}

impl WriteBuffer {
    pub(crate) fn new(config: BufferConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Queues a document; returns the trigger when a flush is now due.
    async fn push(&self, id: DocumentId, doc: Value) -> Option<FlushTrigger> {
        let mut state = self.state.lock().await;
        state.pending.insert(id, doc);
        let first_added = *state.first_added.get_or_insert_with(Instant::now);

        if state.pending.len() >= self.config.batch_size {
            Some(FlushTrigger::Size)
        } else if first_added.elapsed() >= self.config.max_wait() {
            Some(FlushTrigger::Age)
        } else {
            None
        }
    }

    pub(crate) async fn pending(&self, id: DocumentId) -> Option<Value> {
        self.state.lock().await.pending.get(&id).cloned()
    }

    /// Drops a pending write; reports whether one was queued.
    pub(crate) async fn discard(&self, id: DocumentId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.pending.remove(&id).is_some();
        if state.pending.is_empty() {
            state.first_added = None;
        }
        removed
    }

    async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn is_due(&self) -> bool {
        let state = self.state.lock().await;
        state
            .first_added
            .map_or(false, |first| first.elapsed() >= self.config.max_wait())
    }

    /// Writes every pending document; the buffer stays locked meanwhile so
    /// writes reach the store in a consistent order.
    ///
    /// On failure the unwritten documents are queued again.
    async fn flush(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
        discriminator: Option<&str>,
        trigger: FlushTrigger,
    ) -> CoreResult<usize> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return Ok(0);
        }

        let first_added = state.first_added.take();
        let mut queue = std::mem::take(&mut state.pending).into_iter();
        let mut written = 0;

        while let Some((id, doc)) = queue.next() {
            let filter = match discriminator {
                Some(discriminator) => {
                    Filter::eq(DISCRIMINATOR_FIELD, discriminator).and(Filter::Id(id))
                }
                None => Filter::Id(id),
            };
            if let Err(err) = upsert_document(store, collection, &filter, id, doc.clone()).await {
                state.pending.insert(id, doc);
                state.pending.extend(queue);
                state.first_added = first_added;
                BUFFER_FLUSHED
                    .with_label_values(&[collection, trigger.as_str()])
                    .inc_by(written as u64);
                tracing::error!(
                    collection = %collection,
                    written,
                    requeued = state.pending.len(),
                    error = %err,
                    "Buffer flush failed"
                );
                return Err(err);
            }
            written += 1;
        }

        BUFFER_FLUSHED
            .with_label_values(&[collection, trigger.as_str()])
            .inc_by(written as u64);
        tracing::debug!(
            collection = %collection,
            written,
            trigger = trigger.as_str(),
            "Flushed write buffer"
        );
        Ok(written)
    }
}

/// Replaces the document matching `filter`, or inserts `doc` under `id`.
///
/// An insert that loses a race against a concurrent insert retries the
/// replacement once.
pub(crate) async fn upsert_document(
    store: &dyn DocumentStore,
    collection: &str,
    filter: &Filter,
    id: DocumentId,
    doc: Value,
) -> CoreResult<()> {
    let update = Update::replace_with(doc.clone());
    if store.update_one(collection, filter, &update).await? {
        return Ok(());
    }
    match store.insert_one(collection, id, doc).await {
        Err(err @ CoreError::AlreadyExists { .. }) => {
            if store.update_one(collection, filter, &update).await? {
                Ok(())
            } else {
                Err(err)
            }
        }
        other => other,
    }
}

impl<T: Entity> Collection<T> {
    /// Queues an entity for writing, flushing when the batch is full or the
    /// oldest entry is too old. Returns whether a flush ran.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the collection is `Buffered`; flush failures.
    pub async fn add(&self, entity: &T) -> CoreResult<bool> {
        self.touch();
        let buffer = self.write_buffer()?;
        let doc = self.encode(entity)?;
        match buffer.push(entity.id(), doc).await {
            Some(trigger) => {
                buffer
                    .flush(self.inner.store.as_ref(), self.name(), self.discriminator(), trigger)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes all pending entities; returns how many were written.
    pub async fn flush(&self) -> CoreResult<usize> {
        self.touch();
        self.write_buffer()?
            .flush(
                self.inner.store.as_ref(),
                self.name(),
                self.discriminator(),
                FlushTrigger::Explicit,
            )
            .await
    }

    /// Entities waiting in the buffer.
    pub async fn pending_count(&self) -> CoreResult<usize> {
        Ok(self.write_buffer()?.len().await)
    }

    /// Flushes only when the oldest pending entry exceeded `max_wait_ms`.
    pub async fn flush_if_due(&self) -> CoreResult<usize> {
        let buffer = self.write_buffer()?;
        if buffer.is_due().await {
            buffer
                .flush(
                    self.inner.store.as_ref(),
                    self.name(),
                    self.discriminator(),
                    FlushTrigger::Interval,
                )
                .await
        } else {
            Ok(0)
        }
    }

    /// Spawns the periodic flusher; a second call while it runs is ignored.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the collection is `Buffered`.
    pub fn start_flush_worker(&self) -> CoreResult<()> {
        self.require_flavor(CollectionFlavor::Buffered)?;
        let mut worker = self.inner.flush_worker.lock();
        if worker.is_some() {
            tracing::warn!(collection = %self.name(), "Flush worker already running");
            return Ok(());
        }

        let collection = self.clone();
        let interval = self.inner.options.buffer.flush_interval();
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                if let Err(e) = collection.flush_if_due().await {
                    tracing::error!(collection = %collection.name(), error = %e, "Periodic flush failed");
                }
            }
        }));

        tracing::info!(
            collection = %self.name(),
            "Flush worker started (interval: {:?})",
            interval
        );
        Ok(())
    }

    /// Stops the flush worker and writes whatever is still pending.
    pub async fn shutdown(&self) -> CoreResult<usize> {
        let worker = self.inner.flush_worker.lock().take();
        if let Some(handle) = worker {
            handle.abort();
            tracing::info!(collection = %self.name(), "Flush worker shut down");
        }
        match &self.inner.buffer {
            Some(buffer) => {
                buffer
                    .flush(
                        self.inner.store.as_ref(),
                        self.name(),
                        self.discriminator(),
                        FlushTrigger::Shutdown,
                    )
                    .await
            }
            None => Ok(0),
        }
    }

    fn write_buffer(&self) -> CoreResult<&WriteBuffer> {
        self.require_flavor(CollectionFlavor::Buffered)?;
        self.inner
            .buffer
            .as_ref()
            .ok_or_else(|| CoreError::internal("buffered collection without a buffer"))
    }
}
