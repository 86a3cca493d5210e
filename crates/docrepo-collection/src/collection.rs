use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use docrepo_core::document::validate_collection_name;
use docrepo_core::lock::free_filter;
use docrepo_core::registry;
use docrepo_core::{
    BufferConfig, CoreError, CoreResult, DecodedDocument, DocumentId, DocumentStore, Filter,
    FindOptions, IndexConfig, IndexModel, LockConfig, LockInfo, LockState, RepoConfig,
    TypeRegistry, Update, DISCRIMINATOR_FIELD,
};

use crate::buffer::{upsert_document, WriteBuffer};
use crate::entity::{decode, encode, Entity};
use crate::model::{CollectionFingerprint, CollectionModel};
use crate::reconciler::IndexReconciler;

/// Capability set a collection instance runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionFlavor {
    /// Reads and writes go straight to the store.
    Disk,
    /// Adds a write buffer flushed by size, age or a background worker.
    Buffered,
    /// Adds lease-based entity locking.
    Lockable,
}

impl CollectionFlavor {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Buffered => "buffered",
            Self::Lockable => "lockable",
        }
    }
}

impl fmt::Display for CollectionFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance collection settings.
#[derive(Clone)]
pub struct CollectionOptions {
    pub name: String,
    pub flavor: CollectionFlavor,
    pub lock: LockConfig,
    pub index: IndexConfig,
    pub buffer: BufferConfig,
    /// Makes the collection polymorphic: documents are tagged with the
    /// discriminator registered for the entity type.
    pub registry: Option<&'static TypeRegistry>,
}

impl CollectionOptions {
    pub fn new(name: impl Into<String>, flavor: CollectionFlavor) -> Self {
        Self {
            name: name.into(),
            flavor,
            lock: LockConfig::default(),
            index: IndexConfig::default(),
            buffer: BufferConfig::default(),
            registry: None,
        }
    }

    /// Options taking lock, index and buffer settings from a loaded config.
    pub fn from_config(
        name: impl Into<String>,
        flavor: CollectionFlavor,
        config: &RepoConfig,
    ) -> Self {
        Self {
            lock: config.lock.clone(),
            index: config.index.clone(),
            buffer: config.buffer.clone(),
            ..Self::new(name, flavor)
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: &'static TypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Uses the process-wide registry published with [`registry::install`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when no registry has been installed yet.
    pub fn with_global_registry(self) -> CoreResult<Self> {
        let registry = registry::global().ok_or_else(|| {
            CoreError::invalid_state(format!(
                "collection `{}` asked for the global type registry before it was installed",
                self.name
            ))
        })?;
        Ok(self.with_registry(registry))
    }

    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }

    #[must_use]
    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) options: CollectionOptions,
    pub(crate) discriminator: Option<String>,
    pub(crate) buffer: Option<WriteBuffer>,
    pub(crate) flush_worker: Mutex<Option<JoinHandle<()>>>,
    access_count: AtomicU64,
}

/// Typed access to one store collection.
///
/// Cloning is cheap and clones share the buffer, worker and access counter.
pub struct Collection<T> {
    pub(crate) inner: Arc<Inner>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Collection<T> {
    /// Creates the collection without touching the store; see [`init`](Self::init).
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an invalid name or buffer config, or when a
    /// registry is configured that does not know `T`.
    pub fn new(store: Arc<dyn DocumentStore>, options: CollectionOptions) -> CoreResult<Self> {
        validate_collection_name(&options.name)?;
        options
            .buffer
            .validate()
            .map_err(|e| CoreError::ValidationError(format!("Invalid buffer config: {e}")))?;

        let discriminator = match options.registry {
            Some(registry) => Some(
                registry
                    .discriminator_of::<T>()
                    .ok_or_else(|| {
                        CoreError::ValidationError(format!(
                            "`{}` is not registered in the type registry",
                            type_name::<T>()
                        ))
                    })?
                    .to_string(),
            ),
            None => None,
        };
        let buffer = (options.flavor == CollectionFlavor::Buffered)
            .then(|| WriteBuffer::new(options.buffer.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                options,
                discriminator,
                buffer,
                flush_worker: Mutex::new(None),
                access_count: AtomicU64::new(0),
            }),
            _entity: PhantomData,
        })
    }

    /// Startup step: reconciles declared indexes with the store.
    ///
    /// # Errors
    ///
    /// Returns `IndexMismatch` in fail-fast mode when indexes drifted.
    pub async fn init(&self) -> CoreResult<Vec<IndexModel>> {
        let report = self.reconcile_indexes().await?;
        tracing::info!(
            collection = %self.name(),
            flavor = %self.flavor(),
            backend = self.inner.store.backend_name(),
            indexes = report.len(),
            "Collection initialized"
        );
        Ok(report)
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn flavor(&self) -> CollectionFlavor {
        self.inner.options.flavor
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.inner.options
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Discriminator written to documents of this collection, if polymorphic.
    pub fn discriminator(&self) -> Option<&str> {
        self.inner.discriminator.as_deref()
    }

    /// Number of operations served since creation.
    pub fn access_count(&self) -> u64 {
        self.inner.access_count.load(Ordering::Relaxed)
    }

    /// Reconciles the store's indexes against `T::declared_indexes()`.
    ///
    /// # Errors
    ///
    /// See [`IndexReconciler::reconcile`].
    pub async fn reconcile_indexes(&self) -> CoreResult<Vec<IndexModel>> {
        self.touch();
        IndexReconciler::new(Arc::clone(&self.inner.store), &self.inner.options.index)
            .reconcile(self.name(), &T::declared_indexes())
            .await
    }

    // ----- read -----

    /// Fetches one entity; buffered collections see their pending writes.
    pub async fn get(&self, id: DocumentId) -> CoreResult<Option<T>> {
        self.touch();
        if let Some(buffer) = &self.inner.buffer {
            if let Some(doc) = buffer.pending(id).await {
                return decode(doc).map(Some);
            }
        }
        self.inner
            .store
            .find_one(self.name(), &self.scoped(Filter::Id(id)))
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn find(&self, filter: Filter, options: &FindOptions) -> CoreResult<Vec<T>> {
        self.touch();
        self.inner
            .store
            .find(self.name(), &self.scoped(filter), options)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn find_one(&self, filter: Filter) -> CoreResult<Option<T>> {
        self.touch();
        self.inner
            .store
            .find_one(self.name(), &self.scoped(filter))
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn count(&self, filter: Filter) -> CoreResult<u64> {
        self.touch();
        self.inner.store.count(self.name(), &self.scoped(filter)).await
    }

    pub async fn exists(&self, id: DocumentId) -> CoreResult<bool> {
        Ok(self.count(Filter::Id(id)).await? > 0)
    }

    /// Reads documents of every registered type, ignoring this collection's
    /// own discriminator.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the collection has no registry.
    pub async fn find_any(
        &self,
        filter: Filter,
        options: &FindOptions,
    ) -> CoreResult<Vec<DecodedDocument>> {
        self.touch();
        let registry = self.inner.options.registry.ok_or_else(|| {
            CoreError::invalid_state(format!("collection `{}` has no type registry", self.name()))
        })?;
        self.inner
            .store
            .find(self.name(), &filter, options)
            .await?
            .into_iter()
            .map(|doc| registry.decode(doc))
            .collect()
    }

    // ----- write -----

    /// Inserts a new entity; fails with `AlreadyExists` when the id is taken.
    pub async fn insert(&self, entity: &T) -> CoreResult<()> {
        self.touch();
        self.discard_pending(entity.id()).await;
        let doc = self.encode(entity)?;
        self.inner.store.insert_one(self.name(), entity.id(), doc).await
    }

    pub async fn insert_many(&self, entities: &[T]) -> CoreResult<()> {
        self.touch();
        let mut docs = Vec::with_capacity(entities.len());
        for entity in entities {
            self.discard_pending(entity.id()).await;
            docs.push((entity.id(), self.encode(entity)?));
        }
        self.inner.store.insert_many(self.name(), docs).await
    }

    /// Replaces a stored entity.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent; `LockConflict` when a lockable document is held.
    pub async fn replace(&self, entity: &T) -> CoreResult<()> {
        self.touch();
        let id = entity.id();
        self.discard_pending(id).await;
        let replaced = self
            .inner
            .store
            .update_one(
                self.name(),
                &self.writable(Filter::Id(id)),
                &Update::replace_with(self.encode(entity)?),
            )
            .await?;
        if replaced {
            Ok(())
        } else {
            Err(self
                .explain_refusal(id, CoreError::not_found(self.name(), id.to_string()))
                .await)
        }
    }

    /// Replaces or inserts an entity.
    ///
    /// # Errors
    ///
    /// `LockConflict` when a lockable document is held.
    pub async fn upsert(&self, entity: &T) -> CoreResult<()> {
        self.touch();
        let id = entity.id();
        self.discard_pending(id).await;
        let doc = self.encode(entity)?;
        match upsert_document(
            self.inner.store.as_ref(),
            self.name(),
            &self.writable(Filter::Id(id)),
            id,
            doc,
        )
        .await
        {
            Err(err @ CoreError::AlreadyExists { .. }) => Err(self.explain_refusal(id, err).await),
            other => other,
        }
    }

    /// Deletes an entity; reports whether one was removed.
    ///
    /// # Errors
    ///
    /// `LockConflict` when a lockable document is held.
    pub async fn delete(&self, id: DocumentId) -> CoreResult<bool> {
        self.touch();
        let discarded = self.discard_pending(id).await;
        if self
            .inner
            .store
            .delete_one(self.name(), &self.writable(Filter::Id(id)))
            .await?
        {
            return Ok(true);
        }
        match self.explain_refusal(id, CoreError::not_found(self.name(), id.to_string())).await {
            CoreError::NotFound { .. } => Ok(discarded),
            err => Err(err),
        }
    }

    /// Deletes matching entities, skipping documents that are currently held.
    pub async fn delete_many(&self, filter: Filter) -> CoreResult<u64> {
        self.touch();
        self.inner
            .store
            .delete_many(self.name(), &self.writable(filter))
            .await
    }

    // ----- observability -----

    pub fn fingerprint(&self) -> CollectionFingerprint {
        CollectionFingerprint {
            collection_name: self.name().to_string(),
            entity_type: type_name::<T>().to_string(),
            flavor: self.flavor(),
            discriminator: self.inner.discriminator.clone(),
            backend: self.inner.store.backend_name().to_string(),
        }
    }

    /// Snapshot of population, size, usage and index health.
    pub async fn model(&self) -> CoreResult<CollectionModel> {
        let stats = self.inner.store.collection_stats(self.name()).await?;
        let current = self.inner.store.list_indexes(self.name()).await?;
        let indexes = IndexReconciler::diff(&T::declared_indexes(), &current);
        let index_healthy = indexes.iter().all(|model| !model.has_drift());

        Ok(CollectionModel {
            fingerprint: self.fingerprint(),
            document_count: stats.document_count,
            size_bytes: stats.size_bytes,
            access_count: self.access_count(),
            indexes,
            index_healthy,
        })
    }

    // ----- helpers -----

    pub(crate) fn touch(&self) {
        self.inner.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn encode(&self, entity: &T) -> CoreResult<Value> {
        encode(entity, self.inner.discriminator.as_deref())
    }

    /// Restricts a filter to this collection's discriminator.
    pub(crate) fn scoped(&self, filter: Filter) -> Filter {
        match &self.inner.discriminator {
            Some(discriminator) => {
                Filter::eq(DISCRIMINATOR_FIELD, discriminator.as_str()).and(filter)
            }
            None => filter,
        }
    }

    /// Filter for application writes: lockable documents must not be held.
    pub(crate) fn writable(&self, filter: Filter) -> Filter {
        let filter = self.scoped(filter);
        match self.flavor() {
            CollectionFlavor::Lockable => filter.and(free_filter(Utc::now())),
            CollectionFlavor::Disk | CollectionFlavor::Buffered => filter,
        }
    }

    pub(crate) fn require_flavor(&self, flavor: CollectionFlavor) -> CoreResult<()> {
        if self.flavor() == flavor {
            Ok(())
        } else {
            Err(CoreError::invalid_state(format!(
                "collection `{}` is {}, operation needs {}",
                self.name(),
                self.flavor(),
                flavor
            )))
        }
    }

    /// Why a conditional write on `id` matched nothing: a live lock turns into
    /// `LockConflict`, anything else keeps `fallback`.
    pub(crate) async fn explain_refusal(&self, id: DocumentId, fallback: CoreError) -> CoreError {
        let doc = match self
            .inner
            .store
            .find_one(self.name(), &self.scoped(Filter::Id(id)))
            .await
        {
            Ok(Some(doc)) => doc,
            Ok(None) => return fallback,
            Err(err) => return err,
        };
        match LockInfo::from_document(&doc) {
            Ok(Some(lock)) => self.lock_conflict(id, &lock).unwrap_or(fallback),
            Ok(None) => fallback,
            Err(err) => err,
        }
    }

    /// `LockConflict` for a lock that is still live at the current time.
    pub(crate) fn lock_conflict(&self, id: DocumentId, lock: &LockInfo) -> Option<CoreError> {
        let holder = lock.actor.as_deref().unwrap_or("unknown holder");
        let reason = match lock.state {
            LockState::Error => format!(
                "document is in error state: {}",
                lock.error
                    .as_ref()
                    .map_or("no details", |error| error.message.as_str())
            ),
            LockState::Locked if !lock.is_expired_at(Utc::now()) => {
                format!("held by {holder} until {}", lock.expires_at.to_rfc3339())
            }
            LockState::Locked | LockState::Unlocked => return None,
        };
        Some(CoreError::lock_conflict(self.name(), id.to_string(), reason))
    }

    async fn discard_pending(&self, id: DocumentId) -> bool {
        match &self.inner.buffer {
            Some(buffer) => buffer.discard(id).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrepo_core::IndexReconcileMode;

    #[test]
    fn test_flavor_serde_names() {
        assert_eq!(
            serde_json::to_value(CollectionFlavor::Lockable).unwrap(),
            "lockable"
        );
        let flavor: CollectionFlavor = serde_json::from_str(r#""buffered""#).unwrap();
        assert_eq!(flavor, CollectionFlavor::Buffered);
        assert_eq!(CollectionFlavor::Disk.to_string(), "disk");
    }

    #[test]
    fn test_options_from_config() {
        let mut config = RepoConfig::default();
        config.lock.lease_secs = 90;
        config.index.mode = IndexReconcileMode::FailFast;
        config.buffer.batch_size = 7;

        let options = CollectionOptions::from_config("orders", CollectionFlavor::Buffered, &config);
        assert_eq!(options.name, "orders");
        assert_eq!(options.lock.lease_secs, 90);
        assert_eq!(options.index.mode, IndexReconcileMode::FailFast);
        assert_eq!(options.buffer.batch_size, 7);
        assert!(options.registry.is_none());
    }
}
