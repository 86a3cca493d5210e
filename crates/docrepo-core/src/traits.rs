use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreResult;
use crate::filter::{Filter, FindOptions, Update};
use crate::ids::DocumentId;
use crate::index::IndexSpec;

/// Size and population of one collection, as reported by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub document_count: u64,
    /// Serialized size of all documents in bytes.
    pub size_bytes: u64,
}

/// Document database driver the repository layer runs on.
///
/// Every single-document write is atomic: [`find_one_and_update`] evaluates the
/// filter and applies the update as one step, so two callers racing on the same
/// document observe exactly one winner. The lock protocol relies on nothing else.
///
/// Documents are JSON objects whose `_id` holds the [`DocumentId`] string.
///
/// [`find_one_and_update`]: DocumentStore::find_one_and_update
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name for logs and fingerprints (e.g. `"memory"`).
    fn backend_name(&self) -> &'static str;

    /// Inserts a new document, failing with `AlreadyExists` when the id is taken
    /// or a unique index rejects it.
    async fn insert_one(&self, collection: &str, id: DocumentId, doc: Value) -> CoreResult<()>;

    /// Inserts a batch all-or-nothing.
    ///
    /// When any document fails (a taken id, an id repeated in the batch, or a
    /// unique index violation) the error is returned and none of the batch is
    /// stored. Backends with transactions should override this.
    ///
    /// Default implementation calls `insert_one` sequentially and deletes the
    /// documents it already inserted when one fails.
    async fn insert_many(&self, collection: &str, docs: Vec<(DocumentId, Value)>) -> CoreResult<()> {
        let mut inserted = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            if let Err(err) = self.insert_one(collection, id, doc).await {
                for id in inserted {
                    self.delete_one(collection, &Filter::Id(id)).await?;
                }
                return Err(err);
            }
            inserted.push(id);
        }
        Ok(())
    }

    /// Returns the first document (in `_id` order) matching the filter.
    async fn find_one(&self, collection: &str, filter: &Filter) -> CoreResult<Option<Value>>;

    /// Returns all documents matching the filter, ordered and paged.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> CoreResult<Vec<Value>>;

    /// Counts documents matching the filter.
    async fn count(&self, collection: &str, filter: &Filter) -> CoreResult<u64>;

    /// Atomically updates the first matching document and returns its post-image,
    /// or `None` when nothing matched.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> CoreResult<Option<Value>>;

    /// Atomically updates the first matching document; reports whether one matched.
    async fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> CoreResult<bool> {
        Ok(self
            .find_one_and_update(collection, filter, update)
            .await?
            .is_some())
    }

    /// Deletes the first matching document; reports whether one was removed.
    async fn delete_one(&self, collection: &str, filter: &Filter) -> CoreResult<bool>;

    /// Deletes all matching documents and returns how many were removed.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> CoreResult<u64>;

    /// Lists the indexes present on a collection, ordered by name.
    async fn list_indexes(&self, collection: &str) -> CoreResult<Vec<IndexSpec>>;

    /// Creates an index; fails with `AlreadyExists` when the name is taken or
    /// existing documents violate a unique spec.
    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> CoreResult<()>;

    /// Drops an index by name; reports whether it existed.
    async fn drop_index(&self, collection: &str, name: &str) -> CoreResult<bool>;

    /// Names of all collections holding documents or indexes.
    async fn list_collections(&self) -> CoreResult<Vec<String>>;

    /// Removes a collection with its documents and indexes.
    async fn drop_collection(&self, collection: &str) -> CoreResult<()>;

    /// Population and size of a collection.
    async fn collection_stats(&self, collection: &str) -> CoreResult<CollectionStats>;
}
