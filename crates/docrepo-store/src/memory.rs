use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use docrepo_core::document::{encoded_len, validate_collection_name};
use docrepo_core::filter::lookup;
use docrepo_core::{
    CollectionStats, CoreError, CoreResult, DocumentId, DocumentStore, Filter, FindOptions,
    IndexSpec, Update,
};

#[derive(Default)]
struct CollectionData {
    docs: BTreeMap<DocumentId, Value>,
    indexes: BTreeMap<String, IndexSpec>,
}

impl CollectionData {
    fn first_match(&self, filter: &Filter) -> Option<(DocumentId, &Value)> {
        if let Some(id) = filter.id_hint() {
            return self
                .docs
                .get(&id)
                .filter(|doc| filter.matches(doc))
                .map(|doc| (id, doc));
        }
        self.docs
            .iter()
            .find(|(_, doc)| filter.matches(doc))
            .map(|(id, doc)| (*id, doc))
    }

    /// Rejects `doc` when a unique index already holds its key under another id.
    fn check_unique(&self, collection: &str, id: DocumentId, doc: &Value) -> CoreResult<()> {
        for spec in self.indexes.values().filter(|spec| spec.unique) {
            let Some(key) = unique_key(spec, doc) else {
                continue;
            };
            let taken = self.docs.iter().any(|(other_id, other)| {
                *other_id != id && unique_key(spec, other).as_ref() == Some(&key)
            });
            if taken {
                return Err(CoreError::already_exists(
                    collection,
                    format!("{} ({})", spec.name, key.join(", ")),
                ));
            }
        }
        Ok(())
    }
}

/// Key of `doc` under a unique index, `None` when any field is absent or null.
///
/// Numbers are normalized so that `1` and `1.0` collide.
fn unique_key(spec: &IndexSpec, doc: &Value) -> Option<Vec<String>> {
    spec.fields()
        .map(|field| match lookup(doc, field)? {
            Value::Null => None,
            Value::Number(n) => n.as_f64().map(|f| format!("n:{f}")),
            other => Some(other.to_string()),
        })
        .collect()
}

/// In-process document store.
///
/// All collections live behind one `RwLock`; every write runs under the write
/// guard, which makes single-document updates atomic.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, CollectionData>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert_one(&self, collection: &str, id: DocumentId, doc: Value) -> CoreResult<()> {
        validate_collection_name(collection)?;
        let mut collections = self.collections.write();
        let data = collections.entry(collection.to_string()).or_default();
        if data.docs.contains_key(&id) {
            return Err(CoreError::already_exists(collection, id.to_string()));
        }
        data.check_unique(collection, id, &doc)?;
        data.docs.insert(id, doc);
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<(DocumentId, Value)>) -> CoreResult<()> {
        validate_collection_name(collection)?;
        let mut collections = self.collections.write();
        let data = collections.entry(collection.to_string()).or_default();
        let mut inserted = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            let checked = if data.docs.contains_key(&id) {
                Err(CoreError::already_exists(collection, id.to_string()))
            } else {
                data.check_unique(collection, id, &doc)
            };
            if let Err(err) = checked {
                // The write lock is still held, so no reader saw the partial batch.
                for id in inserted {
                    data.docs.remove(&id);
                }
                return Err(err);
            }
            data.docs.insert(id, doc);
            inserted.push(id);
        }
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> CoreResult<Option<Value>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|data| data.first_match(filter))
            .map(|(_, doc)| doc.clone()))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> CoreResult<Vec<Value>> {
        let matched: Vec<Value> = {
            let collections = self.collections.read();
            match collections.get(collection) {
                Some(data) => data
                    .docs
                    .values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };
        Ok(options.apply(matched))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> CoreResult<u64> {
        let collections = self.collections.read();
        Ok(collections.get(collection).map_or(0, |data| {
            data.docs.values().filter(|doc| filter.matches(doc)).count() as u64
        }))
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> CoreResult<Option<Value>> {
        let mut collections = self.collections.write();
        let Some(data) = collections.get_mut(collection) else {
            return Ok(None);
        };
        let Some((id, current)) = data.first_match(filter) else {
            return Ok(None);
        };

        let updated = update.apply(current)?;
        data.check_unique(collection, id, &updated)?;
        data.docs.insert(id, updated.clone());
        Ok(Some(updated))
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> CoreResult<bool> {
        let mut collections = self.collections.write();
        let Some(data) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let matched = data.first_match(filter).map(|(id, _)| id);
        Ok(matched.map_or(false, |id| data.docs.remove(&id).is_some()))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> CoreResult<u64> {
        let mut collections = self.collections.write();
        let Some(data) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = data.docs.len();
        data.docs.retain(|_, doc| !filter.matches(doc));
        Ok((before - data.docs.len()) as u64)
    }

    async fn list_indexes(&self, collection: &str) -> CoreResult<Vec<IndexSpec>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|data| data.indexes.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> CoreResult<()> {
        validate_collection_name(collection)?;
        spec.validate()?;

        let mut collections = self.collections.write();
        let data = collections.entry(collection.to_string()).or_default();
        if data.indexes.contains_key(&spec.name) {
            return Err(CoreError::already_exists(
                format!("index in {collection}"),
                spec.name.clone(),
            ));
        }

        if spec.unique {
            let mut seen = HashMap::new();
            for (id, doc) in &data.docs {
                if let Some(key) = unique_key(spec, doc) {
                    if let Some(first) = seen.insert(key, *id) {
                        return Err(CoreError::already_exists(
                            collection,
                            format!("{} (documents {first} and {id})", spec.name),
                        ));
                    }
                }
            }
        }

        data.indexes.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn drop_index(&self, collection: &str, name: &str) -> CoreResult<bool> {
        let mut collections = self.collections.write();
        Ok(collections
            .get_mut(collection)
            .map_or(false, |data| data.indexes.remove(name).is_some()))
    }

    async fn list_collections(&self) -> CoreResult<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn drop_collection(&self, collection: &str) -> CoreResult<()> {
        self.collections.write().remove(collection);
        Ok(())
    }

    async fn collection_stats(&self, collection: &str) -> CoreResult<CollectionStats> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|data| CollectionStats {
                document_count: data.docs.len() as u64,
                size_bytes: data.docs.values().map(encoded_len).sum(),
            })
            .unwrap_or_default())
    }
}
