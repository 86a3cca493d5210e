use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{query, Row, SqlitePool};

use docrepo_core::document::validate_collection_name;
use docrepo_core::{
    CollectionStats, CoreError, CoreResult, DocumentId, DocumentStore, Filter, FindOptions,
    IndexDirection, IndexSpec, Update,
};

/// Compare-and-swap attempts before a contended write gives up.
const MAX_CAS_ATTEMPTS: usize = 64;

/// SQLite-backed document store.
///
/// Documents are JSON text rows keyed by `(collection, id)`. Filters are
/// evaluated in process; writes are guarded by the row `version`, so several
/// processes sharing one database file still see single-document atomicity.
/// Declared indexes become partial expression indexes over `json_extract`.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

struct StoredRow {
    id: String,
    body: Value,
    version: i64,
}

impl SqliteDocumentStore {
    /// Creates a store over a migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Loads candidate rows in id order; a filter pinning an id loads one row.
    async fn candidates(&self, collection: &str, filter: &Filter) -> CoreResult<Vec<StoredRow>> {
        let rows = match filter.id_hint() {
            Some(id) => {
                query("SELECT id, body, version FROM documents WHERE collection = ?1 AND id = ?2")
                    .bind(collection)
                    .bind(id.to_string())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                query(
                    "SELECT id, body, version FROM documents WHERE collection = ?1 ORDER BY id",
                )
                .bind(collection)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error(e, collection, ""))?;

        rows.iter().map(stored_row).collect()
    }

    async fn first_match(&self, collection: &str, filter: &Filter) -> CoreResult<Option<StoredRow>> {
        Ok(self
            .candidates(collection, filter)
            .await?
            .into_iter()
            .find(|row| filter.matches(&row.body)))
    }

    /// Deletes `row` if it is unchanged; reports whether it was removed.
    async fn delete_if_unchanged(&self, collection: &str, row: &StoredRow) -> CoreResult<bool> {
        let result = query("DELETE FROM documents WHERE collection = ?1 AND id = ?2 AND version = ?3")
            .bind(collection)
            .bind(&row.id)
            .bind(row.version)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, collection, &row.id))?;
        Ok(result.rows_affected() == 1)
    }
}

fn stored_row(row: &SqliteRow) -> CoreResult<StoredRow> {
    let body: String = row.try_get("body").map_err(|e| map_sqlx_error(e, "documents", ""))?;
    Ok(StoredRow {
        id: row.try_get("id").map_err(|e| map_sqlx_error(e, "documents", ""))?,
        body: serde_json::from_str(&body)?,
        version: row
            .try_get("version")
            .map_err(|e| map_sqlx_error(e, "documents", ""))?,
    })
}

/// Maps driver errors; UNIQUE violations become `AlreadyExists`.
pub(crate) fn map_sqlx_error(error: sqlx::Error, collection: &str, id: &str) -> CoreError {
    match &error {
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
            CoreError::already_exists(collection, id)
        }
        _ => CoreError::StorageError(error.to_string()),
    }
}

/// Name of the SQLite index backing `spec` in `collection`.
fn physical_index_name(collection: &str, index: &str) -> String {
    format!("\"docidx:{collection}:{index}\"")
}

fn create_index_sql(collection: &str, spec: &IndexSpec) -> String {
    let columns: Vec<String> = spec
        .keys
        .iter()
        .map(|key| {
            let order = match key.direction {
                IndexDirection::Descending => " DESC",
                IndexDirection::Ascending | IndexDirection::Hashed => "",
            };
            format!("json_extract(body, '$.{}'){order}", key.field)
        })
        .collect();

    format!(
        "CREATE {unique}INDEX {name} ON documents (collection, {columns}) WHERE collection = '{collection}'",
        unique = if spec.unique { "UNIQUE " } else { "" },
        name = physical_index_name(collection, &spec.name),
        columns = columns.join(", "),
    )
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_one(&self, collection: &str, id: DocumentId, doc: Value) -> CoreResult<()> {
        validate_collection_name(collection)?;
        let id = id.to_string();
        query("INSERT INTO documents (collection, id, body, version) VALUES (?1, ?2, ?3, 0)")
            .bind(collection)
            .bind(&id)
            .bind(serde_json::to_string(&doc)?)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, collection, &id))?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<(DocumentId, Value)>) -> CoreResult<()> {
        validate_collection_name(collection)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?;
        for (id, doc) in docs {
            let id = id.to_string();
            query("INSERT INTO documents (collection, id, body, version) VALUES (?1, ?2, ?3, 0)")
                .bind(collection)
                .bind(&id)
                .bind(serde_json::to_string(&doc)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(e, collection, &id))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?;
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> CoreResult<Option<Value>> {
        Ok(self
            .first_match(collection, filter)
            .await?
            .map(|row| row.body))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> CoreResult<Vec<Value>> {
        let matched = self
            .candidates(collection, filter)
            .await?
            .into_iter()
            .map(|row| row.body)
            .filter(|body| filter.matches(body))
            .collect();
        Ok(options.apply(matched))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> CoreResult<u64> {
        if *filter == Filter::All {
            let count: i64 = query("SELECT COUNT(*) FROM documents WHERE collection = ?1")
                .bind(collection)
                .fetch_one(&self.pool)
                .await
                .and_then(|row| row.try_get(0))
                .map_err(|e| map_sqlx_error(e, collection, ""))?;
            return Ok(count as u64);
        }
        Ok(self
            .candidates(collection, filter)
            .await?
            .iter()
            .filter(|row| filter.matches(&row.body))
            .count() as u64)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> CoreResult<Option<Value>> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(row) = self.first_match(collection, filter).await? else {
                return Ok(None);
            };

            let updated = update.apply(&row.body)?;
            let result = query(
                "UPDATE documents SET body = ?1, version = version + 1 \
                 WHERE collection = ?2 AND id = ?3 AND version = ?4",
            )
            .bind(serde_json::to_string(&updated)?)
            .bind(collection)
            .bind(&row.id)
            .bind(row.version)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, collection, &row.id))?;

            if result.rows_affected() == 1 {
                return Ok(Some(updated));
            }
            tracing::debug!(
                collection = %collection,
                id = %row.id,
                attempt,
                "Concurrent write detected, re-evaluating filter"
            );
        }

        Err(CoreError::StorageError(format!(
            "update in `{collection}` lost {MAX_CAS_ATTEMPTS} consecutive write races"
        )))
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> CoreResult<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(row) = self.first_match(collection, filter).await? else {
                return Ok(false);
            };
            if self.delete_if_unchanged(collection, &row).await? {
                return Ok(true);
            }
        }
        Err(CoreError::StorageError(format!(
            "delete in `{collection}` lost {MAX_CAS_ATTEMPTS} consecutive write races"
        )))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> CoreResult<u64> {
        if *filter == Filter::All {
            let result = query("DELETE FROM documents WHERE collection = ?1")
                .bind(collection)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(e, collection, ""))?;
            return Ok(result.rows_affected());
        }

        let mut removed = 0;
        for row in self.candidates(collection, filter).await? {
            if !filter.matches(&row.body) {
                continue;
            }
            if self.delete_if_unchanged(collection, &row).await? {
                removed += 1;
            } else {
                // Changed underneath us; it is deleted only if it still matches.
                let id: DocumentId = row
                    .id
                    .parse()
                    .map_err(|_| CoreError::internal(format!("stored id `{}` is not a UUID", row.id)))?;
                if self
                    .delete_one(collection, &Filter::Id(id).and(filter.clone()))
                    .await?
                {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn list_indexes(&self, collection: &str) -> CoreResult<Vec<IndexSpec>> {
        let rows = query("SELECT spec FROM document_indexes WHERE collection = ?1 ORDER BY name")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?;

        rows.iter()
            .map(|row| {
                let spec: String = row
                    .try_get("spec")
                    .map_err(|e| map_sqlx_error(e, collection, ""))?;
                Ok(serde_json::from_str(&spec)?)
            })
            .collect()
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> CoreResult<()> {
        validate_collection_name(collection)?;
        spec.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, collection, &spec.name))?;

        query(
            "INSERT INTO document_indexes (collection, name, spec, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(collection)
        .bind(&spec.name)
        .bind(serde_json::to_string(spec)?)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(e, &format!("index in {collection}"), &spec.name))?;

        query(&create_index_sql(collection, spec))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, collection, &spec.name))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, collection, &spec.name))?;
        Ok(())
    }

    async fn drop_index(&self, collection: &str, name: &str) -> CoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, collection, name))?;

        let removed = query("DELETE FROM document_indexes WHERE collection = ?1 AND name = ?2")
            .bind(collection)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, collection, name))?
            .rows_affected()
            == 1;

        if removed {
            query(&format!(
                "DROP INDEX IF EXISTS {}",
                physical_index_name(collection, name)
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, collection, name))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, collection, name))?;
        Ok(removed)
    }

    async fn list_collections(&self) -> CoreResult<Vec<String>> {
        let rows = query(
            "SELECT collection FROM documents UNION SELECT collection FROM document_indexes ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "documents", ""))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>(0)
                    .map_err(|e| map_sqlx_error(e, "documents", ""))
            })
            .collect()
    }

    async fn drop_collection(&self, collection: &str) -> CoreResult<()> {
        validate_collection_name(collection)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?;

        let names: Vec<String> = query("SELECT name FROM document_indexes WHERE collection = ?1")
            .bind(collection)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?
            .iter()
            .map(|row| row.try_get("name"))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(e, collection, ""))?;

        for name in &names {
            query(&format!(
                "DROP INDEX IF EXISTS {}",
                physical_index_name(collection, name)
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, collection, name))?;
        }
        query("DELETE FROM document_indexes WHERE collection = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?;
        query("DELETE FROM documents WHERE collection = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(e, collection, ""))?;
        tracing::info!(collection = %collection, indexes = names.len(), "Dropped collection");
        Ok(())
    }

    async fn collection_stats(&self, collection: &str) -> CoreResult<CollectionStats> {
        let row = query(
            "SELECT COUNT(*) AS n, COALESCE(SUM(LENGTH(CAST(body AS BLOB))), 0) AS bytes \
             FROM documents WHERE collection = ?1",
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, collection, ""))?;

        let count: i64 = row.try_get("n").map_err(|e| map_sqlx_error(e, collection, ""))?;
        let bytes: i64 = row
            .try_get("bytes")
            .map_err(|e| map_sqlx_error(e, collection, ""))?;
        Ok(CollectionStats {
            document_count: count as u64,
            size_bytes: bytes as u64,
        })
    }
}
