//! Helpers for the reserved fields the repository layer adds to stored documents.

use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::filter::ID_FIELD;
use crate::ids::DocumentId;
use crate::lock::LOCK_FIELD;
use crate::registry::DISCRIMINATOR_FIELD;

/// Fields owned by the repository layer, never by entity bodies.
pub const RESERVED_FIELDS: [&str; 3] = [ID_FIELD, LOCK_FIELD, DISCRIMINATOR_FIELD];

/// Turns an entity body into a storable document carrying `id`.
///
/// Reserved fields supplied by the body are discarded.
///
/// # Errors
///
/// Returns `ValidationError` when the body does not serialize to an object.
pub fn with_id(body: Value, id: DocumentId) -> CoreResult<Value> {
    let mut body = strip_reserved(body);
    let object = body.as_object_mut().ok_or_else(|| {
        CoreError::ValidationError("entities must serialize to a JSON object".into())
    })?;
    object.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    Ok(body)
}

/// Removes the reserved fields, leaving the entity body.
#[must_use]
pub fn strip_reserved(mut doc: Value) -> Value {
    if let Some(object) = doc.as_object_mut() {
        for field in RESERVED_FIELDS {
            object.remove(field);
        }
    }
    doc
}

/// Identifier stored in a document.
///
/// # Errors
///
/// Returns `DeserializationError` when `_id` is missing or not a UUID.
pub fn document_id(doc: &Value) -> CoreResult<DocumentId> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::DeserializationError("document has no `_id`".into()))?
        .parse()
        .map_err(|err: uuid::Error| CoreError::DeserializationError(err.to_string()))
}

/// Checks a collection name: 1 to 120 characters from `[A-Za-z0-9_.-]`.
///
/// # Errors
///
/// Returns `ValidationError` for anything else.
pub fn validate_collection_name(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 120
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::ValidationError(format!(
            "invalid collection name `{name}`"
        )))
    }
}

/// Approximate stored size of a document.
#[must_use]
pub fn encoded_len(doc: &Value) -> u64 {
    serde_json::to_vec(doc).map_or(0, |bytes| bytes.len() as u64)
}
