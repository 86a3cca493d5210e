use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use docrepo_core::document::{strip_reserved, with_id};
use docrepo_core::registry::tag;
use docrepo_core::{CoreResult, DocumentId, IndexSpec};

/// A type stored as one document per instance.
///
/// The body is the serde representation of the type; `_id`, `_lock` and `_t`
/// are managed by the collection and never appear in it.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier of this instance.
    fn id(&self) -> DocumentId;

    /// Indexes the collection should carry for this type.
    fn declared_indexes() -> Vec<IndexSpec> {
        Vec::new()
    }
}

pub(crate) fn encode<T: Entity>(entity: &T, discriminator: Option<&str>) -> CoreResult<Value> {
    let mut doc = with_id(serde_json::to_value(entity)?, entity.id())?;
    if let Some(discriminator) = discriminator {
        tag(&mut doc, discriminator)?;
    }
    Ok(doc)
}

pub(crate) fn decode<T: Entity>(doc: Value) -> CoreResult<T> {
    Ok(serde_json::from_value(strip_reserved(doc))?)
}
