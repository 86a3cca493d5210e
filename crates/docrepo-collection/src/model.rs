use serde::{Deserialize, Serialize};

use docrepo_core::IndexModel;

use crate::collection::CollectionFlavor;

/// Identity of a collection instance, for logs and operator tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFingerprint {
    pub collection_name: String,
    /// Rust type name of the entity.
    pub entity_type: String,
    pub flavor: CollectionFlavor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    /// Store backend, e.g. `sqlite`.
    pub backend: String,
}

/// Point-in-time description of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionModel {
    pub fingerprint: CollectionFingerprint,
    pub document_count: u64,
    pub size_bytes: u64,
    /// Operations served by this instance since creation.
    pub access_count: u64,
    pub indexes: Vec<IndexModel>,
    /// True when declared and stored indexes agree.
    pub index_healthy: bool,
}
