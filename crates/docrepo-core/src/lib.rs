//! Core domain types and traits for the docrepo repository layer.

pub mod config;
pub mod document;
pub mod error;
pub mod filter;
pub mod ids;
pub mod index;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod strata;
pub mod traits;

pub use config::{
    BufferConfig, CompressionConfig, IndexConfig, IndexReconcileMode, LockConfig, LoggingConfig,
    RepoConfig, RetryConfig, StoreConfig, StoreScheme,
};
pub use error::{CoreError, CoreResult};
pub use filter::{FindOptions, Filter, SortOrder, Update, ID_FIELD};
pub use ids::{DocumentId, LockToken};
pub use index::{diff_indexes, IndexDirection, IndexKey, IndexModel, IndexSpec};
pub use lock::{LockErrorInfo, LockInfo, LockState, LOCK_FIELD};
pub use logging::init_tracing;
pub use metrics::export_metrics;
pub use registry::{DecodedDocument, TypeRegistry, TypeRegistryBuilder, DISCRIMINATOR_FIELD};
pub use strata::{get_age, get_age_at, get_strata, get_strata_at, Granularity, Strata};
pub use traits::{CollectionStats, DocumentStore};
