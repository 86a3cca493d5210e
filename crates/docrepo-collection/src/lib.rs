//! Typed repositories over a [`DocumentStore`](docrepo_core::DocumentStore).
//!
//! A [`Collection`] binds an [`Entity`] type to one store collection and runs
//! with one of three flavors: plain disk access, a write buffer, or lease-based
//! entity locking through [`EntityScope`]. Declared indexes are reconciled on
//! [`Collection::init`], and [`Compressible`] entities can be folded by age.

mod buffer;
mod collection;
mod compression;
mod entity;
mod lockable;
mod model;
mod reconciler;
mod scope;

pub use buffer::FlushTrigger;
pub use collection::{Collection, CollectionFlavor, CollectionOptions};
pub use compression::{Compressible, CompressionReport, CompressionWorker};
pub use entity::Entity;
pub use model::{CollectionFingerprint, CollectionModel};
pub use reconciler::{IndexAction, IndexReconciler};
pub use scope::{EntityScope, ScopeState};
