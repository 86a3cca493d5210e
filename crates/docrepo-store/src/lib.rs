//! Document store backends for docrepo.

mod memory;
mod sqlite;
mod util;

pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;
pub use util::{create_sqlite_pool, open_store, run_migrations};

/// Embedded SQL migrations for the SQLite document store.
pub const MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
