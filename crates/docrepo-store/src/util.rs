use std::sync::Arc;

use sqlx::migrate::MigrateError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use docrepo_core::{CoreError, CoreResult, DocumentStore, StoreConfig, StoreScheme};

use crate::{MemoryDocumentStore, SqliteDocumentStore, MIGRATOR};

/// Creates a SQLite connection pool configured for document workloads.
///
/// In-memory databases are private to their connection, so they get a single
/// connection that is never recycled.
pub async fn create_sqlite_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");
    let options = database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(if in_memory {
            SqliteJournalMode::Memory
        } else {
            SqliteJournalMode::Wal
        })
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections.max(1))
    };
    pool_options.connect_with(options).await
}

/// Runs all outstanding migrations against the provided connection pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Opens the store named by `config.url`, running migrations for SQLite.
///
/// # Errors
///
/// Returns `Config` when the URL names no supported backend and
/// `StorageError` when the database cannot be opened or migrated.
pub async fn open_store(config: &StoreConfig) -> CoreResult<Arc<dyn DocumentStore>> {
    match config.scheme() {
        Some(StoreScheme::Memory) => {
            tracing::info!("Opened in-memory document store");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
        Some(StoreScheme::Sqlite) => {
            let pool = create_sqlite_pool(&config.url, config.max_connections)
                .await
                .map_err(|e| CoreError::StorageError(format!("failed to open `{}`: {e}", config.url)))?;
            run_migrations(&pool)
                .await
                .map_err(|e| CoreError::StorageError(format!("migration failed: {e}")))?;
            tracing::info!(
                url = %config.url,
                max_connections = config.max_connections,
                "Opened SQLite document store"
            );
            Ok(Arc::new(SqliteDocumentStore::new(pool)))
        }
        None => Err(CoreError::Config(format!(
            "unsupported store url `{}` (expected `memory://` or `sqlite://<path>`)",
            config.url
        ))),
    }
}
