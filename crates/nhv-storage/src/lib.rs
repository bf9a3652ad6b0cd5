//! Persistence and fetch plumbing for the news harvester.
//!
//! `items` holds the conflict-safe bulk upsert, `repository` the generic typed
//! lookups, and `fetch` the HTTP client used to pull listing pages.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

pub mod fetch;
pub mod filter;
pub mod items;
pub mod repository;

pub use fetch::{
    BackoffPolicy, FetchError, FetchedPage, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
pub use filter::{Column, Filter, FilterValue};
pub use items::{
    ItemColumn, ItemStore, MemoryItemStore, PgItemStore, StoredItem, UpsertOutcome,
    MAX_ROWS_PER_STATEMENT,
};
pub use repository::{Entity, PgRepository};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("item at position {index} has an empty url")]
    MissingUrl { index: usize },
    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, PersistenceError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the bundled schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), PersistenceError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
