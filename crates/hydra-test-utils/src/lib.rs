//! Shared test utilities for hydra integration tests.
//!
//! Each test gets its own private in-memory SQLite database with migrations
//! applied. The pool is capped at a single connection because every pooled
//! connection would otherwise open a distinct `:memory:` database.
//! In-memory stores vanish when the pool is dropped, so no teardown is
//! needed beyond closing the pool.

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use hydra_db::pool;

/// Create a fresh in-memory database with migrations applied.
pub async fn create_test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("valid in-memory URL")
        .foreign_keys(true);

    let test_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .expect("failed to open in-memory database");

    pool::run_migrations(&test_pool)
        .await
        .expect("migrations should succeed");

    test_pool
}
