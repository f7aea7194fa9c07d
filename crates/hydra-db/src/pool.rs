use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use crate::config::DbConfig;
use crate::migrations;

/// Create a connection pool with sensible defaults.
///
/// The database file (and its parent directory) is created if missing; WAL
/// journaling keeps concurrent worker/CLI access cheap.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    ensure_parent_dir(&config.database_url)?;

    let options = SqliteConnectOptions::from_str(&config.database_url)
        .with_context(|| format!("invalid database URL: {}", config.database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| {
            format!("failed to open database at {}", config.database_url)
        })?;

    Ok(pool)
}

/// Apply all pending embedded migrations to the pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let applied = migrations::apply_pending(pool).await?;
    if applied > 0 {
        info!(applied, "migrations applied");
    }
    Ok(())
}

/// Create the parent directory for a file-backed database URL.
fn ensure_parent_dir(database_url: &str) -> Result<()> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if path == ":memory:" || path.is_empty() || path.starts_with(':') {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_pool_creates_parent_directory_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("hydra.db");
        let config = DbConfig::new(db_path.to_string_lossy().into_owned());

        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();

        // Migrations are idempotent.
        run_migrations(&pool).await.unwrap();
        pool.close().await;

        assert!(db_path.exists());
    }
}
