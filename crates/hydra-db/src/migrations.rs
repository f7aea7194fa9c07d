//! Embedded schema migrations.
//!
//! Migrations ship inside the binary so a fresh store can be initialized
//! anywhere the worker or CLI runs, without a migrations directory on disk.
//! Applied versions are tracked in `schema_migrations`.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// A single versioned migration.
struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema: jobs, forks, spend_ledger, janitor",
    sql: r"
    CREATE TABLE jobs (
        id                      TEXT PRIMARY KEY,
        task_queue              TEXT NOT NULL,
        status                  TEXT NOT NULL DEFAULT 'queued',
        repo_url                TEXT NOT NULL,
        branch                  TEXT NOT NULL,
        prompt                  TEXT NOT NULL,
        num_forks               INTEGER NOT NULL,
        model                   TEXT NOT NULL,
        max_concurrent          INTEGER NOT NULL,
        fork_timeout_seconds    INTEGER NOT NULL,
        budget_limit_usd        REAL,
        template                TEXT NOT NULL,
        sandbox_timeout_seconds INTEGER NOT NULL,
        paused                  INTEGER NOT NULL DEFAULT 0,
        cancelled               INTEGER NOT NULL DEFAULT 0,
        successful              INTEGER NOT NULL DEFAULT 0,
        failed_forks            INTEGER NOT NULL DEFAULT 0,
        total_cost_usd          REAL NOT NULL DEFAULT 0,
        total_duration_seconds  REAL,
        error                   TEXT,
        created_at              TEXT NOT NULL,
        started_at              TEXT,
        completed_at            TEXT
    );

    CREATE INDEX idx_jobs_queue_status ON jobs (task_queue, status);

    CREATE TABLE forks (
        job_id            TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        fork_num          INTEGER NOT NULL,
        workflow_id       TEXT NOT NULL,
        fork_branch       TEXT NOT NULL,
        status            TEXT NOT NULL DEFAULT 'pending',
        step              TEXT NOT NULL DEFAULT 'admission',
        attempt           INTEGER NOT NULL DEFAULT 0,
        cancel_requested  INTEGER NOT NULL DEFAULT 0,
        sandbox_id        TEXT,
        cost_usd          REAL NOT NULL DEFAULT 0,
        input_tokens      INTEGER NOT NULL DEFAULT 0,
        output_tokens     INTEGER NOT NULL DEFAULT 0,
        duration_seconds  REAL NOT NULL DEFAULT 0,
        output            TEXT,
        error             TEXT,
        heartbeat_at      TEXT,
        heartbeat_payload TEXT,
        started_at        TEXT,
        completed_at      TEXT,
        PRIMARY KEY (job_id, fork_num)
    );

    CREATE UNIQUE INDEX idx_forks_workflow_id ON forks (workflow_id);

    CREATE TABLE spend_ledger (
        workflow_id TEXT NOT NULL,
        fork_num    INTEGER NOT NULL,
        cost_usd    REAL NOT NULL,
        updated_at  TEXT NOT NULL,
        PRIMARY KEY (workflow_id, fork_num)
    );

    CREATE TABLE janitor (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        interval_minutes INTEGER NOT NULL DEFAULT 15,
        max_age_minutes  INTEGER NOT NULL DEFAULT 180,
        running          INTEGER NOT NULL DEFAULT 0,
        stop_requested   INTEGER NOT NULL DEFAULT 0,
        total_cleaned    INTEGER NOT NULL DEFAULT 0,
        last_cleanup_at  TEXT,
        started_at       TEXT
    );

    INSERT INTO janitor (id) VALUES (1);
    ",
}];

/// Apply all migrations newer than the current schema version.
///
/// Returns the number of migrations applied.
pub async fn apply_pending(pool: &SqlitePool) -> Result<usize> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT,
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await
    .context("failed to create schema_migrations table")?;

    let current: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
            .fetch_one(pool)
            .await
            .context("failed to read schema version")?;

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        sqlx::raw_sql(migration.sql)
            .execute(pool)
            .await
            .with_context(|| format!("migration {} failed", migration.version))?;

        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(pool)
            .await
            .with_context(|| format!("failed to record migration {}", migration.version))?;

        applied += 1;
    }

    Ok(applied)
}
