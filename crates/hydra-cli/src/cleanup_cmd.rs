//! `hydra cleanup` / `stop-cleanup` commands: arm and disarm the janitor.

use anyhow::Result;
use console::style;
use sqlx::SqlitePool;

use hydra_db::queries::janitor as janitor_db;

/// Arm the janitor. Warns (exit 0) when it is already running.
pub async fn run_cleanup(pool: &SqlitePool, interval: i64, max_age: i64) -> Result<()> {
    println!();
    println!("{}", style("Starting cleanup workflow").bold().blue());
    println!("  Interval: {interval} minutes");
    println!("  Max age: {max_age} minutes");
    println!();

    if janitor_db::arm(pool, interval, max_age).await? {
        println!("{}", style("Cleanup workflow started").green());
        println!("It runs on the worker until stopped with `hydra stop-cleanup`.");
    } else {
        println!("{}", style("Cleanup workflow already running").yellow());
    }

    Ok(())
}

/// Request the janitor stop after its current scan.
pub async fn run_stop_cleanup(pool: &SqlitePool) -> Result<()> {
    janitor_db::request_stop(pool).await?;
    println!("{}", style("Cleanup workflow stop signal sent").yellow());
    Ok(())
}
