//! Durable state store for the hydra orchestrator.
//!
//! SQLite is the journal: jobs, forks, the spend ledger, and janitor state
//! are rows, and every fork step transition is persisted before the step
//! executes, so a restarted worker resumes exactly where it left off.

pub mod config;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
