//! Core orchestration logic: the sandbox provider seam, retryable
//! activities, the three durable workflows (orchestration, fork, janitor),
//! and the worker runtime that hosts them.

pub mod activities;
pub mod metrics;
pub mod provider;
pub mod retry;
pub mod worker;
pub mod workflow;
