//! # Co-Scientist Core
//!
//! The task scheduling and coordination substrate of a multi-agent AI
//! co-scientist. The crate drives every agent in the system through three
//! tightly coupled subsystems:
//!
//! - **Task queue**: three FIFO priority bands with per-band quotas,
//!   overflow displacement, starvation boosting, worker leases with
//!   acknowledgement deadlines, retry policy and a dead-letter queue.
//! - **Durable state**: an atomic JSON snapshot of the whole queue plus an
//!   iteration-scoped, versioned context memory with checkpoints and
//!   archival.
//! - **Supervisor**: weighted agent-role selection, a task factory,
//!   resource budgeting and termination evaluation.
//!
//! Agent bodies (hypothesis generation, reflection, ranking, ...) live
//! outside this crate; they consume the queue through worker registration,
//! dequeue/acknowledge/complete and heartbeats.

/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Context memory: iterations, checkpoints, aggregates
pub mod memory;
/// Core data models
pub mod models;
/// Priority task queue, worker registry, leases, persistence
pub mod queue;
/// Supervisor: weighted scheduling, resources, termination
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use error::{CoScientistError, Result};
