//! Resource-escalation orchestrator for Slurm-class batch schedulers.
//!
//! A chain is one user submission: an index set of array-task indices and a
//! script to run. When tasks in a round fail with a retryable cause (out of
//! memory, wall-time timeout), the engine escalates the failing subset to
//! the next rung of a configured resource ladder and resubmits, repeating
//! until every index completes or the ladder is exhausted. The checkpoint
//! store is the durable source of truth across the independently-scheduled
//! handler invocations that drive this state machine forward.
//!
//! # Modules
//!
//! - [`index`]: range-stride codec compressing sparse task-index sets into
//!   Slurm-style array specs, plus batching under a length budget.
//! - [`checkpoint`]: the data model and line-oriented on-disk checkpoint
//!   format, with atomic-rename durability.
//! - [`classify`]: maps raw per-task scheduler records to the outcome
//!   classes the engine escalates on.
//! - [`engine`]: the escalation state machine itself.
//! - [`gateway`]: the scheduler abstraction (`SchedulerGateway`) and its
//!   Slurm CLI implementation.
//! - [`driver`]: chain lifecycle operations exposed to the CLI (bootstrap,
//!   status, list).
//! - [`eventlog`]: append-only human-readable timeline of chain events.
//! - [`relational`]: optional SQL mirror of checkpoint state, feature-gated.
//! - [`config`]: YAML configuration loading.
//! - [`error`]: the crate's error taxonomy and CLI exit code mapping.

#![allow(clippy::too_many_arguments)]

pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod eventlog;
pub mod gateway;
pub mod index;
pub mod relational;

pub use error::{EscalateError, EscalateResult};
