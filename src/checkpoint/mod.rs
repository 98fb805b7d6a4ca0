//! Checkpoint and event store (spec.md §3, §4.2): the single source of
//! truth shared across independently scheduled handler invocations.

pub mod format;
pub mod schema;
pub mod store;

pub use schema::{
    Axis, Chain, ChainState, Ladder, LadderMode, Level, Outcome, OutcomeCounts, Round,
    RoundState, TaskRecord, TerminalState,
};
pub use store::{round_is_unresolved, CheckpointStore};
