//! Outcome classifier (spec.md §4.3).
//!
//! A pure function of `(job records, overrides)` — no global config lookup
//! — so the engine can pass in the chain's own config snapshot rather than
//! reading live state at classification time.

use std::collections::HashMap;

use crate::checkpoint::schema::{Outcome, TerminalState};
use crate::index::IndexSet;

/// SIGKILL exit code used by the memory cgroup to kill an OOM task. Not
/// every scheduler reports `OUT_OF_MEMORY` as the terminal state, so exit
/// code 137 is treated as an independent signal (spec.md §4.3 rule 2).
const SIGKILL_OOM_EXIT_CODE: i32 = 137;

/// Per-chain override map supplied at chain creation (spec.md §6's
/// `state_handling` / `exit_codes` config keys). Checked before the default
/// rules; anything absent here falls through to the defaults.
#[derive(Debug, Clone, Default)]
pub struct ClassifyOverrides {
    pub by_terminal_state: HashMap<TerminalState, Outcome>,
    pub by_exit_code: HashMap<i32, Outcome>,
}

impl ClassifyOverrides {
    pub fn none() -> Self {
        Self::default()
    }
}

/// One task's raw accounting record as returned by the scheduler gateway's
/// `classify` call (spec.md §4.5: "one record per task: state, exit code,
/// elapsed, node, peak memory"). Only `terminal_state` and `exit_code` feed
/// the classification rules below; the rest travels through unexamined so
/// the engine can persist a complete `TaskRecord` without a second round
/// trip to the gateway.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub index: u64,
    pub terminal_state: TerminalState,
    pub exit_code: i32,
    pub elapsed_sec: u64,
    pub node: Option<String>,
    pub peak_memory_kb: Option<u64>,
}

impl TaskOutcome {
    /// Construct from just the classification-relevant fields, for tests
    /// and call sites that don't have accounting metrics handy.
    pub fn minimal(index: u64, terminal_state: TerminalState, exit_code: i32) -> Self {
        Self {
            index,
            terminal_state,
            exit_code,
            elapsed_sec: 0,
            node: None,
            peak_memory_kb: None,
        }
    }
}

/// The four disjoint outcome sets for one round's resolution
/// (spec.md §8 property 5).
#[derive(Debug, Clone, Default)]
pub struct RoundClassification {
    pub completed: IndexSet,
    pub oom: IndexSet,
    pub timeout: IndexSet,
    pub other: IndexSet,
}

impl RoundClassification {
    /// The retry set `R = oom ∪ timeout` (spec.md §4.4 step 3).
    pub fn retry_set(&self) -> IndexSet {
        self.oom.union(&self.timeout).copied().collect()
    }
}

fn classify_one(task: &TaskOutcome, overrides: &ClassifyOverrides) -> Outcome {
    if let Some(outcome) = overrides.by_exit_code.get(&task.exit_code) {
        return *outcome;
    }
    if let Some(outcome) = overrides.by_terminal_state.get(&task.terminal_state) {
        return *outcome;
    }

    match task.terminal_state {
        TerminalState::Completed if task.exit_code == 0 => Outcome::Completed,
        TerminalState::OutOfMemory => Outcome::Oom,
        _ if task.exit_code == SIGKILL_OOM_EXIT_CODE => Outcome::Oom,
        TerminalState::Timeout => Outcome::Timeout,
        _ => Outcome::Other,
    }
}

/// Classify every task record of a just-resolved round into the four
/// disjoint outcome sets.
pub fn classify_round(
    tasks: &[TaskOutcome],
    overrides: &ClassifyOverrides,
) -> RoundClassification {
    let mut result = RoundClassification::default();
    for task in tasks {
        match classify_one(task, overrides) {
            Outcome::Completed => result.completed.insert(task.index),
            Outcome::Oom => result.oom.insert(task.index),
            Outcome::Timeout => result.timeout.insert(task.index),
            Outcome::Other => result.other.insert(task.index),
        };
    }
    result
}
