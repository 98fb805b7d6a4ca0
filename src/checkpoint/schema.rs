//! Data model — Chain, Ladder, Round, Task record (spec.md §3).
//!
//! Plain structs, no derived serde: the checkpoint has its own line-oriented
//! codec (see `format.rs`) because this is the one document in the crate
//! that must survive hand-editing without losing argument whitespace.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::index::IndexSet;

/// Scheduler-reported terminal state for one task, per spec.md §6's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalState {
    Completed,
    OutOfMemory,
    Timeout,
    Failed,
    Cancelled,
    NodeFail,
    Preempted,
    BootFail,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Timeout => "TIMEOUT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::NodeFail => "NODE_FAIL",
            Self::Preempted => "PREEMPTED",
            Self::BootFail => "BOOT_FAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "COMPLETED" => Self::Completed,
            "OUT_OF_MEMORY" => Self::OutOfMemory,
            "TIMEOUT" => Self::Timeout,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            "NODE_FAIL" => Self::NodeFail,
            "PREEMPTED" => Self::Preempted,
            "BOOT_FAIL" => Self::BootFail,
            _ => return None,
        })
    }
}

/// The four disjoint outcome classes produced by the outcome classifier
/// (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Oom,
    Timeout,
    Other,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Oom => "oom",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

/// One rung of the escalation ladder: `{partition-set, memory, wall-time}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub partitions: Vec<String>,
    pub memory: String,
    pub wall_time: String,
}

/// Which resource axis a round's escalation advanced, in independent-axes
/// mode. `None` in levels mode, where a round never distinguishes axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Memory,
    Time,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "MEMORY",
            Self::Time => "TIME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MEMORY" => Some(Self::Memory),
            "TIME" => Some(Self::Time),
            _ => None,
        }
    }
}

/// Selected once at chain creation, fixed for its lifetime (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderMode {
    /// A single ladder; both OOM and timeout advance the same level.
    Levels,
    /// Separate memory and time ladders, escalated independently.
    IndependentAxes,
}

impl LadderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Levels => "LEVELS",
            Self::IndependentAxes => "INDEPENDENT_AXES",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LEVELS" => Some(Self::Levels),
            "INDEPENDENT_AXES" => Some(Self::IndependentAxes),
            _ => None,
        }
    }
}

/// The ordered escalation ladder, fixed at chain creation and copied into
/// the checkpoint (spec.md §3). In independent-axes mode `memory_levels`
/// and `time_levels` are both populated and `levels` is empty, and vice
/// versa in levels mode.
#[derive(Debug, Clone)]
pub struct Ladder {
    pub mode: LadderMode,
    pub levels: Vec<Level>,
    pub memory_levels: Vec<Level>,
    pub time_levels: Vec<Level>,
}

impl Ladder {
    pub fn levels_mode(levels: Vec<Level>) -> Self {
        Self {
            mode: LadderMode::Levels,
            levels,
            memory_levels: Vec::new(),
            time_levels: Vec::new(),
        }
    }

    pub fn independent_axes(memory_levels: Vec<Level>, time_levels: Vec<Level>) -> Self {
        Self {
            mode: LadderMode::IndependentAxes,
            levels: Vec::new(),
            memory_levels,
            time_levels,
        }
    }

    pub fn max_level(&self, axis: Option<Axis>) -> usize {
        match (self.mode, axis) {
            (LadderMode::Levels, _) => self.levels.len().saturating_sub(1),
            (LadderMode::IndependentAxes, Some(Axis::Memory)) => {
                self.memory_levels.len().saturating_sub(1)
            }
            (LadderMode::IndependentAxes, Some(Axis::Time)) => {
                self.time_levels.len().saturating_sub(1)
            }
            (LadderMode::IndependentAxes, None) => 0,
        }
    }

    pub fn level(&self, axis: Option<Axis>, index: usize) -> Option<&Level> {
        match (self.mode, axis) {
            (LadderMode::Levels, _) => self.levels.get(index),
            (LadderMode::IndependentAxes, Some(Axis::Memory)) => self.memory_levels.get(index),
            (LadderMode::IndependentAxes, Some(Axis::Time)) => self.time_levels.get(index),
            (LadderMode::IndependentAxes, None) => None,
        }
    }
}

/// Terminal lifecycle states of a chain (spec.md §3). Carries the data each
/// terminal variant needs so the checkpoint is self-describing without a
/// separate "residual" side table.
#[derive(Debug, Clone)]
pub enum ChainState {
    Running,
    Completed { completed_count: u32 },
    /// Top of the ladder reached with retryable failures still outstanding.
    FailedAtMax {
        oom_residual: IndexSet,
        timeout_residual: IndexSet,
    },
    /// A scheduler-fatal error or control-plane timeout killed the chain.
    FailedNotRetried { reason: String },
}

impl ChainState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed { .. } => "COMPLETED",
            Self::FailedAtMax { .. } => "FAILED_AT_MAX",
            Self::FailedNotRetried { .. } => "FAILED_NOT_RETRIED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// The top-level unit: one user submission and all its retry rounds.
#[derive(Debug, Clone)]
pub struct Chain {
    pub chain_id: String,
    pub script: PathBuf,
    pub script_args: Vec<String>,
    pub full_index_set: IndexSet,
    pub ladder: Ladder,
    pub created_at: DateTime<Utc>,
    pub state: ChainState,
}

/// Lifecycle states of one round (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Pending,
    Running,
    Escalating,
    Completed,
    TerminalFail,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Escalating => "ESCALATING",
            Self::Completed => "COMPLETED",
            Self::TerminalFail => "TERMINAL_FAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "ESCALATING" => Self::Escalating,
            "COMPLETED" => Self::Completed,
            "TERMINAL_FAIL" => Self::TerminalFail,
            _ => return None,
        })
    }
}

/// Per-outcome counts for a resolved round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub completed: u32,
    pub oom: u32,
    pub timeout: u32,
    pub other: u32,
}

/// Per (round, task-index) terminal record. Created when the round
/// resolves; never mutated afterward (spec.md §3).
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub index: u64,
    pub terminal_state: TerminalState,
    pub exit_code: i32,
    pub elapsed_sec: u64,
    pub node: Option<String>,
    pub peak_memory_kb: Option<u64>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

/// One submission attempt at a given ladder level for a subset of indices.
#[derive(Debug, Clone)]
pub struct Round {
    pub round_no: u32,
    pub level_index: usize,
    pub axis: Option<Axis>,
    pub memory: String,
    pub wall_time: String,
    pub partitions: Vec<String>,
    pub array_spec: String,
    pub index_set: IndexSet,
    pub job_ids: Vec<String>,
    pub handler_job_id: Option<String>,
    pub watcher_job_id: Option<String>,
    pub state: RoundState,
    pub counts: OutcomeCounts,
    pub tasks: Vec<TaskRecord>,
}

impl Round {
    /// A fresh round with no jobs submitted yet, as created by
    /// `checkpoint::store::append_round` before the gateway call — the
    /// shape a crash-recovered reader must find idempotently resumable.
    pub fn pending(
        round_no: u32,
        level_index: usize,
        axis: Option<Axis>,
        level: &Level,
        index_set: IndexSet,
        array_spec: String,
    ) -> Self {
        Self {
            round_no,
            level_index,
            axis,
            memory: level.memory.clone(),
            wall_time: level.wall_time.clone(),
            partitions: level.partitions.clone(),
            array_spec,
            index_set,
            job_ids: Vec::new(),
            handler_job_id: None,
            watcher_job_id: None,
            state: RoundState::Pending,
            counts: OutcomeCounts::default(),
            tasks: Vec::new(),
        }
    }
}
