//! Configuration (spec.md §6): `levels` / `max_array_spec_len` /
//! `sacct_settle_delay_sec` / `handler_budget_sec` / `state_handling` /
//! `exit_codes` / `logging.*`.
//!
//! Loaded from a YAML document via `serde_yaml`, following the teacher's
//! `SlurmConfig::default()` pattern: every key optional, sensible defaults,
//! a handful of settings additionally overridable by environment variable
//! for quick operator tuning without editing the checked-in file.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::checkpoint::schema::{Axis, Ladder, Level, Outcome, TerminalState};
use crate::classify::ClassifyOverrides;
use crate::error::{EscalateError, EscalateResult};

#[derive(Debug, Clone, Deserialize)]
struct LevelDoc {
    #[serde(rename = "partition")]
    partitions: PartitionField,
    mem: String,
    time: String,
}

/// Accepts either a YAML list or a comma-separated string for `partition`,
/// since operators hand-edit this file as often as they generate it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PartitionField {
    List(Vec<String>),
    Csv(String),
}

impl PartitionField {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(v) => v,
            Self::Csv(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
        }
    }
}

impl From<LevelDoc> for Level {
    fn from(doc: LevelDoc) -> Self {
        Level {
            partitions: doc.partitions.into_vec(),
            memory: doc.mem,
            wall_time: doc.time,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LoggingDoc {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    db_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigDoc {
    #[serde(default)]
    levels: Vec<LevelDoc>,
    #[serde(default)]
    memory_levels: Vec<LevelDoc>,
    #[serde(default)]
    time_levels: Vec<LevelDoc>,
    #[serde(default)]
    max_array_spec_len: Option<usize>,
    #[serde(default)]
    sacct_settle_delay_sec: Option<u64>,
    #[serde(default)]
    handler_budget_sec: Option<u64>,
    #[serde(default)]
    state_handling: HashMap<String, String>,
    #[serde(default)]
    exit_codes: HashMap<i32, String>,
    #[serde(default)]
    logging: LoggingDoc,
}

const DEFAULT_MAX_ARRAY_SPEC_LEN: usize = 10_000;
const DEFAULT_SACCT_SETTLE_DELAY_SEC: u64 = 2;
const DEFAULT_HANDLER_BUDGET_SEC: u64 = 600;

/// Fully-resolved configuration, env-overridable for the handful of keys
/// noted on each field.
#[derive(Debug, Clone)]
pub struct Config {
    pub ladder: Ladder,
    pub max_array_spec_len: usize,
    pub sacct_settle_delay_sec: u64,
    /// Generous fixed budget a single handler invocation (classification
    /// plus submission) is allowed before it is itself considered a
    /// `TIMEOUT` of the chain's control plane (spec.md §5). Env override
    /// `ESCALATE_HANDLER_BUDGET_SEC`.
    pub handler_budget_sec: u64,
    pub classify_overrides: ClassifyOverrides,
    pub logging_enabled: bool,
    pub logging_db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ladder: Ladder::levels_mode(Vec::new()),
            max_array_spec_len: DEFAULT_MAX_ARRAY_SPEC_LEN,
            sacct_settle_delay_sec: env_override_u64(
                "ESCALATE_SETTLE_DELAY_SEC",
                DEFAULT_SACCT_SETTLE_DELAY_SEC,
            ),
            handler_budget_sec: env_override_u64(
                "ESCALATE_HANDLER_BUDGET_SEC",
                DEFAULT_HANDLER_BUDGET_SEC,
            ),
            classify_overrides: ClassifyOverrides::none(),
            logging_enabled: false,
            logging_db_path: None,
        }
    }
}

fn env_override_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load from a YAML file. Missing optional keys fall back to the
    /// `Default` values above; env vars layer on top of document values.
    pub fn load(path: &Path) -> EscalateResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    fn from_yaml_str(text: &str) -> EscalateResult<Self> {
        let doc: ConfigDoc = serde_yaml::from_str(text)
            .map_err(|e| EscalateError::UserInput(format!("malformed config: {e}")))?;

        let ladder = if !doc.memory_levels.is_empty() || !doc.time_levels.is_empty() {
            if !doc.levels.is_empty() {
                return Err(EscalateError::UserInput(
                    "config specifies both `levels` and axis-specific levels; pick one mode"
                        .to_string(),
                ));
            }
            Ladder::independent_axes(
                doc.memory_levels.into_iter().map(Level::from).collect(),
                doc.time_levels.into_iter().map(Level::from).collect(),
            )
        } else {
            Ladder::levels_mode(doc.levels.into_iter().map(Level::from).collect())
        };

        let mut classify_overrides = ClassifyOverrides::none();
        for (state_name, action) in &doc.state_handling {
            let state = TerminalState::parse(state_name).ok_or_else(|| {
                EscalateError::UserInput(format!(
                    "unknown terminal state in state_handling: {state_name:?}"
                ))
            })?;
            if let Some(outcome) = parse_action(action)? {
                classify_overrides.by_terminal_state.insert(state, outcome);
            }
        }
        for (exit_code, action) in &doc.exit_codes {
            if let Some(outcome) = parse_action(action)? {
                classify_overrides.by_exit_code.insert(*exit_code, outcome);
            }
        }

        Ok(Config {
            ladder,
            max_array_spec_len: doc.max_array_spec_len.unwrap_or(DEFAULT_MAX_ARRAY_SPEC_LEN),
            sacct_settle_delay_sec: doc.sacct_settle_delay_sec.map(|v| {
                env_override_u64("ESCALATE_SETTLE_DELAY_SEC", v)
            }).unwrap_or_else(|| {
                env_override_u64("ESCALATE_SETTLE_DELAY_SEC", DEFAULT_SACCT_SETTLE_DELAY_SEC)
            }),
            handler_budget_sec: doc.handler_budget_sec.map(|v| {
                env_override_u64("ESCALATE_HANDLER_BUDGET_SEC", v)
            }).unwrap_or_else(|| {
                env_override_u64("ESCALATE_HANDLER_BUDGET_SEC", DEFAULT_HANDLER_BUDGET_SEC)
            }),
            classify_overrides,
            logging_enabled: doc.logging.enabled,
            logging_db_path: doc.logging.db_path,
        })
    }

    pub fn max_level(&self, axis: Option<Axis>) -> usize {
        self.ladder.max_level(axis)
    }
}

/// `escalate` keeps the default classification (the override map simply
/// omits an entry); `no_retry` forces the outcome to `other` so the index
/// is excluded from the retry set regardless of its terminal state.
fn parse_action(action: &str) -> EscalateResult<Option<Outcome>> {
    match action {
        "escalate_oom" => Ok(Some(Outcome::Oom)),
        "escalate_timeout" => Ok(Some(Outcome::Timeout)),
        "no_retry" => Ok(Some(Outcome::Other)),
        "completed" => Ok(Some(Outcome::Completed)),
        "escalate" => Ok(None),
        other => Err(EscalateError::UserInput(format!(
            "unknown state_handling/exit_codes action: {other:?}"
        ))),
    }
}
