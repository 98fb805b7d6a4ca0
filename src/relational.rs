//! Optional relational mirror (spec.md §4.2 ambient stack), feature-gated
//! behind `relational-store`. Backed by `rusqlite` rather than the
//! teacher's `rocksdb`/`bincode` pair: the spec's `chains`/`rounds`/
//! `tasks`/`actions` tables want SQL joins and ad-hoc operator queries, not
//! a key-value store, so this swaps the engine while keeping the same
//! posture — best-effort, write failures never reach the caller.
//!
//! The checkpoint file is the durable source of truth (spec.md §4.2); this
//! mirror exists purely so an operator can `sqlite3 state.db` and ask
//! questions the line-oriented checkpoint format isn't built to answer.

#[cfg(not(feature = "relational-store"))]
mod disabled {
    use std::path::Path;

    use crate::checkpoint::schema::{Chain, OutcomeCounts, Round, TaskRecord};

    /// Stub used when the crate is built without `relational-store`: every
    /// call site still compiles and runs, it just has nowhere to write.
    /// `open` always fails so callers fall back to `relational: None`
    /// rather than silently pretending to mirror state.
    pub struct RelationalMirror;

    impl RelationalMirror {
        pub fn open(_path: &Path) -> Result<Self, std::io::Error> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "built without the relational-store feature",
            ))
        }

        pub fn record_chain_created(&self, _chain: &Chain) {}
        pub fn record_round_submitted(&self, _chain_id: &str, _round: &Round) {}
        pub fn record_round_counts(&self, _chain_id: &str, _round_no: u32, _counts: &OutcomeCounts) {}
        pub fn record_task_outcomes(&self, _chain_id: &str, _round_no: u32, _tasks: &[TaskRecord]) {}
        pub fn record_action(
            &self,
            _chain_id: &str,
            _action: &str,
            _job_id: Option<&str>,
            _level: usize,
            _array_spec: &str,
        ) {
        }
    }
}

#[cfg(not(feature = "relational-store"))]
pub use disabled::RelationalMirror;

#[cfg(feature = "relational-store")]
pub use enabled::RelationalMirror;

#[cfg(feature = "relational-store")]
mod enabled {

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::checkpoint::schema::{Chain, OutcomeCounts, Round, TaskRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chains (
    chain_id    TEXT PRIMARY KEY,
    script      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    state       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS rounds (
    chain_id    TEXT NOT NULL,
    round_no    INTEGER NOT NULL,
    level_index INTEGER NOT NULL,
    axis        TEXT,
    array_spec  TEXT NOT NULL,
    state       TEXT NOT NULL,
    completed   INTEGER NOT NULL DEFAULT 0,
    oom         INTEGER NOT NULL DEFAULT 0,
    timeout     INTEGER NOT NULL DEFAULT 0,
    other       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (chain_id, round_no)
);
CREATE TABLE IF NOT EXISTS tasks (
    chain_id      TEXT NOT NULL,
    round_no      INTEGER NOT NULL,
    task_index    INTEGER NOT NULL,
    terminal_state TEXT NOT NULL,
    exit_code     INTEGER NOT NULL,
    elapsed_sec   INTEGER NOT NULL,
    node          TEXT,
    peak_memory_kb INTEGER,
    PRIMARY KEY (chain_id, round_no, task_index)
);
CREATE TABLE IF NOT EXISTS actions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    ts         TEXT NOT NULL,
    chain_id   TEXT NOT NULL,
    action     TEXT NOT NULL,
    job_id     TEXT,
    level      INTEGER NOT NULL,
    array_spec TEXT NOT NULL
);
";

/// A best-effort SQL mirror of the checkpoint store. Every `record_*` call
/// swallows its own errors (logged at `warn`) rather than returning a
/// `Result` — a mirror write failure must never block the engine's real
/// state transition.
pub struct RelationalMirror {
    conn: Mutex<Connection>,
}

impl RelationalMirror {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record_chain_created(&self, chain: &Chain) {
        if let Err(e) = self.try_record_chain_created(chain) {
            tracing::warn!(error = %e, chain_id = %chain.chain_id, "relational mirror: chain insert failed");
        }
    }

    fn try_record_chain_created(&self, chain: &Chain) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chains (chain_id, script, created_at, state) VALUES (?1, ?2, ?3, ?4)",
            params![
                chain.chain_id,
                chain.script.to_string_lossy(),
                chain.created_at.to_rfc3339(),
                chain.state.label(),
            ],
        )?;
        Ok(())
    }

    pub fn record_round_submitted(&self, chain_id: &str, round: &Round) {
        if let Err(e) = self.try_record_round_submitted(chain_id, round) {
            tracing::warn!(error = %e, chain_id, round_no = round.round_no, "relational mirror: round insert failed");
        }
    }

    fn try_record_round_submitted(&self, chain_id: &str, round: &Round) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO rounds
                (chain_id, round_no, level_index, axis, array_spec, state, completed, oom, timeout, other)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                chain_id,
                round.round_no,
                round.level_index as i64,
                round.axis.map(|a| a.as_str()),
                round.array_spec,
                round.state.as_str(),
                round.counts.completed,
                round.counts.oom,
                round.counts.timeout,
                round.counts.other,
            ],
        )?;
        Ok(())
    }

    pub fn record_round_counts(&self, chain_id: &str, round_no: u32, counts: &OutcomeCounts) {
        if let Err(e) = self.try_record_round_counts(chain_id, round_no, counts) {
            tracing::warn!(error = %e, chain_id, round_no, "relational mirror: round counts update failed");
        }
    }

    fn try_record_round_counts(
        &self,
        chain_id: &str,
        round_no: u32,
        counts: &OutcomeCounts,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rounds SET completed = ?1, oom = ?2, timeout = ?3, other = ?4
             WHERE chain_id = ?5 AND round_no = ?6",
            params![
                counts.completed,
                counts.oom,
                counts.timeout,
                counts.other,
                chain_id,
                round_no,
            ],
        )?;
        Ok(())
    }

    pub fn record_task_outcomes(&self, chain_id: &str, round_no: u32, tasks: &[TaskRecord]) {
        if let Err(e) = self.try_record_task_outcomes(chain_id, round_no, tasks) {
            tracing::warn!(error = %e, chain_id, round_no, "relational mirror: task insert failed");
        }
    }

    fn try_record_task_outcomes(
        &self,
        chain_id: &str,
        round_no: u32,
        tasks: &[TaskRecord],
    ) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for task in tasks {
            tx.execute(
                "INSERT OR REPLACE INTO tasks
                    (chain_id, round_no, task_index, terminal_state, exit_code, elapsed_sec, node, peak_memory_kb)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    chain_id,
                    round_no,
                    task.index as i64,
                    task.terminal_state.as_str(),
                    task.exit_code,
                    task.elapsed_sec as i64,
                    task.node,
                    task.peak_memory_kb.map(|v| v as i64),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn record_action(
        &self,
        chain_id: &str,
        action: &str,
        job_id: Option<&str>,
        level: usize,
        array_spec: &str,
    ) {
        if let Err(e) = self.try_record_action(chain_id, action, job_id, level, array_spec) {
            tracing::warn!(error = %e, chain_id, "relational mirror: action insert failed");
        }
    }

    fn try_record_action(
        &self,
        chain_id: &str,
        action: &str,
        job_id: Option<&str>,
        level: usize,
        array_spec: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO actions (ts, chain_id, action, job_id, level, array_spec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chrono::Utc::now().to_rfc3339(),
                chain_id,
                action,
                job_id,
                level as i64,
                array_spec,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::schema::{ChainState, Ladder, TerminalState};
    use std::path::PathBuf;

    fn sample_chain() -> Chain {
        Chain {
            chain_id: "c1".into(),
            script: PathBuf::from("/opt/run.sh"),
            script_args: vec![],
            full_index_set: (0..10u64).collect(),
            ladder: Ladder::levels_mode(vec![]),
            created_at: chrono::Utc::now(),
            state: ChainState::Running,
        }
    }

    #[test]
    fn records_chain_round_and_task_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = RelationalMirror::open(&dir.path().join("state.db")).unwrap();
        let chain = sample_chain();
        mirror.record_chain_created(&chain);

        let round = Round::pending(
            0,
            0,
            None,
            &crate::checkpoint::schema::Level {
                partitions: vec!["batch".into()],
                memory: "1G".into(),
                wall_time: "00:10:00".into(),
            },
            (0..10u64).collect(),
            "0-9".to_string(),
        );
        mirror.record_round_submitted("c1", &round);

        let tasks = vec![TaskRecord {
            index: 0,
            terminal_state: TerminalState::Completed,
            exit_code: 0,
            elapsed_sec: 30,
            node: Some("node01".into()),
            peak_memory_kb: Some(2048),
            stdout_path: None,
            stderr_path: None,
        }];
        mirror.record_task_outcomes("c1", 0, &tasks);
        mirror.record_action("c1", "SUBMIT", Some("123"), 0, "0-9");

        let conn = mirror.conn.lock().unwrap();
        let chain_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chains", [], |r| r.get(0))
            .unwrap();
        assert_eq!(chain_count, 1);
        let task_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(task_count, 1);
        let action_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM actions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(action_count, 1);
    }
}

} // mod enabled
