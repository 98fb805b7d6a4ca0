//! Event log (spec.md §4.7, §6): append-only plain-text timeline, one line
//! per event, ISO-8601 timestamp first field. Observability only — never
//! consulted by the engine for decisions.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::EscalateResult;
use crate::index::IndexSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Submit,
    Escalate,
    Complete,
    FailAtMax,
    NotRetried,
}

impl EventAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "SUBMIT",
            Self::Escalate => "ESCALATE",
            Self::Complete => "COMPLETE",
            Self::FailAtMax => "FAIL_AT_MAX",
            Self::NotRetried => "NOT_RETRIED",
        }
    }
}

pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one event line. Best-effort: a logging failure is a warning,
    /// never propagated to the caller's control flow (same posture as the
    /// relational mirror).
    pub fn record(
        &self,
        chain_id: &str,
        action: EventAction,
        job_id: Option<&str>,
        level: usize,
        indices: &IndexSet,
    ) {
        if let Err(e) = self.try_record(chain_id, action, job_id, level, indices) {
            tracing::warn!(error = %e, chain_id, "failed to append event log entry");
        }
    }

    fn try_record(
        &self,
        chain_id: &str,
        action: EventAction,
        job_id: Option<&str>,
        level: usize,
        indices: &IndexSet,
    ) -> EscalateResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = format_line(Utc::now(), chain_id, action, job_id, level, indices);
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_line(
    ts: DateTime<Utc>,
    chain_id: &str,
    action: EventAction,
    job_id: Option<&str>,
    level: usize,
    indices: &IndexSet,
) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        ts.to_rfc3339(),
        chain_id,
        action.as_str(),
        job_id.unwrap_or("-"),
        level,
        crate::index::compress(indices),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn record_appends_a_well_formed_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.log"));
        let indices: BTreeSet<u64> = (0..5).collect();

        log.record("20260101-000000-abcd", EventAction::Submit, Some("123"), 0, &indices);

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let line = contents.lines().next().unwrap();
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[1], "20260101-000000-abcd");
        assert_eq!(fields[2], "SUBMIT");
        assert_eq!(fields[3], "123");
        assert_eq!(fields[4], "0");
        assert_eq!(fields[5], "0-4");
        assert!(DateTime::parse_from_rfc3339(fields[0]).is_ok());
    }

    #[test]
    fn multiple_records_append_rather_than_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.log"));
        let indices: BTreeSet<u64> = [1].into_iter().collect();

        log.record("c1", EventAction::Submit, None, 0, &indices);
        log.record("c1", EventAction::Complete, None, 0, &indices);

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
