//! Durable per-chain checkpoint store (spec.md §4.2).
//!
//! Atomicity follows the teacher's `FeatureRegistry::save` /
//! `load_with_recovery` pattern: write to a `.tmp` sibling, `fs::rename`
//! over the final path, keep a `.backup` copy of whatever was there before.
//! Unlike the teacher's registry, `load` never invents an empty chain on
//! corruption — spec.md §7 treats checkpoint errors as fatal to the current
//! handler invocation. `load_with_recovery` is the explicit opt-in for
//! operator-driven recovery tooling that wants the backup-or-bust fallback.

use std::path::{Path, PathBuf};

use crate::checkpoint::format;
use crate::checkpoint::schema::{Chain, ChainState, Round, RoundState};
use crate::error::{EscalateError, EscalateResult};
use crate::index::IndexSet;

/// Durable checkpoint store rooted at a configured directory, one file per
/// chain named `<chain_id>.checkpoint`.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, chain_id: &str) -> PathBuf {
        self.dir.join(format!("{chain_id}.checkpoint"))
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(".backup");
        PathBuf::from(os)
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// Write `chain` + `rounds` to disk: backup the existing file (if any),
    /// write to a `.tmp` sibling, then atomically rename over the final
    /// path. A reader racing this write sees either the old file or the
    /// new one in full, never a partial write (spec.md §5).
    fn write(&self, chain: &Chain, rounds: &[Round]) -> EscalateResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&chain.chain_id);
        let backup_path = Self::backup_path(&path);
        let tmp_path = Self::tmp_path(&path);

        if path.exists() {
            if let Err(e) = std::fs::copy(&path, &backup_path) {
                tracing::warn!(chain_id = %chain.chain_id, error = %e, "checkpoint backup copy failed");
            }
        }

        let content = format::serialize(chain, rounds);
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Create a new chain checkpoint with its first round in `PENDING`.
    pub fn create(&self, chain: &Chain, initial_round: &Round) -> EscalateResult<()> {
        self.write(chain, std::slice::from_ref(initial_round))
    }

    /// Load a chain's full checkpoint. Fails if the file is missing or does
    /// not parse — the checkpoint is never silently rewritten on a parse
    /// failure (spec.md §7).
    pub fn load(&self, chain_id: &str) -> EscalateResult<(Chain, Vec<Round>)> {
        let path = self.path_for(chain_id);
        if !path.exists() {
            return Err(EscalateError::ChainNotFound(chain_id.to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        format::parse(&content).map_err(|e| e.with_checkpoint_path(path.clone()))
    }

    /// Load with primary/backup/fatal fallback, for operator-driven
    /// recovery tooling only — ordinary handler invocations must use
    /// `load` and fail loudly on corruption.
    pub fn load_with_recovery(&self, chain_id: &str) -> EscalateResult<(Chain, Vec<Round>)> {
        let path = self.path_for(chain_id);
        match self.load(chain_id) {
            Ok(result) => Ok(result),
            Err(EscalateError::ChainNotFound(_)) => Err(EscalateError::ChainNotFound(
                chain_id.to_string(),
            )),
            Err(primary_err) => {
                let backup_path = Self::backup_path(&path);
                if !backup_path.exists() {
                    return Err(primary_err);
                }
                tracing::warn!(
                    chain_id,
                    error = %primary_err,
                    "primary checkpoint corrupted, trying backup"
                );
                let content = std::fs::read_to_string(&backup_path)?;
                let (chain, rounds) =
                    format::parse(&content).map_err(|e| e.with_checkpoint_path(backup_path))?;
                self.write(&chain, &rounds)?;
                Ok((chain, rounds))
            }
        }
    }

    /// Append a new round to the chain in a single atomic update.
    pub fn append_round(&self, chain_id: &str, round: Round) -> EscalateResult<()> {
        let (chain, mut rounds) = self.load(chain_id)?;
        rounds.push(round);
        self.write(&chain, &rounds)
    }

    /// Replace round `round_no` with the result of `update`, then persist.
    /// Used to record job ids after submission and terminal state/counts
    /// after classification.
    pub fn update_round(
        &self,
        chain_id: &str,
        round_no: u32,
        update: impl FnOnce(&mut Round),
    ) -> EscalateResult<()> {
        let (chain, mut rounds) = self.load(chain_id)?;
        let round = rounds
            .iter_mut()
            .find(|r| r.round_no == round_no)
            .ok_or_else(|| {
                EscalateError::checkpoint(
                    self.path_for(chain_id),
                    format!("no round {round_no} in chain {chain_id}"),
                )
            })?;
        update(round);
        self.write(&chain, &rounds)
    }

    /// Mark the chain `COMPLETED`. Monotonic: refuses to leave a terminal
    /// state (spec.md §3, property 9).
    pub fn mark_completed(&self, chain_id: &str, completed_count: u32) -> EscalateResult<()> {
        self.transition(chain_id, ChainState::Completed { completed_count })
    }

    /// Mark the chain `FAILED_AT_MAX` with the residual indices that could
    /// not be escalated further, split by which failure mode produced them.
    pub fn mark_failed_at_max(
        &self,
        chain_id: &str,
        oom_residual: IndexSet,
        timeout_residual: IndexSet,
    ) -> EscalateResult<()> {
        self.transition(
            chain_id,
            ChainState::FailedAtMax {
                oom_residual,
                timeout_residual,
            },
        )
    }

    /// Mark the chain `FAILED_NOT_RETRIED` with a descriptive reason
    /// (scheduler-fatal error, control-plane timeout).
    pub fn mark_failed(&self, chain_id: &str, reason: impl Into<String>) -> EscalateResult<()> {
        self.transition(
            chain_id,
            ChainState::FailedNotRetried {
                reason: reason.into(),
            },
        )
    }

    fn transition(&self, chain_id: &str, new_state: ChainState) -> EscalateResult<()> {
        let (mut chain, rounds) = self.load(chain_id)?;
        if chain.state.is_terminal() {
            return Err(EscalateError::checkpoint(
                self.path_for(chain_id),
                format!(
                    "chain {chain_id} is already terminal ({}), refusing to transition to {}",
                    chain.state.label(),
                    new_state.label()
                ),
            ));
        }
        chain.state = new_state;
        self.write(&chain, &rounds)
    }

    /// Enumerate every chain id with a checkpoint under this store's
    /// directory, newest-first by chain id (chain ids are timestamp-prefixed
    /// and therefore sortable).
    pub fn list_all(&self) -> EscalateResult<Vec<Chain>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut chains = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("checkpoint") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let (chain, _) = format::parse(&content).map_err(|e| e.with_checkpoint_path(path))?;
            chains.push(chain);
        }
        chains.sort_by(|a, b| b.chain_id.cmp(&a.chain_id));
        Ok(chains)
    }

    /// Load just the preserved script argument vector for a chain, as the
    /// engine must when rebuilding a retry submission (spec.md §4.4).
    pub fn load_preserved_args(&self, chain_id: &str) -> EscalateResult<Vec<String>> {
        let (chain, _) = self.load(chain_id)?;
        Ok(chain.script_args)
    }
}

/// A round counts as still-unresolved (pending escalation decision) when it
/// has not reached a completed/escalating/terminal state.
pub fn round_is_unresolved(round: &Round) -> bool {
    matches!(round.state, RoundState::Pending | RoundState::Running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::schema::{Ladder, Level};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample(chain_id: &str) -> (Chain, Round) {
        let ladder = Ladder::levels_mode(vec![Level {
            partitions: vec!["small".into()],
            memory: "1G".into(),
            wall_time: "00:10:00".into(),
        }]);
        let chain = Chain {
            chain_id: chain_id.to_string(),
            script: "/opt/run.sh".into(),
            script_args: vec!["--flag".into(), "value here".into()],
            full_index_set: (0..10u64).collect(),
            ladder,
            created_at: Utc::now(),
            state: ChainState::Running,
        };
        let round = Round::pending(
            0,
            0,
            None,
            &chain.ladder.levels[0],
            (0..10u64).collect(),
            "0-9".into(),
        );
        (chain, round)
    }

    #[test]
    fn create_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain, round) = sample("20260728-000000-aaaa");
        store.create(&chain, &round).unwrap();

        let (loaded, rounds) = store.load(&chain.chain_id).unwrap();
        assert_eq!(loaded.chain_id, chain.chain_id);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].state, RoundState::Pending);
    }

    #[test]
    fn load_missing_chain_is_chain_not_found() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(
            store.load("nonexistent"),
            Err(EscalateError::ChainNotFound(_))
        ));
    }

    #[test]
    fn append_round_preserves_earlier_rounds() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain, round0) = sample("20260728-000001-bbbb");
        store.create(&chain, &round0).unwrap();

        let round1 = Round::pending(
            1,
            1,
            None,
            &Level {
                partitions: vec!["large".into()],
                memory: "2G".into(),
                wall_time: "00:20:00".into(),
            },
            [1, 2].into_iter().collect(),
            "1-2".into(),
        );
        store.append_round(&chain.chain_id, round1).unwrap();

        let (_, rounds) = store.load(&chain.chain_id).unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[1].round_no, 1);
    }

    #[test]
    fn update_round_mutates_in_place() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain, round0) = sample("20260728-000002-cccc");
        store.create(&chain, &round0).unwrap();

        store
            .update_round(&chain.chain_id, 0, |r| {
                r.state = RoundState::Completed;
                r.job_ids.push("999".into());
            })
            .unwrap();

        let (_, rounds) = store.load(&chain.chain_id).unwrap();
        assert_eq!(rounds[0].state, RoundState::Completed);
        assert_eq!(rounds[0].job_ids, vec!["999".to_string()]);
    }

    #[test]
    fn mark_completed_then_mark_failed_is_rejected() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain, round0) = sample("20260728-000003-dddd");
        store.create(&chain, &round0).unwrap();

        store.mark_completed(&chain.chain_id, 10).unwrap();
        let err = store.mark_failed(&chain.chain_id, "late duplicate transition");
        assert!(err.is_err());
    }

    #[test]
    fn crash_between_write_and_rename_leaves_old_checkpoint_parseable() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain, round0) = sample("20260728-000004-eeee");
        store.create(&chain, &round0).unwrap();

        // Simulate a crash: the .tmp file is written but never renamed.
        let path = store.path_for(&chain.chain_id);
        let tmp_path = CheckpointStore::tmp_path(&path);
        std::fs::write(&tmp_path, "GARBAGE THAT WOULD BECOME THE NEW CHECKPOINT").unwrap();

        let (loaded, rounds) = store.load(&chain.chain_id).unwrap();
        assert_eq!(loaded.chain_id, chain.chain_id);
        assert_eq!(rounds.len(), 1);
    }

    #[test]
    fn load_with_recovery_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain, round0) = sample("20260728-000005-ffff");
        store.create(&chain, &round0).unwrap();
        // Second write creates a .backup of the first (valid) version.
        store
            .update_round(&chain.chain_id, 0, |r| r.state = RoundState::Running)
            .unwrap();

        let path = store.path_for(&chain.chain_id);
        std::fs::write(&path, "not a valid checkpoint at all").unwrap();

        let (recovered, _) = store.load_with_recovery(&chain.chain_id).unwrap();
        assert_eq!(recovered.chain_id, chain.chain_id);
    }

    #[test]
    fn list_all_sorts_newest_first() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain_a, round_a) = sample("20260728-000010-aaaa");
        let (chain_b, round_b) = sample("20260728-000020-bbbb");
        store.create(&chain_a, &round_a).unwrap();
        store.create(&chain_b, &round_b).unwrap();

        let chains = store.list_all().unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].chain_id, chain_b.chain_id);
    }

    #[test]
    fn load_preserved_args_returns_exact_vector() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (chain, round0) = sample("20260728-000006-gggg");
        store.create(&chain, &round0).unwrap();

        let args = store.load_preserved_args(&chain.chain_id).unwrap();
        assert_eq!(args, chain.script_args);
    }
}
