//! Chain driver (spec.md §4.6): the user-facing entry point. Bootstraps a
//! new chain's round 0 and its paired handler/watcher, and reads checkpoint
//! state back out for `status`/`list`.
//!
//! Submission itself reuses `engine::submit_round_jobs`'s shape, rather than
//! duplicating it: bootstrap builds round 0 exactly the way the engine
//! builds every subsequent round, just with `level_index = 0` and no
//! `axis` tag, so the very first round is not a special case anywhere else
//! in the codebase.

use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;

use crate::checkpoint::schema::{Chain, ChainState, Ladder, Round, RoundState};
use crate::checkpoint::store::CheckpointStore;
use crate::error::{EscalateError, EscalateResult};
use crate::eventlog::{EventAction, EventLog};
use crate::gateway::{Resources, SchedulerGateway};
use crate::index::{self, IndexSet};

/// Everything `bootstrap` needs that isn't part of the index set itself.
pub struct BootstrapRequest {
    pub script: PathBuf,
    pub script_args: Vec<String>,
    pub index_set: IndexSet,
    pub ladder: Ladder,
    pub env: Vec<(String, String)>,
    pub throttle: Option<u32>,
    pub output_pattern: String,
    pub error_pattern: String,
    pub handler_resources: Resources,
    pub self_binary: String,
    pub config_path: Option<String>,
}

/// Generate a chain id `YYYYMMDD-HHMMSS-<4 random lower-alphanum>` (spec.md
/// §4.6 step 1). The random suffix borrows a uuid v4's hex digits rather
/// than pulling in a dedicated `rand` dependency — four hex characters are
/// exactly the lowercase-alphanumeric suffix the spec asks for.
pub fn new_chain_id() -> String {
    let now = Utc::now();
    let suffix = &Uuid::new_v4().simple().to_string()[..4];
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), suffix)
}

/// Bootstrap a new chain: create the checkpoint with round 0 `PENDING`,
/// submit it, submit the paired handler/watcher, then persist the
/// resulting job ids and `RUNNING` state (spec.md §4.6 steps 2-4). Returns
/// without waiting for completion — the driver never blocks on the chain
/// finishing (step 5).
pub async fn bootstrap(
    gateway: &dyn SchedulerGateway,
    store: &CheckpointStore,
    event_log: Option<&EventLog>,
    relational: Option<&crate::relational::RelationalMirror>,
    req: BootstrapRequest,
) -> EscalateResult<String> {
    if req.index_set.is_empty() {
        return Err(EscalateError::UserInput(
            "array spec resolves to an empty index set".to_string(),
        ));
    }
    let level = req
        .ladder
        .level(None, 0)
        .or_else(|| req.ladder.level(Some(crate::checkpoint::schema::Axis::Memory), 0))
        .ok_or_else(|| EscalateError::UserInput("ladder has no level 0".to_string()))?
        .clone();

    let chain_id = new_chain_id();
    let array_spec = index::compress(&req.index_set);
    let chain = Chain {
        chain_id: chain_id.clone(),
        script: req.script,
        script_args: req.script_args,
        full_index_set: req.index_set.clone(),
        ladder: req.ladder,
        created_at: Utc::now(),
        state: ChainState::Running,
    };
    let round0 = Round::pending(0, 0, None, &level, req.index_set.clone(), array_spec);
    store.create(&chain, &round0)?;
    if let Some(rel) = relational {
        rel.record_chain_created(&chain);
    }

    let mut round = round0;
    let submitted = submit_bootstrap_round(
        gateway,
        &chain,
        &mut round,
        &req.env,
        req.throttle,
        &req.output_pattern,
        &req.error_pattern,
        &req.handler_resources,
        &req.self_binary,
        &req.config_path,
    )
    .await;
    if let Err(EscalateError::SchedulerFatal(reason)) = &submitted {
        // The checkpoint was already created (above) so a crash-recovery
        // reader has something to find; a bootstrap submission that never
        // parses to a job id must not leave that chain looking `RUNNING`
        // forever with nothing ever going to invoke a handler for it
        // (spec.md §7's scheduler-fatal handling applies to bootstrap too).
        store.mark_failed(&chain_id, reason.clone())?;
    }
    submitted?;

    store.update_round(&chain_id, 0, |r| {
        r.job_ids = round.job_ids.clone();
        r.handler_job_id = round.handler_job_id.clone();
        r.watcher_job_id = round.watcher_job_id.clone();
        r.state = RoundState::Running;
    })?;

    if let Some(log) = event_log {
        log.record(
            &chain_id,
            EventAction::Submit,
            round.job_ids.first().map(String::as_str),
            0,
            &chain.full_index_set,
        );
    }
    if let Some(rel) = relational {
        rel.record_round_submitted(&chain_id, &round);
        rel.record_action(
            &chain_id,
            "SUBMIT",
            round.job_ids.first().map(String::as_str),
            0,
            &round.array_spec,
        );
    }

    Ok(chain_id)
}

async fn submit_bootstrap_round(
    gateway: &dyn SchedulerGateway,
    chain: &Chain,
    round: &mut Round,
    env: &[(String, String)],
    throttle: Option<u32>,
    output_pattern: &str,
    error_pattern: &str,
    handler_resources: &Resources,
    self_binary: &str,
    config_path: &Option<String>,
) -> EscalateResult<()> {
    let resources = Resources {
        partitions: round.partitions.clone(),
        memory: round.memory.clone(),
        wall_time: round.wall_time.clone(),
        output_pattern: output_pattern.to_string(),
        error_pattern: error_pattern.to_string(),
        throttle,
    };
    let job_id = gateway
        .submit(
            &round.array_spec,
            &resources,
            chain.script.to_string_lossy().as_ref(),
            &chain.script_args,
            env,
            None,
        )
        .await?;
    round.job_ids = vec![job_id.clone()];

    let failure_dep = gateway.dep_on_failure(&round.job_ids);
    let success_dep = gateway.dep_on_success(&round.job_ids);

    round.handler_job_id = Some(
        gateway
            .submit(
                "0",
                handler_resources,
                self_binary,
                &crate::engine::handler_args(
                    chain,
                    round.round_no,
                    crate::engine::Trigger::FailureHandler,
                    config_path,
                ),
                &[],
                Some(&failure_dep),
            )
            .await?,
    );
    round.watcher_job_id = Some(
        gateway
            .submit(
                "0",
                handler_resources,
                self_binary,
                &crate::engine::handler_args(
                    chain,
                    round.round_no,
                    crate::engine::Trigger::SuccessWatcher,
                    config_path,
                ),
                &[],
                Some(&success_dep),
            )
            .await?,
    );
    Ok(())
}

/// Rendered per-round line for `status`/`watch` (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round_no: u32,
    pub level_index: usize,
    pub axis: Option<crate::checkpoint::schema::Axis>,
    pub state: &'static str,
    pub array_spec: String,
    pub completed: u32,
    pub oom: u32,
    pub timeout: u32,
    pub other: u32,
}

/// Full status report for one chain.
#[derive(Debug, Clone)]
pub struct ChainStatus {
    pub chain_id: String,
    pub state_label: &'static str,
    pub rounds: Vec<RoundSummary>,
}

/// Read-only snapshot of a chain's current checkpoint state (spec.md §4.6
/// `status`). Never mutates the checkpoint or talks to the scheduler.
pub fn status(store: &CheckpointStore, chain_id: &str) -> EscalateResult<ChainStatus> {
    let (chain, rounds) = store.load(chain_id)?;
    let rounds = rounds
        .into_iter()
        .map(|r| RoundSummary {
            round_no: r.round_no,
            level_index: r.level_index,
            axis: r.axis,
            state: r.state.as_str(),
            array_spec: r.array_spec,
            completed: r.counts.completed,
            oom: r.counts.oom,
            timeout: r.counts.timeout,
            other: r.counts.other,
        })
        .collect();
    Ok(ChainStatus {
        chain_id: chain.chain_id,
        state_label: chain.state.label(),
        rounds,
    })
}

/// Summary row for `list` (spec.md §4.6 `list()`).
#[derive(Debug, Clone)]
pub struct ChainSummary {
    pub chain_id: String,
    pub script: String,
    pub state_label: &'static str,
    pub created_at: chrono::DateTime<Utc>,
}

/// Enumerate every chain under the checkpoint store, newest first.
pub fn list(store: &CheckpointStore) -> EscalateResult<Vec<ChainSummary>> {
    let chains = store.list_all()?;
    Ok(chains
        .into_iter()
        .map(|c| ChainSummary {
            chain_id: c.chain_id,
            script: c.script.to_string_lossy().to_string(),
            state_label: c.state.label(),
            created_at: c.created_at,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::schema::{Level, TerminalState};
    use crate::classify::TaskOutcome;
    use crate::gateway::{Dependency, UserJob};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingGateway {
        next_id: Mutex<u64>,
        submitted: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingGateway {
        fn new() -> Self {
            Self {
                next_id: Mutex::new(1),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SchedulerGateway for RecordingGateway {
        async fn submit(
            &self,
            array_spec: &str,
            _resources: &Resources,
            _script: &str,
            script_args: &[String],
            _env: &[(String, String)],
            _dependency: Option<&Dependency>,
        ) -> EscalateResult<String> {
            self.submitted
                .lock()
                .unwrap()
                .push((array_spec.to_string(), script_args.to_vec()));
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            Ok(id.to_string())
        }

        async fn classify(&self, _job_id: &str) -> EscalateResult<Vec<TaskOutcome>> {
            Ok(vec![TaskOutcome::minimal(0, TerminalState::Completed, 0)])
        }

        async fn cancel(&self, _job_ids: &[String]) -> EscalateResult<()> {
            Ok(())
        }

        async fn list_user_jobs(&self) -> EscalateResult<Vec<UserJob>> {
            Ok(Vec::new())
        }
    }

    fn sample_req(indices: IndexSet) -> BootstrapRequest {
        BootstrapRequest {
            script: PathBuf::from("/opt/run.sh"),
            script_args: vec!["--flag".into(), "value with spaces".into()],
            index_set: indices,
            env: vec![("FOO".into(), "bar".into())],
            ladder: Ladder::levels_mode(vec![Level {
                partitions: vec!["batch".into()],
                memory: "1G".into(),
                wall_time: "00:10:00".into(),
            }]),
            throttle: Some(50),
            output_pattern: "%A_%a.out".into(),
            error_pattern: "%A_%a.err".into(),
            handler_resources: Resources {
                partitions: vec!["batch".into()],
                memory: "256M".into(),
                wall_time: "00:05:00".into(),
                output_pattern: "h.out".into(),
                error_pattern: "h.err".into(),
                throttle: None,
            },
            self_binary: "/usr/bin/slurm-escalate".into(),
            config_path: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_creates_checkpoint_and_submits_three_jobs() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let gw = RecordingGateway::new();
        let indices: IndexSet = (0..20u64).collect();

        let chain_id = bootstrap(&gw, &store, None, None, sample_req(indices))
            .await
            .unwrap();

        assert_eq!(gw.submitted.lock().unwrap().len(), 3);
        let status = status(&store, &chain_id).unwrap();
        assert_eq!(status.rounds.len(), 1);
        assert_eq!(status.rounds[0].array_spec, "0-19");
        assert_eq!(status.state_label, "RUNNING");
    }

    #[tokio::test]
    async fn bootstrap_rejects_empty_index_set() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let gw = RecordingGateway::new();

        let err = bootstrap(&gw, &store, None, None, sample_req(IndexSet::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EscalateError::UserInput(_)));
    }

    #[test]
    fn new_chain_id_has_expected_shape() {
        let id = new_chain_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn list_is_empty_for_a_fresh_store() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(list(&store).unwrap().is_empty());
    }
}
