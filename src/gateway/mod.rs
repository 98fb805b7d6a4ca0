//! Scheduler gateway (spec.md §4.5): the abstract boundary between the
//! escalation engine and whatever Slurm-class scheduler is actually
//! installed on the control node.

pub mod slurm;

use async_trait::async_trait;

use crate::classify::TaskOutcome;
use crate::error::EscalateResult;

/// Resource request for one submission (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct Resources {
    pub partitions: Vec<String>,
    pub memory: String,
    pub wall_time: String,
    pub output_pattern: String,
    pub error_pattern: String,
    pub throttle: Option<u32>,
}

/// An opaque dependency expression, constructed only through
/// `dep_on_failure` / `dep_on_success` so callers can never hand-build an
/// unsafe single-job `afternotok` dependency for a batched round
/// (spec.md §4.4, §9).
#[derive(Debug, Clone)]
pub struct Dependency(pub(crate) String);

/// One user-visible job as reported by `list_user_jobs`.
#[derive(Debug, Clone)]
pub struct UserJob {
    pub job_id: String,
    pub name: String,
    pub state: String,
}

/// Abstract contract over an external Slurm-class scheduler
/// (spec.md §4.5, §6's scheduler-interface table). All argument passing is
/// through an ordered vector — never a single interpolated string
/// (spec.md §4.5 "argument injection safety").
#[async_trait]
pub trait SchedulerGateway: Send + Sync {
    /// Submit a parallel-array job over `array_spec` indices.
    async fn submit(
        &self,
        array_spec: &str,
        resources: &Resources,
        script: &str,
        script_args: &[String],
        env: &[(String, String)],
        dependency: Option<&Dependency>,
    ) -> EscalateResult<String>;

    /// One accounting record per task index in the array job.
    async fn classify(&self, job_id: &str) -> EscalateResult<Vec<TaskOutcome>>;

    /// Best-effort cancellation of one or more jobs.
    async fn cancel(&self, job_ids: &[String]) -> EscalateResult<()>;

    /// Jobs owned by the invoking user, for stale-handler cleanup.
    async fn list_user_jobs(&self) -> EscalateResult<Vec<UserJob>>;

    /// Build a "run if any of these did not complete successfully"
    /// dependency. Multi-job callers MUST use the any-outcome fallback
    /// (spec.md §4.4 step 6, §9) to avoid the dependency-stall class.
    fn dep_on_failure(&self, job_ids: &[String]) -> Dependency {
        if job_ids.len() == 1 {
            Dependency(format!("afternotok:{}", job_ids[0]))
        } else {
            Dependency(format!("afterany:{}", job_ids.join(":")))
        }
    }

    /// Build a "run once these all succeeded" dependency, using the same
    /// any-outcome fallback for batched rounds.
    fn dep_on_success(&self, job_ids: &[String]) -> Dependency {
        if job_ids.len() == 1 {
            Dependency(format!("afterok:{}", job_ids[0]))
        } else {
            Dependency(format!("afterany:{}", job_ids.join(":")))
        }
    }
}
