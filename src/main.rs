//! CLI surface for the escalation orchestrator (spec.md §6).
//!
//! Three user-facing subcommands (`submit`, `status`, `list`) plus two
//! hidden ones (`handle-failure`, `handle-success`) that aren't part of the
//! public CLI table in spec.md but are the literal scheduler-invoked glue
//! the failure handler and success watcher jobs run as — see DESIGN.md.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use slurm_escalate::checkpoint::store::CheckpointStore;
use slurm_escalate::config::Config;
use slurm_escalate::driver::{self, BootstrapRequest};
use slurm_escalate::engine::{self, EngineContext, EscalationDecision, Trigger};
use slurm_escalate::error::EscalateError;
use slurm_escalate::eventlog::EventLog;
use slurm_escalate::gateway::slurm::{SlurmGateway, SlurmGatewayConfig};
use slurm_escalate::gateway::Resources;
use slurm_escalate::index;
use slurm_escalate::relational::RelationalMirror;

#[derive(Parser, Debug)]
#[command(name = "slurm-escalate", about = "Resource-escalation orchestrator for Slurm array jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a new chain: an array job plus its escalation ladder.
    Submit {
        /// Array spec in range-stride syntax, e.g. "0-999" or "0-99:2".
        #[arg(long = "array")]
        array: String,
        #[arg(long)]
        throttle: Option<u32>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Environment bindings for the submitted script, "K=V", repeatable.
        #[arg(long = "export", value_delimiter = ':')]
        export: Vec<String>,
        script: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        script_args: Vec<String>,
    },
    /// Report the current state of one chain.
    Status {
        chain_id: String,
        /// Re-render every `seconds` until the chain reaches a terminal
        /// state (default 5 when the flag is present with no value).
        #[arg(long, num_args = 0..=1, default_missing_value = "5")]
        watch: Option<u64>,
    },
    /// List every known chain, newest first.
    List,
    /// Invoked by the scheduler as a chain's failure handler. Hidden: not
    /// part of the public CLI surface, it is scheduler-submitted glue.
    #[command(hide = true)]
    HandleFailure {
        chain_id: String,
        round_no: u32,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Invoked by the scheduler as a chain's success watcher.
    #[command(hide = true)]
    HandleSuccess {
        chain_id: String,
        round_no: u32,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn checkpoint_dir() -> PathBuf {
    std::env::var("ESCALATE_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./escalate-state"))
}

fn self_binary() -> String {
    std::env::current_exe()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "slurm-escalate".to_string())
}

fn parse_export(bindings: &[String]) -> Result<Vec<(String, String)>> {
    bindings
        .iter()
        .map(|b| {
            b.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("malformed --export binding {b:?}, expected K=V"))
        })
        .collect()
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::load(p).context("loading config"),
        None => Ok(Config::default()),
    }
}

fn open_relational(config: &Config) -> Option<RelationalMirror> {
    if !config.logging_enabled {
        return None;
    }
    let path = config
        .logging_db_path
        .as_deref()
        .unwrap_or("./escalate-state/relational.db");
    match RelationalMirror::open(std::path::Path::new(path)) {
        Ok(mirror) => Some(mirror),
        Err(e) => {
            tracing::warn!(error = %e, path, "relational mirror unavailable, continuing without it");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slurm_escalate=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            if let Some(escalate_err) = e.downcast_ref::<EscalateError>() {
                eprintln!("slurm-escalate: {escalate_err}");
                escalate_err.exit_code()
            } else {
                eprintln!("slurm-escalate: {e:#}");
                1
            }
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Submit {
            array,
            throttle,
            config,
            export,
            script,
            script_args,
        } => cmd_submit(array, throttle, config, export, script, script_args).await,
        Command::Status { chain_id, watch } => cmd_status(chain_id, watch).await,
        Command::List => cmd_list(),
        Command::HandleFailure { chain_id, round_no, config } => {
            cmd_handle(chain_id, round_no, config, Trigger::FailureHandler).await
        }
        Command::HandleSuccess { chain_id, round_no, config } => {
            cmd_handle(chain_id, round_no, config, Trigger::SuccessWatcher).await
        }
    }
}

async fn cmd_submit(
    array: String,
    throttle: Option<u32>,
    config_path: Option<PathBuf>,
    export: Vec<String>,
    script: PathBuf,
    script_args: Vec<String>,
) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    let env = parse_export(&export)?;

    let index_set = index::expand(&array)
        .map_err(|e| EscalateError::UserInput(format!("bad --array spec: {e}")))?;
    if !script.exists() {
        return Err(EscalateError::UserInput(format!("script not found: {}", script.display())).into());
    }

    let store = CheckpointStore::new(checkpoint_dir());
    let gateway = SlurmGateway::with_defaults();
    let event_log = EventLog::new(checkpoint_dir().join("events.log"));
    let relational = open_relational(&config);

    let handler_resources = Resources {
        partitions: config
            .ladder
            .level(None, 0)
            .map(|l| l.partitions.clone())
            .unwrap_or_else(|| vec!["batch".to_string()]),
        memory: "512M".to_string(),
        wall_time: "00:10:00".to_string(),
        output_pattern: "handler-%A.out".to_string(),
        error_pattern: "handler-%A.err".to_string(),
        throttle: None,
    };

    let req = BootstrapRequest {
        script,
        script_args,
        index_set,
        ladder: config.ladder.clone(),
        env,
        throttle,
        output_pattern: "%A_%a.out".to_string(),
        error_pattern: "%A_%a.err".to_string(),
        handler_resources,
        self_binary: self_binary(),
        config_path: config_path.map(|p| p.to_string_lossy().to_string()),
    };

    let chain_id = driver::bootstrap(
        &gateway,
        &store,
        Some(&event_log),
        relational.as_ref(),
        req,
    )
    .await
    .map_err(anyhow::Error::from)?;

    println!("{chain_id}");
    Ok(())
}

async fn cmd_status(chain_id: String, watch: Option<u64>) -> Result<()> {
    let store = CheckpointStore::new(checkpoint_dir());
    loop {
        let status = driver::status(&store, &chain_id).map_err(anyhow::Error::from)?;
        render_status(&status);

        let Some(interval) = watch else { break };
        if status.state_label != "RUNNING" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
        println!();
    }
    Ok(())
}

fn render_status(status: &driver::ChainStatus) {
    println!("chain {}  [{}]", status.chain_id, status.state_label);
    println!(
        "{:>6} {:>6} {:>8} {:<13} {:>9} {:>9} {:>9} {:>9}",
        "round", "level", "axis", "state", "completed", "oom", "timeout", "other"
    );
    for round in &status.rounds {
        println!(
            "{:>6} {:>6} {:>8} {:<13} {:>9} {:>9} {:>9} {:>9}",
            round.round_no,
            round.level_index,
            round.axis.map(|a| a.as_str()).unwrap_or("-"),
            round.state,
            round.completed,
            round.oom,
            round.timeout,
            round.other,
        );
    }
}

fn cmd_list() -> Result<()> {
    let store = CheckpointStore::new(checkpoint_dir());
    let chains = driver::list(&store).map_err(anyhow::Error::from)?;
    println!("{:<24} {:<17} {:<40}", "chain_id", "state", "script");
    for chain in chains {
        println!(
            "{:<24} {:<17} {:<40}",
            chain.chain_id, chain.state_label, chain.script
        );
    }
    Ok(())
}

async fn cmd_handle(
    chain_id: String,
    round_no: u32,
    config_path: Option<PathBuf>,
    trigger: Trigger,
) -> Result<()> {
    let store = CheckpointStore::new(checkpoint_dir());
    let (chain, _) = store.load(&chain_id).map_err(anyhow::Error::from)?;
    let config = load_config(config_path.as_ref())?;
    let gateway = SlurmGateway::with_defaults();
    let event_log = EventLog::new(checkpoint_dir().join("events.log"));
    let relational = open_relational(&config);

    let handler_resources = Resources {
        partitions: chain
            .ladder
            .level(None, 0)
            .map(|l| l.partitions.clone())
            .unwrap_or_else(|| vec!["batch".to_string()]),
        memory: "512M".to_string(),
        wall_time: "00:10:00".to_string(),
        output_pattern: "handler-%A.out".to_string(),
        error_pattern: "handler-%A.err".to_string(),
        throttle: None,
    };

    let ctx = EngineContext {
        gateway: &gateway,
        store: &store,
        classify_overrides: &config.classify_overrides,
        max_array_spec_len: config.max_array_spec_len,
        event_log: Some(&event_log),
        relational: relational.as_ref(),
        output_pattern: "%A_%a.out".to_string(),
        error_pattern: "%A_%a.err".to_string(),
        handler_resources: &handler_resources,
        self_binary: self_binary(),
        config_path: config_path.map(|p| p.to_string_lossy().to_string()),
        settle_delay: std::time::Duration::from_secs(config.sacct_settle_delay_sec),
    };

    // Handler invocations run under a generous fixed budget (spec.md §5): if
    // classification and submission don't finish within it, that is itself
    // a control-plane bug or scheduler pathology, not a reason to leave the
    // chain silently RUNNING forever.
    let budget = std::time::Duration::from_secs(config.handler_budget_sec);
    let decision = match tokio::time::timeout(
        budget,
        engine::resolve_round(&ctx, &chain_id, round_no, trigger),
    )
    .await
    {
        Ok(result) => result.map_err(anyhow::Error::from)?,
        Err(_) => {
            let reason = format!(
                "handler invocation for round {round_no} exceeded its {}s budget",
                config.handler_budget_sec
            );
            store
                .mark_failed(&chain_id, reason.clone())
                .map_err(anyhow::Error::from)?;
            tracing::error!(chain_id, round_no, reason, "handler budget exceeded");
            EscalationDecision::FailedNotRetried { reason }
        }
    };

    match decision {
        EscalationDecision::AlreadyResolved => {
            tracing::info!(chain_id, round_no, "round already resolved, no-op");
        }
        EscalationDecision::Completed { completed_count } => {
            tracing::info!(chain_id, completed_count, "chain completed");
        }
        EscalationDecision::FailedAtMax { oom_residual, timeout_residual } => {
            tracing::warn!(
                chain_id,
                oom = index::compress(&oom_residual),
                timeout = index::compress(&timeout_residual),
                "chain failed at max ladder level"
            );
        }
        EscalationDecision::Escalated { new_round_numbers } => {
            tracing::info!(chain_id, ?new_round_numbers, "round escalated");
        }
        EscalationDecision::FailedNotRetried { reason } => {
            tracing::error!(chain_id, reason, "chain failed, not retried");
        }
    }
    Ok(())
}
