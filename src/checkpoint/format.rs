//! Line-oriented checkpoint codec.
//!
//! Deliberately not `serde_json`/`serde_yaml` (see `SPEC_FULL.md` §4.2): the
//! argument vector is carried as one `ARG: <escaped value>` line per argument
//! inside an `ARGS_BEGIN`/`ARGS_END` fence. Only `\` and newline are escaped
//! (`\\`, `\n`, `\r`) — just enough that an argument containing an embedded
//! newline still occupies exactly one physical line, and the `ARG: ` prefix
//! means an argument whose value is literally the text `ARGS_END` can never
//! be mistaken for the fence terminator. Every other field is a
//! `KEY: value` line or a small nested block (`LEVELS`, `ROUND`, `TASK`).

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::checkpoint::schema::{
    Axis, Chain, ChainState, Ladder, LadderMode, Level, OutcomeCounts, Round, RoundState,
    TaskRecord, TerminalState,
};
use crate::error::{EscalateError, EscalateResult};
use crate::index::{self, IndexSet};

fn fail(message: impl Into<String>) -> EscalateError {
    EscalateError::checkpoint(PathBuf::new(), message)
}

/// Escape `\`, `\n`, and `\r` in one script argument so it always occupies
/// exactly one physical line (spec.md §4.2, §8 property 7).
fn escape_arg(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_arg(s: &str) -> EscalateResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(fail(format!("invalid escape sequence '\\{other}' in argument"))),
            None => return Err(fail("argument line ends with a dangling '\\'")),
        }
    }
    Ok(out)
}

/// Render a chain plus its rounds as the checkpoint's on-disk text form.
pub fn serialize(chain: &Chain, rounds: &[Round]) -> String {
    let mut out = String::new();

    out.push_str(&format!("CHAIN_ID: {}\n", chain.chain_id));
    out.push_str(&format!("SCRIPT: {}\n", chain.script.display()));
    out.push_str(&format!(
        "CREATED_AT: {}\n",
        chain.created_at.to_rfc3339()
    ));
    out.push_str(&format!("STATE: {}\n", chain.state.label()));
    match &chain.state {
        ChainState::Completed { completed_count } => {
            out.push_str(&format!("COMPLETED_COUNT: {completed_count}\n"));
        }
        ChainState::FailedAtMax {
            oom_residual,
            timeout_residual,
        } => {
            out.push_str(&format!(
                "OOM_RESIDUAL: {}\n",
                index::compress(oom_residual)
            ));
            out.push_str(&format!(
                "TIMEOUT_RESIDUAL: {}\n",
                index::compress(timeout_residual)
            ));
        }
        ChainState::FailedNotRetried { reason } => {
            out.push_str(&format!("FAIL_REASON: {reason}\n"));
        }
        ChainState::Running => {}
    }
    out.push_str(&format!(
        "FULL_INDEX_SET: {}\n",
        index::compress(&chain.full_index_set)
    ));

    out.push_str("ARGS_BEGIN\n");
    for arg in &chain.script_args {
        out.push_str("ARG: ");
        out.push_str(&escape_arg(arg));
        out.push('\n');
    }
    out.push_str("ARGS_END\n");

    write_ladder(&mut out, &chain.ladder);

    for round in rounds {
        write_round(&mut out, round);
    }

    out
}

fn write_level_line(out: &mut String, level: &Level) {
    out.push_str(&format!(
        "LEVEL: partitions={} mem={} time={}\n",
        level.partitions.join(","),
        level.memory,
        level.wall_time
    ));
}

fn write_ladder(out: &mut String, ladder: &Ladder) {
    out.push_str(&format!("LADDER_MODE: {}\n", ladder.mode.as_str()));
    match ladder.mode {
        LadderMode::Levels => {
            out.push_str("LEVELS_BEGIN\n");
            for level in &ladder.levels {
                write_level_line(out, level);
            }
            out.push_str("LEVELS_END\n");
        }
        LadderMode::IndependentAxes => {
            out.push_str("MEMORY_LEVELS_BEGIN\n");
            for level in &ladder.memory_levels {
                write_level_line(out, level);
            }
            out.push_str("MEMORY_LEVELS_END\n");
            out.push_str("TIME_LEVELS_BEGIN\n");
            for level in &ladder.time_levels {
                write_level_line(out, level);
            }
            out.push_str("TIME_LEVELS_END\n");
        }
    }
}

fn write_round(out: &mut String, round: &Round) {
    out.push_str("ROUND_BEGIN\n");
    out.push_str(&format!("ROUND_NO: {}\n", round.round_no));
    out.push_str(&format!("LEVEL_INDEX: {}\n", round.level_index));
    out.push_str(&format!(
        "AXIS: {}\n",
        round.axis.map(|a| a.as_str()).unwrap_or("NONE")
    ));
    out.push_str(&format!("MEMORY: {}\n", round.memory));
    out.push_str(&format!("WALL_TIME: {}\n", round.wall_time));
    out.push_str(&format!("PARTITIONS: {}\n", round.partitions.join(",")));
    out.push_str(&format!("ARRAY_SPEC: {}\n", round.array_spec));
    out.push_str(&format!(
        "INDEX_SET: {}\n",
        index::compress(&round.index_set)
    ));
    out.push_str(&format!("JOB_IDS: {}\n", round.job_ids.join(",")));
    out.push_str(&format!(
        "HANDLER_JOB_ID: {}\n",
        round.handler_job_id.as_deref().unwrap_or("")
    ));
    out.push_str(&format!(
        "WATCHER_JOB_ID: {}\n",
        round.watcher_job_id.as_deref().unwrap_or("")
    ));
    out.push_str(&format!("STATE: {}\n", round.state.as_str()));
    out.push_str(&format!(
        "COUNTS: completed={} oom={} timeout={} other={}\n",
        round.counts.completed, round.counts.oom, round.counts.timeout, round.counts.other
    ));
    for task in &round.tasks {
        write_task(out, task);
    }
    out.push_str("ROUND_END\n");
}

fn write_task(out: &mut String, task: &TaskRecord) {
    out.push_str("TASK_BEGIN\n");
    out.push_str(&format!("INDEX: {}\n", task.index));
    out.push_str(&format!(
        "TERMINAL_STATE: {}\n",
        task.terminal_state.as_str()
    ));
    out.push_str(&format!("EXIT_CODE: {}\n", task.exit_code));
    out.push_str(&format!("ELAPSED_SEC: {}\n", task.elapsed_sec));
    out.push_str(&format!("NODE: {}\n", task.node.as_deref().unwrap_or("")));
    out.push_str(&format!(
        "PEAK_MEMORY_KB: {}\n",
        task.peak_memory_kb.map(|v| v.to_string()).unwrap_or_default()
    ));
    out.push_str(&format!(
        "STDOUT: {}\n",
        task.stdout_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    ));
    out.push_str(&format!(
        "STDERR: {}\n",
        task.stderr_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    ));
    out.push_str("TASK_END\n");
}

/// A cursor over the checkpoint's lines, used by both the header and the
/// round-block parsers below.
struct Lines<'a> {
    lines: std::iter::Peekable<std::vec::IntoIter<&'a str>>,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect::<Vec<_>>().into_iter().peekable(),
        }
    }

    fn next(&mut self) -> EscalateResult<&'a str> {
        self.lines
            .next()
            .ok_or_else(|| fail("unexpected end of checkpoint"))
    }

    fn peek(&mut self) -> Option<&&'a str> {
        self.lines.peek()
    }

    fn expect_kv(&mut self, key: &str) -> EscalateResult<&'a str> {
        let line = self.next()?;
        let prefix = format!("{key}: ");
        line.strip_prefix(&prefix)
            .ok_or_else(|| fail(format!("expected '{key}: ...', got {line:?}")))
    }

    fn expect_line(&mut self, expected: &str) -> EscalateResult<()> {
        let line = self.next()?;
        if line != expected {
            return Err(fail(format!("expected {expected:?}, got {line:?}")));
        }
        Ok(())
    }
}

fn parse_level_line(line: &str) -> EscalateResult<Level> {
    let rest = line
        .strip_prefix("LEVEL: ")
        .ok_or_else(|| fail(format!("malformed level line {line:?}")))?;
    let mut partitions = Vec::new();
    let mut memory = None;
    let mut wall_time = None;
    for token in rest.split(' ') {
        if let Some(v) = token.strip_prefix("partitions=") {
            partitions = v.split(',').map(|s| s.to_string()).collect();
        } else if let Some(v) = token.strip_prefix("mem=") {
            memory = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("time=") {
            wall_time = Some(v.to_string());
        }
    }
    Ok(Level {
        partitions,
        memory: memory.ok_or_else(|| fail("level missing mem="))?,
        wall_time: wall_time.ok_or_else(|| fail("level missing time="))?,
    })
}

fn parse_level_block(lines: &mut Lines, begin: &str, end: &str) -> EscalateResult<Vec<Level>> {
    lines.expect_line(begin)?;
    let mut levels = Vec::new();
    loop {
        match lines.peek() {
            Some(&l) if l == end => {
                lines.next()?;
                break;
            }
            Some(_) => levels.push(parse_level_line(lines.next()?)?),
            None => return Err(fail(format!("missing {end}"))),
        }
    }
    Ok(levels)
}

fn parse_ladder(lines: &mut Lines) -> EscalateResult<Ladder> {
    let mode_str = lines.expect_kv("LADDER_MODE")?;
    let mode = LadderMode::parse(mode_str)
        .ok_or_else(|| fail(format!("unknown ladder mode {mode_str:?}")))?;
    match mode {
        LadderMode::Levels => {
            let levels = parse_level_block(lines, "LEVELS_BEGIN", "LEVELS_END")?;
            Ok(Ladder::levels_mode(levels))
        }
        LadderMode::IndependentAxes => {
            let memory_levels =
                parse_level_block(lines, "MEMORY_LEVELS_BEGIN", "MEMORY_LEVELS_END")?;
            let time_levels = parse_level_block(lines, "TIME_LEVELS_BEGIN", "TIME_LEVELS_END")?;
            Ok(Ladder::independent_axes(memory_levels, time_levels))
        }
    }
}

fn parse_counts(line: &str) -> EscalateResult<OutcomeCounts> {
    let rest = line
        .strip_prefix("COUNTS: ")
        .ok_or_else(|| fail(format!("malformed counts line {line:?}")))?;
    let mut counts = OutcomeCounts::default();
    for token in rest.split(' ') {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| fail(format!("malformed count token {token:?}")))?;
        let value: u32 = value
            .parse()
            .map_err(|_| fail(format!("non-numeric count {value:?}")))?;
        match key {
            "completed" => counts.completed = value,
            "oom" => counts.oom = value,
            "timeout" => counts.timeout = value,
            "other" => counts.other = value,
            _ => return Err(fail(format!("unknown count key {key:?}"))),
        }
    }
    Ok(counts)
}

fn parse_task(lines: &mut Lines) -> EscalateResult<TaskRecord> {
    lines.expect_line("TASK_BEGIN")?;
    let index: u64 = lines
        .expect_kv("INDEX")?
        .parse()
        .map_err(|_| fail("non-numeric task index"))?;
    let terminal_state_str = lines.expect_kv("TERMINAL_STATE")?;
    let terminal_state = TerminalState::parse(terminal_state_str)
        .ok_or_else(|| fail(format!("unknown terminal state {terminal_state_str:?}")))?;
    let exit_code: i32 = lines
        .expect_kv("EXIT_CODE")?
        .parse()
        .map_err(|_| fail("non-numeric exit code"))?;
    let elapsed_sec: u64 = lines
        .expect_kv("ELAPSED_SEC")?
        .parse()
        .map_err(|_| fail("non-numeric elapsed"))?;
    let node = non_empty(lines.expect_kv("NODE")?);
    let peak_memory_kb = non_empty(lines.expect_kv("PEAK_MEMORY_KB")?)
        .map(|s| s.parse::<u64>())
        .transpose()
        .map_err(|_| fail("non-numeric peak memory"))?;
    let stdout_path = non_empty(lines.expect_kv("STDOUT")?).map(PathBuf::from);
    let stderr_path = non_empty(lines.expect_kv("STDERR")?).map(PathBuf::from);
    lines.expect_line("TASK_END")?;

    Ok(TaskRecord {
        index,
        terminal_state,
        exit_code,
        elapsed_sec,
        node,
        peak_memory_kb,
        stdout_path,
        stderr_path,
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_round(lines: &mut Lines) -> EscalateResult<Round> {
    lines.expect_line("ROUND_BEGIN")?;
    let round_no: u32 = lines
        .expect_kv("ROUND_NO")?
        .parse()
        .map_err(|_| fail("non-numeric round_no"))?;
    let level_index: usize = lines
        .expect_kv("LEVEL_INDEX")?
        .parse()
        .map_err(|_| fail("non-numeric level_index"))?;
    let axis_str = lines.expect_kv("AXIS")?;
    let axis = if axis_str == "NONE" {
        None
    } else {
        Some(Axis::parse(axis_str).ok_or_else(|| fail(format!("unknown axis {axis_str:?}")))?)
    };
    let memory = lines.expect_kv("MEMORY")?.to_string();
    let wall_time = lines.expect_kv("WALL_TIME")?.to_string();
    let partitions = lines
        .expect_kv("PARTITIONS")?
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let array_spec = lines.expect_kv("ARRAY_SPEC")?.to_string();
    let index_set = index::expand(lines.expect_kv("INDEX_SET")?)?;
    let job_ids: Vec<String> = lines
        .expect_kv("JOB_IDS")?
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let handler_job_id = non_empty(lines.expect_kv("HANDLER_JOB_ID")?);
    let watcher_job_id = non_empty(lines.expect_kv("WATCHER_JOB_ID")?);
    let state_str = lines.expect_kv("STATE")?;
    let state =
        RoundState::parse(state_str).ok_or_else(|| fail(format!("unknown round state {state_str:?}")))?;
    let counts = parse_counts(lines.next()?)?;

    let mut tasks = Vec::new();
    loop {
        match lines.peek() {
            Some(&"TASK_BEGIN") => tasks.push(parse_task(lines)?),
            Some(&"ROUND_END") => {
                lines.next()?;
                break;
            }
            _ => return Err(fail("expected TASK_BEGIN or ROUND_END")),
        }
    }

    Ok(Round {
        round_no,
        level_index,
        axis,
        memory,
        wall_time,
        partitions,
        array_spec,
        index_set,
        job_ids,
        handler_job_id,
        watcher_job_id,
        state,
        counts,
        tasks,
    })
}

/// Parse the checkpoint's on-disk text form back into a chain plus rounds.
pub fn parse(text: &str) -> EscalateResult<(Chain, Vec<Round>)> {
    let mut lines = Lines::new(text);

    let chain_id = lines.expect_kv("CHAIN_ID")?.to_string();
    let script = PathBuf::from(lines.expect_kv("SCRIPT")?);
    let created_at_str = lines.expect_kv("CREATED_AT")?;
    let created_at: DateTime<Utc> = created_at_str
        .parse()
        .map_err(|_| fail(format!("unparseable timestamp {created_at_str:?}")))?;
    let state_label = lines.expect_kv("STATE")?.to_string();

    let state = match state_label.as_str() {
        "RUNNING" => ChainState::Running,
        "COMPLETED" => {
            let completed_count: u32 = lines
                .expect_kv("COMPLETED_COUNT")?
                .parse()
                .map_err(|_| fail("non-numeric completed_count"))?;
            ChainState::Completed { completed_count }
        }
        "FAILED_AT_MAX" => {
            let oom_residual = index::expand(lines.expect_kv("OOM_RESIDUAL")?)?;
            let timeout_residual = index::expand(lines.expect_kv("TIMEOUT_RESIDUAL")?)?;
            ChainState::FailedAtMax {
                oom_residual,
                timeout_residual,
            }
        }
        "FAILED_NOT_RETRIED" => {
            let reason = lines.expect_kv("FAIL_REASON")?.to_string();
            ChainState::FailedNotRetried { reason }
        }
        other => return Err(fail(format!("unknown chain state {other:?}"))),
    };

    let full_index_set = index::expand(lines.expect_kv("FULL_INDEX_SET")?)?;

    lines.expect_line("ARGS_BEGIN")?;
    let mut script_args = Vec::new();
    loop {
        match lines.peek() {
            Some(&"ARGS_END") => {
                lines.next()?;
                break;
            }
            Some(_) => {
                let line = lines.next()?;
                let encoded = line
                    .strip_prefix("ARG: ")
                    .ok_or_else(|| fail(format!("expected 'ARG: ...', got {line:?}")))?;
                script_args.push(unescape_arg(encoded)?);
            }
            None => return Err(fail("missing ARGS_END")),
        }
    }

    let ladder = parse_ladder(&mut lines)?;

    let mut rounds = Vec::new();
    while let Some(&"ROUND_BEGIN") = lines.peek() {
        rounds.push(parse_round(&mut lines)?);
    }

    let chain = Chain {
        chain_id,
        script,
        script_args,
        full_index_set,
        ladder,
        created_at,
        state,
    };

    Ok((chain, rounds))
}
